//! Block lifecycle: states, capabilities and the trait every block implements

pub mod base;
pub mod params;
pub mod stats;

use std::fmt;

use crate::error::Result;
use crate::sink::VideoSink;
use crate::source::VideoSource;

pub use self::base::{BlockCore, ErrorCallback};
pub use self::params::{BlockParams, ParamStore};
pub use self::stats::BlockStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockState {
    Uninitialized = 0,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl BlockState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BlockState::Uninitialized,
            1 => BlockState::Initialized,
            2 => BlockState::Starting,
            3 => BlockState::Running,
            4 => BlockState::Stopping,
            5 => BlockState::Stopped,
            _ => BlockState::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockState::Uninitialized => "UNINITIALIZED",
            BlockState::Initialized => "INITIALIZED",
            BlockState::Starting => "STARTING",
            BlockState::Running => "RUNNING",
            BlockState::Stopping => "STOPPING",
            BlockState::Stopped => "STOPPED",
            BlockState::Error => "ERROR",
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roles a block declares. The orchestrator trusts this declaration for
/// start/stop ordering and wiring instead of inspecting concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub source: bool,
    pub sink: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        source: false,
        sink: false,
    };
    pub const SOURCE: Capabilities = Capabilities {
        source: true,
        sink: false,
    };
    pub const SINK: Capabilities = Capabilities {
        source: false,
        sink: true,
    };
    pub const FILTER: Capabilities = Capabilities {
        source: true,
        sink: true,
    };
}

/// A named, typed processing unit with its own lifecycle.
///
/// `configure` reads the block's [`ParamStore`] and is only legal before the
/// first start. `start` is legal from `Initialized` or `Stopped`, `stop` only
/// from `Running`; refused calls leave the state untouched. `shutdown`
/// releases threads from any state and may be called repeatedly.
pub trait Block: Send + Sync {
    fn core(&self) -> &BlockCore;

    fn capabilities(&self) -> Capabilities;

    fn configure(&self) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn shutdown(&self);

    fn as_source(&self) -> Option<&dyn VideoSource> {
        None
    }

    fn as_sink(&self) -> Option<&dyn VideoSink> {
        None
    }

    fn name(&self) -> String {
        self.core().name()
    }

    fn state(&self) -> BlockState {
        self.core().state()
    }
}

impl fmt::Debug for dyn Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.name())
            .field("type", &self.core().type_name())
            .field("state", &self.state())
            .finish()
    }
}
