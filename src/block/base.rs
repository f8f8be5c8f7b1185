//! State shared by every block regardless of its capabilities

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::block::params::ParamStore;
use crate::block::stats::{BlockStats, StatsRecorder};
use crate::block::BlockState;
use crate::error::{PipelineError, Result};

/// Called synchronously every time a block records an error.
pub type ErrorCallback = Arc<dyn Fn(&BlockCore, &str) + Send + Sync>;

pub struct BlockCore {
    type_name: String,
    name: RwLock<String>,
    state: AtomicU8,
    params: ParamStore,
    stats: Mutex<StatsRecorder>,
    last_error: Mutex<String>,
    error_callback: RwLock<Option<ErrorCallback>>,
}

impl BlockCore {
    pub fn new(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: RwLock::new(type_name.clone()),
            type_name,
            state: AtomicU8::new(BlockState::Uninitialized as u8),
            params: ParamStore::new(),
            stats: Mutex::new(StatsRecorder::default()),
            last_error: Mutex::new(String::new()),
            error_callback: RwLock::new(None),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == BlockState::Running
    }

    /// Unconditional store, for transitions that need no legality check.
    pub fn set_state(&self, state: BlockState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `to` if the current state is one of `from`. On refusal the
    /// state is left as it was and the error names it.
    pub fn transition(
        &self,
        operation: &'static str,
        from: &[BlockState],
        to: BlockState,
    ) -> Result<BlockState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                from.contains(&BlockState::from_u8(raw))
                    .then_some(to as u8)
            })
            .map(BlockState::from_u8)
            .map_err(|raw| PipelineError::InvalidState {
                operation,
                state: BlockState::from_u8(raw),
            })
    }

    /// Fails unless the current state is one of `allowed`; never changes it.
    pub fn require(&self, operation: &'static str, allowed: &[BlockState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(PipelineError::InvalidState { operation, state })
        }
    }

    /// Finish a transition started by [`transition`]. An error recorded in
    /// the meantime wins.
    pub fn settle(&self, from: BlockState, to: BlockState) {
        let _ = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if to == BlockState::Running || to == BlockState::Stopped {
            info!(block = %self.name(), state = %self.state(), "block state changed");
        }
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.error_callback.write() = Some(callback);
    }

    pub fn clear_error_callback(&self) {
        *self.error_callback.write() = None;
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    /// Record `message`, force the error state and notify the callback.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        *self.last_error.lock() = message.clone();
        self.set_state(BlockState::Error);
        error!(block = %self.name(), error = %message, "block entered error state");

        let callback = self.error_callback.read().clone();
        if let Some(callback) = callback {
            callback(self, &message);
        }
    }

    pub fn stats(&self) -> BlockStats {
        self.stats.lock().snapshot()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = StatsRecorder::default();
    }

    pub fn record_processed(&self, bytes: usize, latency: Duration) {
        self.stats.lock().processed(bytes, latency);
    }

    pub fn record_dropped(&self) {
        self.stats.lock().dropped();
        metrics::counter!("vpipe_frames_dropped_total", "block" => self.name()).increment(1);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.stats.lock().set_queue_depth(depth);
    }
}

impl std::fmt::Debug for BlockCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCore")
            .field("type", &self.type_name)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn refused_transition_keeps_state() {
        let core = BlockCore::new("Test");
        let err = core
            .transition("start", &[BlockState::Initialized], BlockState::Starting)
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::InvalidState {
                operation: "start",
                state: BlockState::Uninitialized
            }
        );
        assert_eq!(core.state(), BlockState::Uninitialized);
    }

    #[test]
    fn settle_does_not_override_error() {
        let core = BlockCore::new("Test");
        core.set_state(BlockState::Stopping);
        core.set_error("boom");
        core.settle(BlockState::Stopping, BlockState::Stopped);
        assert_eq!(core.state(), BlockState::Error);
        assert_eq!(core.last_error(), "boom");
    }

    #[test]
    fn error_callback_runs_once_per_call() {
        let core = BlockCore::new("Test");
        core.set_name("cam0");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        core.set_error_callback(Arc::new(move |block, msg| {
            assert_eq!(block.name(), "cam0");
            assert!(msg.starts_with("fault"));
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        core.set_error("fault 1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        core.set_error("fault 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(core.state(), BlockState::Error);
        assert_eq!(core.last_error(), "fault 2");
    }

    #[test]
    fn reset_clears_counters() {
        let core = BlockCore::new("Test");
        core.record_processed(10, Duration::from_millis(1));
        core.record_dropped();
        core.set_queue_depth(3);
        core.reset_stats();
        assert_eq!(core.stats().frames_processed, 0);
        assert_eq!(core.stats().frames_dropped, 0);
        assert_eq!(core.stats().queue_depth, 0);
    }
}
