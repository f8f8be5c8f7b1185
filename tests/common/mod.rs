#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vpipe::block::{Block, BlockCore, BlockState, Capabilities};
use vpipe::sink::FrameProcessor;
use vpipe::{Frame, FrameBuffer, FrameInfo, PipelineError, PixelFormat, Result};

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Small RGB frame whose every byte is `tag`.
pub fn tagged(tag: u8) -> Frame {
    let mut buffer = FrameBuffer::for_info(FrameInfo::new(2, 1, PixelFormat::Rgb24))
        .expect("frame allocation");
    buffer.data_mut().fill(tag);
    buffer.share()
}

/// Holds processors until opened.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open() -> Self {
        let gate = Gate::default();
        gate.release();
        gate
    }

    pub fn release(&self) {
        let (open, cv) = &*self.state;
        *open.lock() = true;
        cv.notify_all();
    }

    fn pass(&self) {
        let (open, cv) = &*self.state;
        let mut open = open.lock();
        while !*open {
            cv.wait(&mut open);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seen {
    pub tag: u8,
    pub sequence: u64,
    pub addr: usize,
}

pub type SeenLog = Arc<Mutex<Vec<Seen>>>;

/// Records every frame it is handed, after passing its gate.
pub struct Recorder {
    gate: Gate,
    seen: SeenLog,
    only: Option<PixelFormat>,
}

impl Recorder {
    pub fn new() -> (Self, SeenLog) {
        Self::gated(Gate::open())
    }

    pub fn gated(gate: Gate) -> (Self, SeenLog) {
        let seen = SeenLog::default();
        (
            Recorder {
                gate,
                seen: seen.clone(),
                only: None,
            },
            seen,
        )
    }

    pub fn only(mut self, format: PixelFormat) -> Self {
        self.only = Some(format);
        self
    }
}

impl FrameProcessor for Recorder {
    fn supports_format(&self, format: PixelFormat) -> bool {
        self.only.map_or(true, |only| only == format)
    }

    fn process(&mut self, frame: &Frame) -> Result<()> {
        self.gate.pass();
        self.seen.lock().push(Seen {
            tag: frame.data()[0],
            sequence: frame.info().sequence,
            addr: frame.data().as_ptr() as usize,
        });
        Ok(())
    }
}

pub fn tags(seen: &SeenLog) -> Vec<u8> {
    seen.lock().iter().map(|s| s.tag).collect()
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Block with no frame path that records lifecycle calls.
pub struct Tracked {
    core: BlockCore,
    caps: Capabilities,
    log: EventLog,
    refuse_start: bool,
}

impl Tracked {
    pub fn new(type_name: &str, caps: Capabilities, log: EventLog) -> Self {
        Self {
            core: BlockCore::new(type_name),
            caps,
            log,
            refuse_start: false,
        }
    }

    pub fn refusing_start(mut self) -> Self {
        self.refuse_start = true;
        self
    }

    fn record(&self, event: &str) {
        self.log.lock().push(format!("{event}:{}", self.core.name()));
    }
}

impl Block for Tracked {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn configure(&self) -> Result<()> {
        self.core.require(
            "configure",
            &[BlockState::Uninitialized, BlockState::Initialized],
        )?;
        self.core.set_state(BlockState::Initialized);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.refuse_start {
            return Err(PipelineError::Block {
                block: self.core.name(),
                reason: "device busy".into(),
            });
        }
        self.core.transition(
            "start",
            &[BlockState::Initialized, BlockState::Stopped],
            BlockState::Running,
        )?;
        self.record("start");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.core
            .transition("stop", &[BlockState::Running], BlockState::Stopped)?;
        self.record("stop");
        Ok(())
    }

    fn shutdown(&self) {
        self.core.settle(BlockState::Running, BlockState::Stopped);
    }
}
