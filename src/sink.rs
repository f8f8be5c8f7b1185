//! Sink engine: bounded frame queue drained by one worker thread
//!
//! Producers call [`VideoSink::submit`] from their own threads. When the
//! queue is full the [`BackpressurePolicy`] decides whether the producer waits
//! for space or the oldest queued frame is evicted. The worker runs the
//! block's [`FrameProcessor`] outside the queue lock.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::block::{Block, BlockCore, BlockState, Capabilities, ParamStore};
use crate::clock;
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, FrameInfo, PixelFormat};
use crate::worker;

pub const DEFAULT_QUEUE_DEPTH: usize = 10;
pub const MAX_QUEUE_DEPTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Producer waits until the worker frees a slot.
    #[default]
    Block,
    /// Oldest queued frame is discarded and counted as dropped.
    DropOldest,
}

/// Sink capability as seen by the orchestrator.
pub trait VideoSink: Send + Sync {
    fn submit(&self, frame: Frame) -> Result<()>;
    fn input_format(&self) -> FrameInfo;
    fn set_input_format(&self, format: FrameInfo) -> Result<()>;
    fn queue_depth(&self) -> usize;
    fn max_queue_depth(&self) -> usize;
    fn set_max_queue_depth(&self, depth: usize) -> Result<()>;
    fn policy(&self) -> BackpressurePolicy;
    fn set_policy(&self, policy: BackpressurePolicy);
    fn supports_format(&self, format: PixelFormat) -> bool;
    fn supported_formats(&self) -> Vec<PixelFormat>;
}

/// Consumes frames on the sink's worker thread.
pub trait FrameProcessor: Send + 'static {
    fn supports_format(&self, _format: PixelFormat) -> bool {
        true
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        PixelFormat::ALL
            .into_iter()
            .filter(|f| self.supports_format(*f))
            .collect()
    }

    fn configure(&mut self, _params: &ParamStore, _format: &FrameInfo) -> Result<()> {
        Ok(())
    }

    /// Handle one frame. An error drops this frame only.
    fn process(&mut self, frame: &Frame) -> Result<()>;
}

/// Queue half of a sink.
pub struct SinkEngine {
    core: Arc<BlockCore>,
    queue: Mutex<VecDeque<Frame>>,
    not_empty: Condvar,
    not_full: Condvar,
    stopping: AtomicBool,
    max_depth: AtomicUsize,
    drop_oldest: AtomicBool,
}

impl SinkEngine {
    pub fn new(core: Arc<BlockCore>) -> Self {
        Self {
            core,
            queue: Mutex::new(VecDeque::with_capacity(DEFAULT_QUEUE_DEPTH)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            stopping: AtomicBool::new(false),
            max_depth: AtomicUsize::new(DEFAULT_QUEUE_DEPTH),
            drop_oldest: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> &BlockCore {
        &self.core
    }

    pub fn submit(&self, frame: Frame) -> Result<()> {
        if !frame.is_valid() || frame.size() == 0 {
            warn!(block = %self.core.name(), "rejecting empty frame");
            return Err(PipelineError::Rejected("empty frame".into()));
        }
        let state = self.core.state();
        if state != BlockState::Running {
            return Err(PipelineError::Rejected(format!(
                "sink '{}' is {state}",
                self.core.name()
            )));
        }

        let mut queue = self.queue.lock();
        loop {
            if self.is_stopping() {
                return Err(PipelineError::Rejected("sink is stopping".into()));
            }
            if queue.len() < self.max_queue_depth() {
                break;
            }
            // Policy is re-read after every wake-up.
            match self.policy() {
                BackpressurePolicy::DropOldest => {
                    queue.pop_front();
                    self.core.record_dropped();
                    debug!(block = %self.core.name(), "queue full, dropped oldest frame");
                }
                BackpressurePolicy::Block => self.not_full.wait(&mut queue),
            }
        }

        queue.push_back(frame);
        self.core.set_queue_depth(queue.len());
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn max_queue_depth(&self) -> usize {
        self.max_depth.load(Ordering::Acquire)
    }

    pub fn set_max_queue_depth(&self, depth: usize) -> Result<()> {
        if !(1..=MAX_QUEUE_DEPTH).contains(&depth) {
            return Err(PipelineError::InvalidParameter {
                key: "queue_depth".into(),
                reason: format!("{depth} not in [1, {MAX_QUEUE_DEPTH}]"),
            });
        }
        let _queue = self.queue.lock();
        self.max_depth.store(depth, Ordering::Release);
        self.not_full.notify_all();
        Ok(())
    }

    pub fn policy(&self) -> BackpressurePolicy {
        if self.drop_oldest.load(Ordering::Acquire) {
            BackpressurePolicy::DropOldest
        } else {
            BackpressurePolicy::Block
        }
    }

    pub fn set_policy(&self, policy: BackpressurePolicy) {
        let _queue = self.queue.lock();
        self.drop_oldest
            .store(policy == BackpressurePolicy::DropOldest, Ordering::Release);
        // Waiting producers re-check under the new policy.
        self.not_full.notify_all();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Clear the stop flag before a worker is started.
    pub(crate) fn arm(&self) {
        let _queue = self.queue.lock();
        self.stopping.store(false, Ordering::Release);
    }

    /// Set the stop flag and wake both producers and the worker.
    pub(crate) fn halt(&self) {
        let _queue = self.queue.lock();
        self.stopping.store(true, Ordering::Release);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Drop anything left after the worker exited. Each frame counts as a drop.
    pub(crate) fn discard(&self) -> usize {
        let mut queue = self.queue.lock();
        let residue = queue.len();
        queue.clear();
        self.core.set_queue_depth(0);
        for _ in 0..residue {
            self.core.record_dropped();
        }
        residue
    }

    /// Block until a frame is available; `None` once stopping.
    fn next_frame(&self) -> Option<Frame> {
        let mut queue = self.queue.lock();
        loop {
            if self.is_stopping() {
                return None;
            }
            if let Some(frame) = queue.pop_front() {
                self.core.set_queue_depth(queue.len());
                self.not_full.notify_one();
                return Some(frame);
            }
            self.not_empty.wait(&mut queue);
        }
    }
}

/// Block with sink capability built around a [`FrameProcessor`].
pub struct SinkBlock {
    core: Arc<BlockCore>,
    engine: Arc<SinkEngine>,
    processor: Arc<Mutex<Box<dyn FrameProcessor>>>,
    input_format: RwLock<FrameInfo>,
    cpu_core: RwLock<Option<usize>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SinkBlock {
    pub fn new(type_name: impl Into<String>, processor: impl FrameProcessor) -> Self {
        let core = Arc::new(BlockCore::new(type_name));
        let engine = Arc::new(SinkEngine::new(core.clone()));
        Self {
            core,
            engine,
            processor: Arc::new(Mutex::new(Box::new(processor))),
            input_format: RwLock::new(FrameInfo::new(640, 480, PixelFormat::Rgb24)),
            cpu_core: RwLock::new(None),
            thread: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<SinkEngine> {
        &self.engine
    }

    fn apply_configuration(&self) -> Result<()> {
        let params = self.core.params();
        let depth = params
            .parse::<usize>("queue_depth")?
            .unwrap_or(DEFAULT_QUEUE_DEPTH);
        let blocking = params.parse_bool("blocking")?.unwrap_or(true);
        let cpu_core = params.parse::<usize>("cpu_core")?;

        let format = self.input_format.read().clone();
        self.processor.lock().configure(params, &format)?;

        self.engine.set_max_queue_depth(depth)?;
        self.engine.set_policy(if blocking {
            BackpressurePolicy::Block
        } else {
            BackpressurePolicy::DropOldest
        });
        *self.cpu_core.write() = cpu_core;
        Ok(())
    }

    fn halt_worker(&self) {
        self.engine.halt();
        if let Some(handle) = self.thread.lock().take() {
            worker::join_logged(handle);
        }
        let residue = self.engine.discard();
        if residue > 0 {
            debug!(block = %self.core.name(), residue, "discarded queued frames");
        }
    }
}

impl Block for SinkBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SINK
    }

    #[instrument(skip(self), fields(block = %self.core.name()))]
    fn configure(&self) -> Result<()> {
        self.core.require(
            "configure",
            &[BlockState::Uninitialized, BlockState::Initialized],
        )?;
        if let Err(e) = self.apply_configuration() {
            self.core.set_error(e.to_string());
            return Err(e);
        }
        self.core.set_state(BlockState::Initialized);
        info!(
            block = %self.core.name(),
            queue_depth = self.engine.max_queue_depth(),
            policy = ?self.engine.policy(),
            "sink initialized"
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let from = self.core.transition(
            "start",
            &[BlockState::Initialized, BlockState::Stopped],
            BlockState::Starting,
        )?;

        self.engine.arm();
        let drain = DrainLoop {
            engine: self.engine.clone(),
            processor: self.processor.clone(),
        };
        let thread_name = format!("vpipe-sink-{}", self.core.name());
        match worker::spawn_named(thread_name, *self.cpu_core.read(), move || drain.run()) {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                self.core.settle(BlockState::Starting, BlockState::Running);
                Ok(())
            }
            Err(e) => {
                self.core.settle(BlockState::Starting, from);
                Err(e)
            }
        }
    }

    fn stop(&self) -> Result<()> {
        self.core
            .transition("stop", &[BlockState::Running], BlockState::Stopping)?;
        self.halt_worker();
        self.core.settle(BlockState::Stopping, BlockState::Stopped);
        Ok(())
    }

    fn shutdown(&self) {
        self.halt_worker();
        for state in [BlockState::Starting, BlockState::Running, BlockState::Stopping] {
            self.core.settle(state, BlockState::Stopped);
        }
    }

    fn as_sink(&self) -> Option<&dyn VideoSink> {
        Some(self)
    }
}

impl VideoSink for SinkBlock {
    fn submit(&self, frame: Frame) -> Result<()> {
        self.engine.submit(frame)
    }

    fn input_format(&self) -> FrameInfo {
        self.input_format.read().clone()
    }

    fn set_input_format(&self, format: FrameInfo) -> Result<()> {
        if self.core.is_running() {
            return Err(PipelineError::InvalidState {
                operation: "set_input_format",
                state: BlockState::Running,
            });
        }
        if !self.supports_format(format.format) {
            return Err(PipelineError::InvalidParameter {
                key: "format".into(),
                reason: format!("{} not supported", format.format),
            });
        }
        info!(block = %self.core.name(), format = %format, "input format set");
        *self.input_format.write() = format;
        Ok(())
    }

    fn queue_depth(&self) -> usize {
        self.engine.queue_depth()
    }

    fn max_queue_depth(&self) -> usize {
        self.engine.max_queue_depth()
    }

    fn set_max_queue_depth(&self, depth: usize) -> Result<()> {
        self.engine.set_max_queue_depth(depth)
    }

    fn policy(&self) -> BackpressurePolicy {
        self.engine.policy()
    }

    fn set_policy(&self, policy: BackpressurePolicy) {
        self.engine.set_policy(policy)
    }

    fn supports_format(&self, format: PixelFormat) -> bool {
        self.processor.lock().supports_format(format)
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        self.processor.lock().supported_formats()
    }
}

impl Drop for SinkBlock {
    fn drop(&mut self) {
        self.halt_worker();
    }
}

struct DrainLoop {
    engine: Arc<SinkEngine>,
    processor: Arc<Mutex<Box<dyn FrameProcessor>>>,
}

impl DrainLoop {
    fn run(self) {
        let core = self.engine.core();
        let name = core.name();
        debug!(block = %name, "sink worker started");

        while let Some(frame) = self.engine.next_frame() {
            if core.state() == BlockState::Error {
                core.record_dropped();
                continue;
            }

            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.processor.lock().process(&frame)
            }));
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok(())) => {
                    core.record_processed(frame.size(), latency_of(&frame, elapsed));
                    metrics::histogram!("vpipe_sink_process_seconds", "block" => name.clone())
                        .record(elapsed.as_secs_f64());
                }
                Ok(Err(e)) => {
                    core.record_dropped();
                    warn!(block = %name, error = %e, "failed to process frame");
                }
                Err(payload) => {
                    core.record_dropped();
                    core.set_error(format!(
                        "frame processor panicked: {}",
                        worker::panic_message(&payload)
                    ));
                }
            }
        }

        debug!(block = %name, "sink worker stopped");
    }
}

/// Capture-to-consumption time when the frame carries a capture stamp,
/// otherwise the time spent in the processor.
fn latency_of(frame: &Frame, processing: Duration) -> Duration {
    match frame.info().timestamp_us {
        0 => processing,
        ts => clock::since_us(ts),
    }
}
