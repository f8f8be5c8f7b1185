//! Source engine: rate-limited frame emission from one generation thread
//!
//! A [`SourceBlock`] wraps a [`FrameGenerator`]. While running, its thread
//! waits until the admission check passes, asks the generator for a frame and
//! emits it through [`SourceEngine::emit`], which stamps the capture time and
//! sequence number before the frame is shared with the consumer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::block::{Block, BlockCore, BlockState, Capabilities, ParamStore};
use crate::clock;
use crate::error::{PipelineError, Result};
use crate::frame::{BufferPool, Frame, FrameBuffer, FrameInfo, PixelFormat};
use crate::worker::{self, StopSignal};

pub const MAX_FRAME_RATE: f64 = 1000.0;
pub const DEFAULT_FRAME_RATE: f64 = 30.0;
pub const DEFAULT_BUFFER_COUNT: usize = 3;

const NEVER: u64 = u64::MAX;

/// Downstream frame-receiving function installed by the orchestrator.
pub type FrameConsumer = Box<dyn Fn(Frame) + Send + Sync>;

/// Source capability as seen by the orchestrator.
pub trait VideoSource: Send + Sync {
    fn set_consumer(&self, consumer: FrameConsumer);
    fn clear_consumer(&self);
    fn has_consumer(&self) -> bool;
    fn output_format(&self) -> FrameInfo;
    fn set_output_format(&self, format: FrameInfo) -> Result<()>;
    fn frame_rate(&self) -> f64;
    fn set_frame_rate(&self, fps: f64) -> Result<()>;
    fn supports_format(&self, format: PixelFormat) -> bool;
    fn supported_formats(&self) -> Vec<PixelFormat>;
}

/// Produces frames on the source's generation thread.
pub trait FrameGenerator: Send + 'static {
    fn supports_format(&self, format: PixelFormat) -> bool;

    fn supported_formats(&self) -> Vec<PixelFormat> {
        PixelFormat::ALL
            .into_iter()
            .filter(|f| self.supports_format(*f))
            .collect()
    }

    /// Read generator-specific parameters. `format` is the output format the
    /// source settled on.
    fn configure(&mut self, _params: &ParamStore, _format: &FrameInfo) -> Result<()> {
        Ok(())
    }

    /// Produce the next frame in `format`. `Ok(None)` means nothing is ready.
    /// `pool` hands out recyclable producer-owned frames.
    fn generate(&mut self, format: &FrameInfo, pool: &BufferPool) -> Result<Option<FrameBuffer>>;
}

/// Emission half of a source: consumer slot, rate limiting and stamping.
/// Exactly one thread is expected to call [`emit`](Self::emit).
pub struct SourceEngine {
    core: Arc<BlockCore>,
    consumer: ArcSwapOption<FrameConsumer>,
    fps_bits: AtomicU64,
    interval_us: AtomicU64,
    last_emit_us: AtomicU64,
    sequence: AtomicU64,
}

impl SourceEngine {
    pub fn new(core: Arc<BlockCore>) -> Self {
        let engine = Self {
            core,
            consumer: ArcSwapOption::empty(),
            fps_bits: AtomicU64::new(0),
            interval_us: AtomicU64::new(0),
            last_emit_us: AtomicU64::new(NEVER),
            sequence: AtomicU64::new(0),
        };
        engine.store_rate(DEFAULT_FRAME_RATE);
        engine
    }

    pub fn core(&self) -> &BlockCore {
        &self.core
    }

    pub fn set_consumer(&self, consumer: FrameConsumer) {
        self.consumer.store(Some(Arc::new(consumer)));
    }

    pub fn clear_consumer(&self) {
        self.consumer.store(None);
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.load().is_some()
    }

    pub fn frame_rate(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Acquire))
    }

    pub fn set_frame_rate(&self, fps: f64) -> Result<()> {
        if !(fps > 0.0 && fps <= MAX_FRAME_RATE) {
            return Err(PipelineError::InvalidParameter {
                key: "fps".into(),
                reason: format!("{fps} not in (0, {MAX_FRAME_RATE}]"),
            });
        }
        self.store_rate(fps);
        Ok(())
    }

    fn store_rate(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Release);
        self.interval_us
            .store((1_000_000.0 / fps) as u64, Ordering::Release);
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(self.interval_us.load(Ordering::Acquire))
    }

    /// Time left before the next emission is admitted.
    pub fn time_until_admission(&self) -> Duration {
        let last = self.last_emit_us.load(Ordering::Acquire);
        if last == NEVER {
            return Duration::ZERO;
        }
        let due = last.saturating_add(self.interval_us.load(Ordering::Acquire));
        Duration::from_micros(due.saturating_sub(clock::now_us()))
    }

    /// Has at least one interval passed since the last successful emission?
    pub fn should_emit(&self) -> bool {
        self.time_until_admission().is_zero()
    }

    /// Forget the last emission time so the next frame is admitted at once.
    pub fn reset_admission(&self) {
        self.last_emit_us.store(NEVER, Ordering::Release);
    }

    /// Stamp and deliver a frame. Returns whether the consumer received it.
    pub fn emit(&self, mut frame: FrameBuffer) -> bool {
        let Some(consumer) = self.consumer.load_full() else {
            return false;
        };
        if !self.should_emit() {
            self.core.record_dropped();
            return false;
        }

        let now = clock::now_us();
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        frame.stamp(now, sequence);
        self.last_emit_us.store(now, Ordering::Release);

        let bytes = frame.size();
        let handoff = Instant::now();
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| consumer(frame.share())));
        if let Err(payload) = delivered {
            self.core.set_error(format!(
                "frame consumer panicked: {}",
                worker::panic_message(&payload)
            ));
            return false;
        }
        self.core.record_processed(bytes, handoff.elapsed());
        true
    }

    /// Sequence number of the most recent emission.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }
}

struct SourceSettings {
    pool: Option<BufferPool>,
    cpu_core: Option<usize>,
}

/// Block with source capability built around a [`FrameGenerator`].
pub struct SourceBlock {
    core: Arc<BlockCore>,
    engine: Arc<SourceEngine>,
    generator: Arc<Mutex<Box<dyn FrameGenerator>>>,
    format: Arc<RwLock<FrameInfo>>,
    settings: RwLock<SourceSettings>,
    stop: StopSignal,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SourceBlock {
    pub fn new(type_name: impl Into<String>, generator: impl FrameGenerator) -> Self {
        let core = Arc::new(BlockCore::new(type_name));
        let engine = Arc::new(SourceEngine::new(core.clone()));
        Self {
            core,
            engine,
            generator: Arc::new(Mutex::new(Box::new(generator))),
            format: Arc::new(RwLock::new(FrameInfo::new(640, 480, PixelFormat::Rgb24))),
            settings: RwLock::new(SourceSettings {
                pool: None,
                cpu_core: None,
            }),
            stop: StopSignal::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<SourceEngine> {
        &self.engine
    }

    /// Pool created by the last successful configure.
    pub fn pool(&self) -> Option<BufferPool> {
        self.settings.read().pool.clone()
    }

    /// Emit a frame produced outside the generation thread, e.g. from a
    /// driver callback.
    pub fn emit(&self, frame: FrameBuffer) -> bool {
        self.engine.emit(frame)
    }

    fn parse_format(&self, params: &ParamStore) -> Result<FrameInfo> {
        let mut format = self.format.read().clone();
        if let Some(width) = params.parse::<u32>("width")? {
            format.width = width;
        }
        if let Some(height) = params.parse::<u32>("height")? {
            format.height = height;
        }
        if let Some(pixel_format) = params.parse::<PixelFormat>("format")? {
            format.format = pixel_format;
        }
        if format.width == 0 || format.height == 0 {
            return Err(PipelineError::InvalidParameter {
                key: "width/height".into(),
                reason: format!("{}x{} is empty", format.width, format.height),
            });
        }
        format.stride = format.format.default_stride(format.width);
        if !self.generator.lock().supports_format(format.format) {
            return Err(PipelineError::InvalidParameter {
                key: "format".into(),
                reason: format!("{} not supported by {}", format.format, self.core.type_name()),
            });
        }
        Ok(format)
    }

    fn apply_configuration(&self) -> Result<()> {
        let params = self.core.params();
        let format = self.parse_format(params)?;
        let fps = params.parse::<f64>("fps")?;
        if let Some(fps) = fps {
            if !(fps > 0.0 && fps <= MAX_FRAME_RATE) {
                return Err(PipelineError::InvalidParameter {
                    key: "fps".into(),
                    reason: format!("{fps} not in (0, {MAX_FRAME_RATE}]"),
                });
            }
        }
        let buffer_count = params
            .parse::<usize>("buffer_count")?
            .unwrap_or(DEFAULT_BUFFER_COUNT);
        let pool = BufferPool::new(buffer_count)?;
        let cpu_core = params.parse::<usize>("cpu_core")?;

        self.generator.lock().configure(params, &format)?;

        if let Some(fps) = fps {
            self.engine.set_frame_rate(fps)?;
        }
        *self.format.write() = format;
        *self.settings.write() = SourceSettings {
            pool: Some(pool),
            cpu_core,
        };
        Ok(())
    }

    fn join_thread(&self) {
        if let Some(handle) = self.thread.lock().take() {
            worker::join_logged(handle);
        }
    }
}

impl Block for SourceBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SOURCE
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
            format = %self.format.read(),
            fps = self.engine.frame_rate(),
            "source initialized"
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let from = self.core.transition(
            "start",
            &[BlockState::Initialized, BlockState::Stopped],
            BlockState::Starting,
        )?;

        let (pool, cpu_core) = {
            let settings = self.settings.read();
            (settings.pool.clone(), settings.cpu_core)
        };
        let pool = match pool.map_or_else(|| BufferPool::new(DEFAULT_BUFFER_COUNT), Ok) {
            Ok(pool) => pool,
            Err(e) => {
                self.core.settle(BlockState::Starting, from);
                return Err(e);
            }
        };

        self.stop.reset();
        self.engine.reset_admission();
        let generation = GenerationLoop {
            engine: self.engine.clone(),
            generator: self.generator.clone(),
            format: self.format.clone(),
            pool,
            stop: self.stop.clone(),
        };

        let thread_name = format!("vpipe-src-{}", self.core.name());
        match worker::spawn_named(thread_name, cpu_core, move || generation.run()) {
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
        self.stop.stop();
        self.join_thread();
        self.core.settle(BlockState::Stopping, BlockState::Stopped);
        Ok(())
    }

    fn shutdown(&self) {
        self.stop.stop();
        self.join_thread();
        for state in [BlockState::Starting, BlockState::Running, BlockState::Stopping] {
            self.core.settle(state, BlockState::Stopped);
        }
        self.engine.clear_consumer();
    }

    fn as_source(&self) -> Option<&dyn VideoSource> {
        Some(self)
    }
}

impl VideoSource for SourceBlock {
    fn set_consumer(&self, consumer: FrameConsumer) {
        self.engine.set_consumer(consumer);
    }

    fn clear_consumer(&self) {
        self.engine.clear_consumer();
    }

    fn has_consumer(&self) -> bool {
        self.engine.has_consumer()
    }

    fn output_format(&self) -> FrameInfo {
        self.format.read().clone()
    }

    fn set_output_format(&self, format: FrameInfo) -> Result<()> {
        if self.core.is_running() {
            return Err(PipelineError::InvalidState {
                operation: "set_output_format",
                state: BlockState::Running,
            });
        }
        if !self.supports_format(format.format) {
            return Err(PipelineError::InvalidParameter {
                key: "format".into(),
                reason: format!("{} not supported", format.format),
            });
        }
        *self.format.write() = format;
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.engine.frame_rate()
    }

    fn set_frame_rate(&self, fps: f64) -> Result<()> {
        self.engine.set_frame_rate(fps)
    }

    fn supports_format(&self, format: PixelFormat) -> bool {
        self.generator.lock().supports_format(format)
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        self.generator.lock().supported_formats()
    }
}

impl Drop for SourceBlock {
    fn drop(&mut self) {
        self.stop.stop();
        self.join_thread();
    }
}

struct GenerationLoop {
    engine: Arc<SourceEngine>,
    generator: Arc<Mutex<Box<dyn FrameGenerator>>>,
    format: Arc<RwLock<FrameInfo>>,
    pool: BufferPool,
    stop: StopSignal,
}

impl GenerationLoop {
    fn run(self) {
        let core = self.engine.core();
        debug!(block = %core.name(), "generation thread started");

        while !self.stop.is_stopped() {
            let wait = self.engine.time_until_admission();
            if !wait.is_zero() {
                self.stop.wait_timeout(wait);
                continue;
            }

            let format = self.format.read().clone();
            let generated = panic::catch_unwind(AssertUnwindSafe(|| {
                self.generator.lock().generate(&format, &self.pool)
            }));

            match generated {
                Ok(Ok(Some(frame))) => {
                    if !self.engine.emit(frame) {
                        if core.state() == BlockState::Error {
                            break;
                        }
                        // Nobody listening yet.
                        self.stop.wait_timeout(self.engine.frame_interval());
                    }
                }
                Ok(Ok(None)) => {
                    self.stop.wait_timeout(self.engine.frame_interval() / 4);
                }
                Ok(Err(e)) if e.is_resource() => {
                    core.set_error(format!("frame generation failed: {e}"));
                    break;
                }
                Ok(Err(e)) => {
                    core.record_dropped();
                    debug!(block = %core.name(), error = %e, "frame dropped");
                    self.stop.wait_timeout(self.engine.frame_interval());
                }
                Err(payload) => {
                    core.set_error(format!(
                        "generator panicked: {}",
                        worker::panic_message(&payload)
                    ));
                    break;
                }
            }
        }

        debug!(block = %core.name(), "generation thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail_with: Option<PipelineError>,
        panic_on: Option<usize>,
    }

    impl Counting {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let generator = Self {
                calls: calls.clone(),
                fail_with: None,
                panic_on: None,
            };
            (generator, calls)
        }
    }

    impl FrameGenerator for Counting {
        fn supports_format(&self, format: PixelFormat) -> bool {
            matches!(format, PixelFormat::Rgb24 | PixelFormat::Yuv420p)
        }

        fn generate(
            &mut self,
            format: &FrameInfo,
            _pool: &BufferPool,
        ) -> Result<Option<FrameBuffer>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on == Some(n) {
                panic!("generator blew up");
            }
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            FrameBuffer::for_info(format.clone()).map(Some)
        }
    }

    fn engine() -> SourceEngine {
        SourceEngine::new(Arc::new(BlockCore::new("Test")))
    }

    fn small_frame() -> FrameBuffer {
        FrameBuffer::for_info(FrameInfo::new(4, 4, PixelFormat::Rgb24)).unwrap()
    }

    #[test]
    fn rate_bounds() {
        let engine = engine();
        assert!(engine.set_frame_rate(0.0).is_err());
        assert!(engine.set_frame_rate(-5.0).is_err());
        assert!(engine.set_frame_rate(1000.5).is_err());
        assert!(engine.set_frame_rate(f64::NAN).is_err());
        engine.set_frame_rate(1000.0).unwrap();
        engine.set_frame_rate(25.0).unwrap();
        assert_eq!(engine.frame_interval(), Duration::from_micros(40_000));
        assert_eq!(engine.frame_rate(), 25.0);
    }

    #[test]
    fn emit_without_consumer_is_a_noop() {
        let engine = engine();
        assert!(!engine.emit(small_frame()));
        let stats = engine.core().stats();
        assert_eq!(stats.frames_processed, 0);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(engine.last_sequence(), 0);
    }

    #[test]
    fn emit_stamps_and_rate_limits() {
        let engine = engine();
        engine.set_frame_rate(1.0).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.set_consumer(Box::new(move |frame: Frame| {
            sink.lock().push((frame.info().sequence, frame.info().timestamp_us));
        }));

        assert!(engine.should_emit());
        assert!(engine.emit(small_frame()));
        assert!(!engine.should_emit());
        assert!(!engine.emit(small_frame()));

        let stats = engine.core().stats();
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.bytes_processed, 48);

        engine.reset_admission();
        assert!(engine.emit(small_frame()));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert!(seen[1].1 >= seen[0].1);
    }

    #[test]
    fn consumer_can_be_replaced_and_cleared() {
        let engine = engine();
        engine.set_frame_rate(1000.0).unwrap();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        engine.set_consumer(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(engine.emit(small_frame()));
        let s = second.clone();
        engine.set_consumer(Box::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        engine.reset_admission();
        assert!(engine.emit(small_frame()));
        engine.clear_consumer();
        engine.reset_admission();
        assert!(!engine.emit(small_frame()));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn configure_reads_common_parameters() {
        let (generator, _) = Counting::new();
        let source = SourceBlock::new("Counting", generator);
        source.core().params().set("width", "320");
        source.core().params().set("height", "240");
        source.core().params().set("format", "yuv420p");
        source.core().params().set("fps", "15");
        source.core().params().set("buffer_count", "5");
        source.configure().unwrap();

        assert_eq!(source.state(), BlockState::Initialized);
        let format = source.output_format();
        assert_eq!((format.width, format.height), (320, 240));
        assert_eq!(format.format, PixelFormat::Yuv420p);
        assert_eq!(source.frame_rate(), 15.0);
        assert_eq!(source.pool().unwrap().limit(), 5);
        assert_eq!(
            source.supported_formats(),
            vec![PixelFormat::Rgb24, PixelFormat::Yuv420p]
        );
    }

    #[test]
    fn configure_rejects_bad_values() {
        for (key, value) in [
            ("format", "NV12"),
            ("fps", "0"),
            ("width", "wide"),
            ("buffer_count", "101"),
        ] {
            let (generator, _) = Counting::new();
            let source = SourceBlock::new("Counting", generator);
            source.core().params().set(key, value);
            assert!(source.configure().is_err(), "{key}={value} accepted");
            assert_eq!(source.state(), BlockState::Error);
        }
    }

    #[test]
    fn output_format_is_frozen_while_running() {
        let (generator, _) = Counting::new();
        let source = SourceBlock::new("Counting", generator);
        source.configure().unwrap();
        source.start().unwrap();
        let err = source
            .set_output_format(FrameInfo::new(8, 8, PixelFormat::Rgb24))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        source.stop().unwrap();
        source
            .set_output_format(FrameInfo::new(8, 8, PixelFormat::Rgb24))
            .unwrap();
        assert!(source
            .set_output_format(FrameInfo::new(8, 8, PixelFormat::Nv12))
            .is_err());
    }

    #[test]
    fn generation_thread_delivers_and_restarts() {
        let (generator, _) = Counting::new();
        let source = SourceBlock::new("Counting", generator);
        source.core().set_name("cam");
        source.core().params().set("fps", "200");
        source.configure().unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        source.set_consumer(Box::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..2 {
            source.start().unwrap();
            assert_eq!(source.state(), BlockState::Running);
            thread::sleep(Duration::from_millis(60));
            source.stop().unwrap();
            assert_eq!(source.state(), BlockState::Stopped);
        }
        assert!(received.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            received.load(Ordering::SeqCst) as u64,
            source.core().stats().frames_processed
        );
    }

    #[test]
    fn transient_generator_errors_are_drops() {
        let (mut generator, calls) = Counting::new();
        generator.fail_with = Some(PipelineError::frame("sensor glitch"));
        let source = SourceBlock::new("Counting", generator);
        source.core().params().set("fps", "500");
        source.configure().unwrap();
        source.set_consumer(Box::new(|_| {}));
        source.start().unwrap();
        thread::sleep(Duration::from_millis(40));
        source.stop().unwrap();
        assert!(calls.load(Ordering::SeqCst) > 0);
        assert_eq!(
            source.core().stats().frames_dropped,
            calls.load(Ordering::SeqCst) as u64
        );
    }

    #[test]
    fn allocation_failure_moves_to_error() {
        let (mut generator, _) = Counting::new();
        generator.fail_with = Some(PipelineError::Allocation(1 << 40));
        let source = SourceBlock::new("Counting", generator);
        source.configure().unwrap();
        source.set_consumer(Box::new(|_| {}));
        source.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.state() != BlockState::Error && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(source.state(), BlockState::Error);
        assert!(source.core().last_error().contains("allocate"));
        assert!(source.stop().is_err());
        source.shutdown();
        assert_eq!(source.state(), BlockState::Error);
    }

    #[test]
    fn generator_panic_is_contained() {
        let (mut generator, calls) = Counting::new();
        generator.panic_on = Some(2);
        let source = SourceBlock::new("Counting", generator);
        source.core().params().set("fps", "500");
        source.configure().unwrap();
        source.set_consumer(Box::new(|_| {}));
        source.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.state() != BlockState::Error && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        source.shutdown();
        assert_eq!(source.state(), BlockState::Error);
        assert!(source.core().last_error().contains("generator blew up"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
    #[test]
    fn consumer_panic_is_an_error() {
        let engine = engine();
        engine.set_consumer(Box::new(|_| panic!("downstream exploded")));
        assert!(!engine.emit(small_frame()));
        assert_eq!(engine.core().state(), BlockState::Error);
        assert!(engine.core().last_error().contains("downstream exploded"));
        assert_eq!(engine.core().stats().frames_processed, 0);
    }

    #[test]
    fn consumer_panic_ends_the_generation_thread() {
        let (generator, calls) = Counting::new();
        let source = SourceBlock::new("Counting", generator);
        source.core().params().set("fps", "500");
        source.configure().unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        source.set_consumer(Box::new(move |_| {
            if d.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("downstream exploded");
            }
        }));
        source.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.state() != BlockState::Error && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        source.shutdown();
        assert_eq!(source.state(), BlockState::Error);
        assert!(source.core().last_error().contains("frame consumer panicked"));
        assert_eq!(source.core().stats().frames_processed, 1);
    }
}
