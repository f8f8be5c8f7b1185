//! Graph-based video frame pipeline
//!
//! Blocks produce and consume reference-counted frames. A [`PipelineManager`]
//! builds the graph from a [`GraphConfig`], wires every source to its sinks
//! and starts and stops the blocks in dependency order. Sources are paced by
//! a frame-rate limiter; sinks drain a bounded queue on their own thread.

pub mod block;
pub mod blocks;
pub mod clock;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod source;
pub mod worker;

pub use block::{Block, BlockCore, BlockParams, BlockState, BlockStats, Capabilities, ParamStore};
pub use error::{PipelineError, Result};
pub use frame::{BufferPool, Frame, FrameBuffer, FrameInfo, HardwareHandle, PixelFormat};
pub use pipeline::{BlockDef, ConfigFormat, Connection, GraphConfig, PipelineManager};
pub use registry::{BlockFactory, BlockRegistry};
pub use sink::{BackpressurePolicy, FrameProcessor, SinkBlock, SinkEngine, VideoSink};
pub use source::{FrameConsumer, FrameGenerator, SourceBlock, SourceEngine, VideoSource};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
