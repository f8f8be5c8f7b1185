//! Error taxonomy shared by every pipeline component

use thiserror::Error;

use crate::block::BlockState;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Bad or missing parameter, unresolved endpoint, unknown block type.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid parameter '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("operation '{operation}' not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: BlockState,
    },

    #[error("failed to allocate {0} bytes")]
    Allocation(usize),

    #[error("no free buffer in pool (limit {0})")]
    BufferUnavailable(usize),

    #[error("payload of {needed} bytes exceeds capacity of {capacity} bytes")]
    CapacityExceeded { needed: usize, capacity: usize },

    #[error("block type '{0}' is not registered")]
    UnknownBlockType(String),

    #[error("block '{0}' not found")]
    BlockNotFound(String),

    #[error("block '{block}' lacks {capability} capability")]
    MissingCapability {
        block: String,
        capability: &'static str,
    },

    /// A frame was refused at a sink boundary (null, not running, shutdown).
    #[error("frame rejected: {0}")]
    Rejected(String),

    /// A single frame failed inside a processing or generation hook.
    #[error("frame processing failed: {0}")]
    Frame(String),

    #[error("block '{block}' failed: {reason}")]
    Block { block: String, reason: String },

    #[error("failed to spawn thread: {0}")]
    Thread(String),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Resource failures move a block to the error state; anything else
    /// raised while handling a single frame is counted as a drop. An empty
    /// pool is transient and does not count.
    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Allocation(_))
    }
}
