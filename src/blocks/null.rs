//! Sink that discards frames, optionally after a fixed delay

use std::thread;
use std::time::Duration;

use crate::block::ParamStore;
use crate::error::Result;
use crate::frame::{Frame, FrameInfo};
use crate::sink::{FrameProcessor, SinkBlock};

pub const TYPE_NAME: &str = "NullSink";

#[derive(Debug, Default)]
pub struct Discard {
    delay: Duration,
}

impl Discard {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl FrameProcessor for Discard {
    fn configure(&mut self, params: &ParamStore, _format: &FrameInfo) -> Result<()> {
        if let Some(ms) = params.parse::<u64>("delay_ms")? {
            self.delay = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn process(&mut self, _frame: &Frame) -> Result<()> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(())
    }
}

pub fn null_sink() -> SinkBlock {
    SinkBlock::new(TYPE_NAME, Discard::default())
}
