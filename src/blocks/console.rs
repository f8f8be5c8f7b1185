//! Sink that reports frames through the log

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use tracing::info;

use crate::block::ParamStore;
use crate::clock;
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, FrameInfo, PixelFormat};
use crate::sink::{FrameProcessor, SinkBlock};

pub const TYPE_NAME: &str = "ConsoleSink";

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_PIXELS: usize = 16;

/// Logs one line per frame when `verbose`, otherwise at most one per second.
#[derive(Debug)]
pub struct ConsoleReport {
    verbose: bool,
    show_pixels: bool,
    max_pixels: usize,
    frames: u64,
    last_report: Option<Instant>,
}

impl Default for ConsoleReport {
    fn default() -> Self {
        Self {
            verbose: false,
            show_pixels: false,
            max_pixels: DEFAULT_MAX_PIXELS,
            frames: 0,
            last_report: None,
        }
    }
}

impl ConsoleReport {
    fn due(&mut self) -> bool {
        let now = Instant::now();
        let due = self.verbose
            || self
                .last_report
                .map_or(true, |last| now.duration_since(last) >= REPORT_INTERVAL);
        if due {
            self.last_report = Some(now);
        }
        due
    }
}

/// Hex dump of the first `max_pixels` pixels of plane 0.
pub fn format_pixels(frame: &Frame, max_pixels: usize) -> String {
    let info = frame.info();
    let bytes_per_pixel = info.format.packed_bytes_per_pixel().unwrap_or(1);
    let pixels = (info.width as usize * info.height as usize).min(max_pixels);
    let data = frame.data();

    let mut out = String::new();
    for (i, px) in data.chunks(bytes_per_pixel).take(pixels).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{i}:");
        for (c, byte) in px.iter().enumerate() {
            let sep = if c == 0 { "" } else { "," };
            let _ = write!(out, "{sep}{byte:02X}");
        }
    }
    out
}

impl FrameProcessor for ConsoleReport {
    fn configure(&mut self, params: &ParamStore, _format: &FrameInfo) -> Result<()> {
        if let Some(verbose) = params.parse_bool("verbose")? {
            self.verbose = verbose;
        }
        if let Some(show) = params.parse_bool("show_pixels")? {
            self.show_pixels = show;
        }
        if let Some(max) = params.parse::<usize>("max_pixels")? {
            self.max_pixels = max;
        }
        info!(
            verbose = self.verbose,
            show_pixels = self.show_pixels,
            max_pixels = self.max_pixels,
            "console sink configured"
        );
        Ok(())
    }

    fn process(&mut self, frame: &Frame) -> Result<()> {
        if !frame.is_valid() || frame.info().format == PixelFormat::Unknown {
            return Err(PipelineError::frame("invalid frame"));
        }
        self.frames += 1;
        if !self.due() {
            return Ok(());
        }

        let info = frame.info();
        let age_ms = match info.timestamp_us {
            0 => 0.0,
            ts => clock::since_us(ts).as_secs_f64() * 1000.0,
        };
        info!(
            frame = %info,
            size = frame.size(),
            age_ms = (age_ms * 10.0).round() / 10.0,
            received = self.frames,
            "frame"
        );
        if self.show_pixels {
            info!(pixels = %format_pixels(frame, self.max_pixels), "pixel data");
        }
        Ok(())
    }
}

pub fn console_sink() -> SinkBlock {
    SinkBlock::new(TYPE_NAME, ConsoleReport::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuffer;

    #[test]
    fn pixel_dump_is_bounded() {
        let mut buffer = FrameBuffer::for_info(FrameInfo::new(4, 1, PixelFormat::Rgb24)).unwrap();
        buffer.data_mut().copy_from_slice(&[1, 2, 3, 0xAA, 0xBB, 0xCC, 7, 8, 9, 0, 0, 0]);
        let frame = buffer.share();
        assert_eq!(format_pixels(&frame, 2), "0:01,02,03 1:AA,BB,CC");
        assert_eq!(format_pixels(&frame, 100).split(' ').count(), 4);
    }

    #[test]
    fn reports_are_throttled_unless_verbose() {
        let mut quiet = ConsoleReport::default();
        assert!(quiet.due());
        assert!(!quiet.due());

        let mut verbose = ConsoleReport {
            verbose: true,
            ..ConsoleReport::default()
        };
        assert!(verbose.due());
        assert!(verbose.due());
    }

    #[test]
    fn rejects_unbound_frames() {
        let mut report = ConsoleReport::default();
        let empty = FrameBuffer::new(8).unwrap().share();
        assert!(report.process(&empty).is_err());
    }
}
