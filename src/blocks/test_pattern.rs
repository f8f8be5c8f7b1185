//! Synthetic frame source

use std::str::FromStr;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tracing::info;

use crate::block::ParamStore;
use crate::error::{PipelineError, Result};
use crate::frame::{BufferPool, FrameBuffer, FrameInfo, PixelFormat};
use crate::source::{FrameGenerator, SourceBlock};

pub const TYPE_NAME: &str = "TestPatternSource";

const BAR_COLORS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];
const CHECK_SIZE: u32 = 32;
const BOX_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    Solid,
    #[default]
    Bars,
    Checkerboard,
    Gradient,
    MovingBox,
    Noise,
}

impl FromStr for Pattern {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solid" => Ok(Pattern::Solid),
            "bars" => Ok(Pattern::Bars),
            "checkerboard" => Ok(Pattern::Checkerboard),
            "gradient" => Ok(Pattern::Gradient),
            "moving_box" => Ok(Pattern::MovingBox),
            "noise" => Ok(Pattern::Noise),
            other => Err(PipelineError::InvalidParameter {
                key: "pattern".into(),
                reason: format!("unknown pattern '{other}'"),
            }),
        }
    }
}

/// `"#rrggbb"` or `"r,g,b"`.
pub fn parse_color(raw: &str) -> Result<[u8; 3]> {
    let invalid = || PipelineError::InvalidParameter {
        key: "color".into(),
        reason: format!("'{raw}' is neither #rrggbb nor r,g,b"),
    };
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix('#') {
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        return Ok([channel(0)?, channel(2)?, channel(4)?]);
    }
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [r, g, b] => Ok([
            r.parse().map_err(|_| invalid())?,
            g.parse().map_err(|_| invalid())?,
            b.parse().map_err(|_| invalid())?,
        ]),
        _ => Err(invalid()),
    }
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64) as u8
}

/// Generator behind the `TestPatternSource` block type.
#[derive(Debug, Clone)]
pub struct TestPattern {
    pattern: Pattern,
    color: [u8; 3],
    use_pool: bool,
    frame_counter: u64,
    rng: SmallRng,
}

impl Default for TestPattern {
    fn default() -> Self {
        Self {
            pattern: Pattern::default(),
            color: [255, 255, 255],
            use_pool: false,
            frame_counter: 0,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl TestPattern {
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            ..Self::default()
        }
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn color(&self) -> [u8; 3] {
        self.color
    }

    fn color_at(&self, x: u32, y: u32, width: u32, height: u32) -> [u8; 3] {
        match self.pattern {
            Pattern::Solid | Pattern::Noise => self.color,
            Pattern::Bars => {
                let bar_width = (width / 8).max(1);
                BAR_COLORS[(x / bar_width).min(7) as usize]
            }
            Pattern::Checkerboard => {
                let value = if (x / CHECK_SIZE + y / CHECK_SIZE) % 2 == 0 { 255 } else { 0 };
                [value; 3]
            }
            Pattern::Gradient => [
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                ((x + y) * 255 / (width + height)) as u8,
            ],
            Pattern::MovingBox => {
                let (bx, by) = self.box_origin(width, height);
                if x >= bx && x < bx + BOX_SIZE && y >= by && y < by + BOX_SIZE {
                    self.color
                } else {
                    [0; 3]
                }
            }
        }
    }

    /// Box walks the top edge, then down the right edge, then wraps.
    fn box_origin(&self, width: u32, height: u32) -> (u32, u32) {
        let max_x = width.saturating_sub(BOX_SIZE);
        let max_y = height.saturating_sub(BOX_SIZE);
        let period = u64::from(max_x + max_y + 1);
        let pos = (self.frame_counter % period) as u32;
        if pos <= max_x {
            (pos, 0)
        } else {
            (max_x, pos - max_x)
        }
    }

    fn render(&mut self, frame: &mut FrameBuffer) {
        if self.pattern == Pattern::Noise {
            // Every byte is random, padding and chroma planes included.
            self.rng.fill_bytes(frame.data_mut());
            return;
        }

        let FrameInfo {
            width,
            height,
            format,
            ..
        } = frame.info().clone();

        match format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Rgba32 | PixelFormat::Bgra32 => {
                let Some(plane) = frame.plane_mut(0) else {
                    return;
                };
                let bpp = format.packed_bytes_per_pixel().unwrap_or(3);
                for (y, row) in plane.data.chunks_exact_mut(plane.stride as usize).enumerate() {
                    for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
                        let [r, g, b] = self.color_at(x as u32, y as u32, width, height);
                        match format {
                            PixelFormat::Rgb24 => px.copy_from_slice(&[r, g, b]),
                            PixelFormat::Bgr24 => px.copy_from_slice(&[b, g, r]),
                            PixelFormat::Rgba32 => px.copy_from_slice(&[r, g, b, 255]),
                            _ => px.copy_from_slice(&[b, g, r, 255]),
                        }
                    }
                }
            }
            PixelFormat::Yuyv => {
                let Some(plane) = frame.plane_mut(0) else {
                    return;
                };
                for (y, row) in plane.data.chunks_exact_mut(plane.stride as usize).enumerate() {
                    for (x, px) in row.chunks_exact_mut(2).enumerate() {
                        px[0] = luma(self.color_at(x as u32, y as u32, width, height));
                        px[1] = 128;
                    }
                }
            }
            PixelFormat::Yuv420p => {
                if let Some(plane) = frame.plane_mut(0) {
                    for (y, row) in plane.data.chunks_exact_mut(plane.stride as usize).enumerate() {
                        for (x, px) in row.iter_mut().enumerate() {
                            *px = luma(self.color_at(x as u32, y as u32, width, height));
                        }
                    }
                }
                for chroma in 1..3 {
                    if let Some(plane) = frame.plane_mut(chroma) {
                        plane.data.fill(128);
                    }
                }
            }
            _ => {}
        }
    }
}

impl FrameGenerator for TestPattern {
    fn supports_format(&self, format: PixelFormat) -> bool {
        matches!(
            format,
            PixelFormat::Rgb24
                | PixelFormat::Bgr24
                | PixelFormat::Rgba32
                | PixelFormat::Bgra32
                | PixelFormat::Yuv420p
                | PixelFormat::Yuyv
        )
    }

    fn configure(&mut self, params: &ParamStore, format: &FrameInfo) -> Result<()> {
        if let Some(pattern) = params.parse::<Pattern>("pattern")? {
            self.pattern = pattern;
        }
        if let Some(raw) = params.get_opt("color") {
            self.color = parse_color(&raw)?;
        }
        if let Some(use_pool) = params.parse_bool("use_pool")? {
            self.use_pool = use_pool;
        }
        self.frame_counter = 0;
        info!(
            pattern = ?self.pattern,
            color = ?self.color,
            use_pool = self.use_pool,
            %format,
            "test pattern configured"
        );
        Ok(())
    }

    fn generate(&mut self, format: &FrameInfo, pool: &BufferPool) -> Result<Option<FrameBuffer>> {
        let mut frame = if self.use_pool {
            pool.acquire(format.clone())?
        } else {
            FrameBuffer::for_info(format.clone())?
        };
        self.render(&mut frame);
        self.frame_counter += 1;
        Ok(Some(frame))
    }
}

/// Source block emitting [`TestPattern`] frames.
pub fn test_pattern_source() -> SourceBlock {
    SourceBlock::new(TYPE_NAME, TestPattern::default())
}
