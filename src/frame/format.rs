use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Pixel formats the engine knows the memory layout of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    #[default]
    Unknown,
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    /// Planar YUV 4:2:0 (Y, U, V)
    Yuv420p,
    /// Semi-planar YUV 4:2:0 (Y, interleaved UV)
    Nv12,
    /// Semi-planar YUV 4:2:0 (Y, interleaved VU)
    Nv21,
    /// Packed YUV 4:2:2
    Yuyv,
    /// Packed YUV 4:2:2
    Uyvy,
}

/// Byte range and row stride of one plane inside a frame's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub len: usize,
    pub stride: u32,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba32,
        PixelFormat::Bgra32,
        PixelFormat::Yuv420p,
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Unknown => "UNKNOWN",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Rgba32 => "RGBA32",
            PixelFormat::Bgra32 => "BGRA32",
            PixelFormat::Yuv420p => "YUV420P",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
        }
    }

    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub fn packed_bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => Some(4),
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(2),
            _ => None,
        }
    }

    pub fn payload_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21 => pixels * 3 / 2,
            packed => pixels * packed.packed_bytes_per_pixel().unwrap_or(0),
        }
    }

    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            _ => 1,
        }
    }

    /// Plane geometry. Offsets are fixed by the format and dimensions only:
    /// planar Y/U/V at 0, W·H, W·H·5/4; semi-planar Y/UV at 0, W·H.
    pub fn plane_layout(self, width: u32, height: u32, plane: usize) -> Option<PlaneLayout> {
        let pixels = width as usize * height as usize;
        match (self, plane) {
            (PixelFormat::Unknown, _) => None,
            (PixelFormat::Yuv420p, 0) => Some(PlaneLayout {
                offset: 0,
                len: pixels,
                stride: width,
            }),
            (PixelFormat::Yuv420p, 1) => Some(PlaneLayout {
                offset: pixels,
                len: pixels / 4,
                stride: width / 2,
            }),
            (PixelFormat::Yuv420p, 2) => Some(PlaneLayout {
                offset: pixels * 5 / 4,
                len: pixels / 4,
                stride: width / 2,
            }),
            (PixelFormat::Nv12 | PixelFormat::Nv21, 0) => Some(PlaneLayout {
                offset: 0,
                len: pixels,
                stride: width,
            }),
            (PixelFormat::Nv12 | PixelFormat::Nv21, 1) => Some(PlaneLayout {
                offset: pixels,
                len: pixels / 2,
                stride: width,
            }),
            (PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21, _) => None,
            (packed, 0) => {
                let bpp = packed.packed_bytes_per_pixel()?;
                Some(PlaneLayout {
                    offset: 0,
                    len: pixels * bpp,
                    stride: width * bpp as u32,
                })
            }
            _ => None,
        }
    }

    /// Row stride of the first plane, used as the default frame stride.
    pub fn default_stride(self, width: u32) -> u32 {
        match self.packed_bytes_per_pixel() {
            Some(bpp) => width * bpp as u32,
            None => width,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.name() == upper)
            .ok_or_else(|| PipelineError::InvalidParameter {
                key: "format".into(),
                reason: format!("unknown pixel format '{s}'"),
            })
    }
}

/// Opaque platform handle of a hardware-backed frame (e.g. a dmabuf fd or
/// a capture buffer index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareHandle(pub u64);

/// Frame metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    /// Capture timestamp, monotonic microseconds
    pub timestamp_us: u64,
    pub sequence: u64,
    /// Set for frames whose storage is borrowed from a producer
    pub hardware: Option<HardwareHandle>,
}

impl FrameInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride: format.default_stride(width),
            format,
            ..Default::default()
        }
    }

    pub fn frame_size(&self) -> usize {
        self.format.payload_size(self.width, self.height)
    }

    pub fn is_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    /// Same geometry and format, ignoring timing and ownership fields.
    pub fn same_format(&self, other: &FrameInfo) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)?;
        if self.stride != self.format.default_stride(self.width) {
            write!(f, " stride={}", self.stride)?;
        }
        if self.timestamp_us > 0 {
            write!(f, " ts={}us", self.timestamp_us)?;
        }
        if self.sequence > 0 {
            write!(f, " seq={}", self.sequence)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 64;
    const H: u32 = 48;

    #[test]
    fn payload_sizes_follow_the_format_table() {
        let px = (W * H) as usize;
        assert_eq!(PixelFormat::Rgb24.payload_size(W, H), px * 3);
        assert_eq!(PixelFormat::Bgr24.payload_size(W, H), px * 3);
        assert_eq!(PixelFormat::Rgba32.payload_size(W, H), px * 4);
        assert_eq!(PixelFormat::Bgra32.payload_size(W, H), px * 4);
        assert_eq!(PixelFormat::Yuyv.payload_size(W, H), px * 2);
        assert_eq!(PixelFormat::Uyvy.payload_size(W, H), px * 2);
        assert_eq!(PixelFormat::Yuv420p.payload_size(W, H), px * 3 / 2);
        assert_eq!(PixelFormat::Nv12.payload_size(W, H), px * 3 / 2);
        assert_eq!(PixelFormat::Nv21.payload_size(W, H), px * 3 / 2);
        assert_eq!(PixelFormat::Unknown.payload_size(W, H), 0);
    }

    #[test]
    fn packed_formats_have_one_plane_covering_the_payload() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Rgba32,
            PixelFormat::Bgra32,
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
        ] {
            assert_eq!(format.plane_count(), 1, "{format}");
            let plane = format.plane_layout(W, H, 0).unwrap();
            assert_eq!(plane.offset, 0);
            assert_eq!(plane.len, format.payload_size(W, H));
            assert_eq!(plane.stride, format.default_stride(W));
            assert!(format.plane_layout(W, H, 1).is_none());
        }
        assert_eq!(PixelFormat::Rgb24.default_stride(W), W * 3);
        assert_eq!(PixelFormat::Rgba32.default_stride(W), W * 4);
        assert_eq!(PixelFormat::Yuyv.default_stride(W), W * 2);
    }

    #[test]
    fn planar_yuv_offsets() {
        let px = (W * H) as usize;
        let f = PixelFormat::Yuv420p;
        assert_eq!(f.plane_count(), 3);
        let y = f.plane_layout(W, H, 0).unwrap();
        let u = f.plane_layout(W, H, 1).unwrap();
        let v = f.plane_layout(W, H, 2).unwrap();
        assert_eq!((y.offset, y.len, y.stride), (0, px, W));
        assert_eq!((u.offset, u.len, u.stride), (px, px / 4, W / 2));
        assert_eq!((v.offset, v.len, v.stride), (px * 5 / 4, px / 4, W / 2));
        assert_eq!(v.offset + v.len, f.payload_size(W, H));
        assert!(f.plane_layout(W, H, 3).is_none());
    }

    #[test]
    fn semi_planar_offsets() {
        let px = (W * H) as usize;
        for f in [PixelFormat::Nv12, PixelFormat::Nv21] {
            assert_eq!(f.plane_count(), 2);
            let y = f.plane_layout(W, H, 0).unwrap();
            let uv = f.plane_layout(W, H, 1).unwrap();
            assert_eq!((y.offset, y.len, y.stride), (0, px, W));
            assert_eq!((uv.offset, uv.len, uv.stride), (px, px / 2, W));
            assert!(f.plane_layout(W, H, 2).is_none());
        }
    }

    #[test]
    fn unknown_format_has_no_planes() {
        assert_eq!(PixelFormat::Unknown.plane_count(), 0);
        assert!(PixelFormat::Unknown.plane_layout(W, H, 0).is_none());
    }

    #[test]
    fn format_names_parse_case_insensitively() {
        for f in PixelFormat::ALL {
            assert_eq!(f.name().parse::<PixelFormat>().unwrap(), f);
            assert_eq!(f.name().to_lowercase().parse::<PixelFormat>().unwrap(), f);
        }
        assert!("RGB48".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn frame_info_display() {
        let mut info = FrameInfo::new(640, 480, PixelFormat::Rgb24);
        assert_eq!(info.to_string(), "640x480 RGB24");
        info.sequence = 7;
        info.timestamp_us = 1500;
        assert_eq!(info.to_string(), "640x480 RGB24 ts=1500us seq=7");
    }
}
