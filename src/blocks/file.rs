//! Sink that writes frames to disk

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use crate::block::ParamStore;
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, FrameInfo, PixelFormat};
use crate::sink::{FrameProcessor, SinkBlock};

pub const TYPE_NAME: &str = "FileSink";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// Payload bytes as-is
    #[default]
    Raw,
    /// Binary RGB (P6), RGB24/RGBA32 input only
    Ppm,
    /// Binary grayscale (P5) from RGB24 or the first plane
    Pgm,
}

impl FileFormat {
    fn extension(self) -> &'static str {
        match self {
            FileFormat::Raw => "raw",
            FileFormat::Ppm => "ppm",
            FileFormat::Pgm => "pgm",
        }
    }
}

impl FromStr for FileFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "yuv" => Ok(FileFormat::Raw),
            "ppm" => Ok(FileFormat::Ppm),
            "pgm" => Ok(FileFormat::Pgm),
            other => Err(PipelineError::InvalidParameter {
                key: "format".into(),
                reason: format!("unknown file format '{other}'"),
            }),
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::frame(format!("{}: {e}", path.display()))
}

/// Writes `<path>_NNNNNN.<ext>` per frame, or appends raw frames to `path`
/// when `single_file` is set.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    format: FileFormat,
    single_file: bool,
    written: u64,
    output: Option<BufWriter<File>>,
}

impl Default for FileWriter {
    fn default() -> Self {
        Self {
            path: PathBuf::from("output"),
            format: FileFormat::Raw,
            single_file: false,
            written: 0,
            output: None,
        }
    }
}

impl FileWriter {
    pub fn frames_written(&self) -> u64 {
        self.written
    }

    fn frame_path(&self, index: u64) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!("_{index:06}.{}", self.format.extension()));
        PathBuf::from(name)
    }

    fn write_single(&mut self, frame: &Frame) -> Result<()> {
        if self.output.is_none() {
            let file = File::create(&self.path).map_err(|e| io_error(&self.path, e))?;
            debug!(path = %self.path.display(), "opened output file");
            self.output = Some(BufWriter::new(file));
        }
        let path = &self.path;
        let Some(out) = self.output.as_mut() else {
            return Ok(());
        };
        out.write_all(frame.data())
            .and_then(|()| out.flush())
            .map_err(|e| io_error(path, e))
    }

    fn write_numbered(&self, frame: &Frame) -> Result<()> {
        let path = self.frame_path(self.written);
        let file = File::create(&path).map_err(|e| io_error(&path, e))?;
        let mut out = BufWriter::new(file);
        encode(self.format, frame, &mut out)
            .and_then(|()| out.flush())
            .map_err(|e| io_error(&path, e))
    }
}

fn encode(format: FileFormat, frame: &Frame, out: &mut impl Write) -> std::io::Result<()> {
    let info = frame.info();
    let pixels = info.width as usize * info.height as usize;
    let data = frame.data();
    match format {
        FileFormat::Raw => out.write_all(data),
        FileFormat::Ppm => {
            write!(out, "P6\n{} {}\n255\n", info.width, info.height)?;
            match info.format {
                PixelFormat::Rgba32 => {
                    for px in data.chunks_exact(4).take(pixels) {
                        out.write_all(&px[..3])?;
                    }
                    Ok(())
                }
                _ => out.write_all(&data[..pixels * 3]),
            }
        }
        FileFormat::Pgm => {
            write!(out, "P5\n{} {}\n255\n", info.width, info.height)?;
            match info.format {
                PixelFormat::Rgb24 => {
                    for px in data.chunks_exact(3).take(pixels) {
                        let gray =
                            0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
                        out.write_all(&[gray as u8])?;
                    }
                    Ok(())
                }
                _ => out.write_all(&data[..pixels.min(data.len())]),
            }
        }
    }
}

impl FrameProcessor for FileWriter {
    fn supports_format(&self, format: PixelFormat) -> bool {
        match self.format {
            FileFormat::Ppm => matches!(format, PixelFormat::Rgb24 | PixelFormat::Rgba32),
            FileFormat::Pgm => matches!(
                format,
                PixelFormat::Rgb24 | PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21
            ),
            FileFormat::Raw => format != PixelFormat::Unknown,
        }
    }

    fn configure(&mut self, params: &ParamStore, _format: &FrameInfo) -> Result<()> {
        if let Some(path) = params.get_opt("path") {
            self.path = PathBuf::from(path);
        }
        if let Some(format) = params.parse::<FileFormat>("format")? {
            self.format = format;
        }
        if let Some(single) = params.parse_bool("single_file")? {
            self.single_file = single;
        }
        if self.single_file && self.format != FileFormat::Raw {
            return Err(PipelineError::InvalidParameter {
                key: "single_file".into(),
                reason: "only raw output can be appended to one file".into(),
            });
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PipelineError::InvalidParameter {
                key: "path".into(),
                reason: format!("{}: {e}", parent.display()),
            })?;
        }
        info!(
            path = %self.path.display(),
            format = ?self.format,
            single_file = self.single_file,
            "file sink configured"
        );
        Ok(())
    }

    fn process(&mut self, frame: &Frame) -> Result<()> {
        if !self.supports_format(frame.info().format) {
            return Err(PipelineError::frame(format!(
                "{:?} output cannot encode {}",
                self.format,
                frame.info().format
            )));
        }
        if self.single_file {
            self.write_single(frame)?;
        } else {
            self.write_numbered(frame)?;
        }
        self.written += 1;
        if self.written % 100 == 0 {
            info!(frames = self.written, path = %self.path.display(), "frames written");
        }
        Ok(())
    }
}

pub fn file_sink() -> SinkBlock {
    SinkBlock::new(TYPE_NAME, FileWriter::default())
}
