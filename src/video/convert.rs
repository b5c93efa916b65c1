//! Pixel format conversion
//!
//! Converts decoded frames of any pixel format into tightly packed BGRA at the
//! source geometry. The swscale context is cached and rebuilt only when the
//! source width, height or pixel format changes.

use ffmpeg_next as ffmpeg;

use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as ScalerContext, flag::Flags as ScalerFlags};
use ffmpeg::util::frame::video::Video;
use tracing::debug;

use super::frame::BYTES_PER_PIXEL;
use crate::error::{AppError, Result};

/// Packed display format produced by the converter
pub const DISPLAY_FORMAT: Pixel = Pixel::BGRA;

/// Parameters the cached context was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceKey {
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
}

impl SourceKey {
    pub fn of(frame: &Video) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
        }
    }
}

/// Result of one conversion, borrowing the converter's output buffer
#[derive(Debug)]
pub struct Converted<'a> {
    pub width: u32,
    pub height: u32,
    pub data: &'a [u8],
}

/// Stateful decoded-frame to BGRA converter
pub struct PixelConverter {
    scaler: Option<ScalerContext>,
    key: Option<SourceKey>,
    /// Destination frame at source geometry
    dst: Video,
    /// Row-compacted copy of `dst`
    packed: Vec<u8>,
    rebuilds: u64,
}

impl PixelConverter {
    pub fn new() -> Self {
        Self {
            scaler: None,
            key: None,
            dst: Video::empty(),
            packed: Vec::new(),
            rebuilds: 0,
        }
    }

    /// Number of times the conversion context has been (re)built
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Source parameters of the current context
    pub fn current_key(&self) -> Option<SourceKey> {
        self.key
    }

    /// Convert one decoded frame to packed BGRA
    pub fn convert(&mut self, frame: &Video) -> Result<Converted<'_>> {
        let key = SourceKey::of(frame);
        if key.width == 0 || key.height == 0 || key.format == Pixel::None {
            return Err(AppError::Convert(format!(
                "unusable frame {}x{} {:?}",
                key.width, key.height, key.format
            )));
        }

        if self.key != Some(key) {
            self.rebuild(key)?;
        }

        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| AppError::Convert("no conversion context".to_string()))?;
        scaler
            .run(frame, &mut self.dst)
            .map_err(|e| AppError::Convert(format!("scale failed: {}", e)))?;

        pack_rows(
            self.dst.data(0),
            self.dst.stride(0),
            key.width as usize * BYTES_PER_PIXEL,
            key.height as usize,
            &mut self.packed,
        )?;

        Ok(Converted {
            width: key.width,
            height: key.height,
            data: &self.packed,
        })
    }

    fn rebuild(&mut self, key: SourceKey) -> Result<()> {
        self.scaler = None;
        self.key = None;

        let scaler = ScalerContext::get(
            key.format,
            key.width,
            key.height,
            DISPLAY_FORMAT,
            key.width,
            key.height,
            ScalerFlags::BILINEAR,
        )
        .map_err(|e| {
            AppError::Convert(format!(
                "cannot convert {:?} {}x{}: {}",
                key.format, key.width, key.height, e
            ))
        })?;

        self.dst = Video::new(DISPLAY_FORMAT, key.width, key.height);
        self.packed = Vec::with_capacity(key.width as usize * key.height as usize * BYTES_PER_PIXEL);
        self.scaler = Some(scaler);
        self.key = Some(key);
        self.rebuilds += 1;

        debug!(
            "Converter rebuilt for {}x{} {:?}",
            key.width, key.height, key.format
        );
        Ok(())
    }
}

impl Default for PixelConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy `rows` rows of `row_bytes` each out of a strided plane into `out`
pub fn pack_rows(
    src: &[u8],
    stride: usize,
    row_bytes: usize,
    rows: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    if stride < row_bytes {
        return Err(AppError::Convert(format!(
            "stride {} shorter than row {}",
            stride, row_bytes
        )));
    }
    let needed = if rows == 0 {
        0
    } else {
        stride * (rows - 1) + row_bytes
    };
    if src.len() < needed {
        return Err(AppError::Convert(format!(
            "plane holds {} bytes, need {}",
            src.len(),
            needed
        )));
    }

    out.clear();
    for row in src.chunks(stride).take(rows) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    Ok(())
}
