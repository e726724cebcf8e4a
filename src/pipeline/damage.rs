//! Damage buffer manager
//!
//! Copies damaged rectangles from the source framebuffer into the
//! presentation buffer. Copies happen immediately, whether or not the
//! presentation gate currently allows a submission.

use tracing::trace;

use super::{DamageRect, PipelineError, PixelFormat, Result, SourceFramebuffer};

/// Presentation-side pixel storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer; overflow and allocation failure are
    /// `ResizeFailed`, never an abort
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let failed = |reason: String| PipelineError::ResizeFailed { width, height, reason };

        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(format.bytes_per_pixel()))
            .ok_or_else(|| failed("buffer size overflows".into()))?;

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| failed(e.to_string()))?;
        data.resize(len, 0);

        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whole-buffer rectangle
    pub fn extent(&self) -> DamageRect {
        DamageRect::full(self.width, self.height)
    }
}

/// Copy `rect` from `source` into `dst` row by row.
///
/// Source and destination share width and format, so both use the same
/// stride. Out-of-range rectangles are rejected, never clamped, and leave
/// `dst` untouched.
pub fn copy_region(dst: &mut PixelBuffer, source: &dyn SourceFramebuffer, rect: DamageRect) -> Result<()> {
    if !rect.fits(dst.width, dst.height) {
        return Err(PipelineError::OutOfBounds {
            rect,
            width: dst.width,
            height: dst.height,
        });
    }

    if source.width() != dst.width || source.height() != dst.height || source.format() != dst.format {
        return Err(PipelineError::InvalidState(
            "source framebuffer geometry differs from presentation buffer",
        ));
    }

    let stride = dst.stride();
    let src = source.data();
    if source.stride() != stride || src.len() < dst.data.len() {
        return Err(PipelineError::InvalidState("source framebuffer is smaller than its geometry"));
    }

    let bpp = dst.format.bytes_per_pixel();
    let row_bytes = rect.w as usize * bpp;
    for row in 0..rect.h as usize {
        let offset = (rect.y as usize + row) * stride + rect.x as usize * bpp;
        dst.data[offset..offset + row_bytes].copy_from_slice(&src[offset..offset + row_bytes]);
    }

    trace!("Copied damage {}", rect);
    Ok(())
}
