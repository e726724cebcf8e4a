//! Session raster
//!
//! The source framebuffer the session paints into, with a single invalid
//! rectangle accumulating the damage of the current paint batch.

use tracing::trace;

use crate::pipeline::{DamageRect, PipelineError, PixelFormat, Result, SourceFramebuffer};

/// Largest accepted desktop dimension
pub const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Default)]
pub struct Raster {
    width: u32,
    height: u32,
    data: Vec<u8>,
    invalid: Option<DamageRect>,
}

impl Raster {
    /// Zero-sized raster, allocated once the desktop size is known
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            width,
            height,
            data: allocate(width, height)?,
            invalid: None,
        })
    }

    /// Write `pixels` (tightly packed rows of `rect`) and grow the invalid region
    pub fn paint(&mut self, rect: DamageRect, pixels: &[u8]) -> Result<()> {
        if rect.is_empty() {
            return Ok(());
        }
        if !rect.fits(self.width, self.height) {
            return Err(PipelineError::OutOfBounds {
                rect,
                width: self.width,
                height: self.height,
            });
        }

        let bpp = self.format().bytes_per_pixel();
        let row_bytes = rect.w as usize * bpp;
        let expected = row_bytes * rect.h as usize;
        if pixels.len() != expected {
            return Err(PipelineError::Session(format!(
                "paint {} carries {} bytes, expected {}",
                rect,
                pixels.len(),
                expected
            )));
        }

        let stride = self.stride();
        for (row, src) in pixels.chunks_exact(row_bytes).enumerate() {
            let start = (rect.y as usize + row) * stride + rect.x as usize * bpp;
            self.data[start..start + row_bytes].copy_from_slice(src);
        }

        self.invalid = Some(match self.invalid {
            Some(invalid) => invalid.union(&rect),
            None => rect,
        });
        trace!("Painted {}", rect);
        Ok(())
    }
}

impl SourceFramebuffer for Raster {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Bgrx32
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if (width, height) == (self.width, self.height) && !self.data.is_empty() {
            return Ok(());
        }
        self.data = allocate(width, height)?;
        self.width = width;
        self.height = height;
        self.invalid = None;
        Ok(())
    }

    fn invalid_region(&self) -> Option<DamageRect> {
        self.invalid
    }

    fn clear_invalid(&mut self) {
        self.invalid = None;
    }
}

/// Zeroed backing store; allocation failure leaves the caller's store alone
fn allocate(width: u32, height: u32) -> Result<Vec<u8>> {
    let failed = |reason: String| PipelineError::ResizeFailed { width, height, reason };

    if !(1..=MAX_DIMENSION).contains(&width) || !(1..=MAX_DIMENSION).contains(&height) {
        return Err(failed(format!("dimensions must be within 1..={}", MAX_DIMENSION)));
    }

    let len = width as usize * height as usize * PixelFormat::Bgrx32.bytes_per_pixel();
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| failed(e.to_string()))?;
    data.resize(len, 0);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paint_unions_invalid_region() {
        let mut raster = Raster::new(100, 100).unwrap();
        assert_eq!(raster.invalid_region(), None);

        raster.paint(DamageRect::new(10, 10, 2, 2), &[7; 16]).unwrap();
        raster.paint(DamageRect::new(50, 40, 1, 1), &[9; 4]).unwrap();

        assert_eq!(raster.invalid_region(), Some(DamageRect::new(10, 10, 41, 31)));
        let at = (11 * 100 + 11) * 4;
        assert_eq!(&raster.data()[at..at + 4], &[7; 4]);

        raster.clear_invalid();
        assert_eq!(raster.invalid_region(), None);
    }

    #[test]
    fn test_paint_rejects_bad_input() {
        let mut raster = Raster::new(8, 8).unwrap();

        let err = raster.paint(DamageRect::new(6, 6, 4, 4), &[0; 64]).unwrap_err();
        assert!(matches!(err, PipelineError::OutOfBounds { .. }));

        let err = raster.paint(DamageRect::new(0, 0, 2, 2), &[0; 3]).unwrap_err();
        assert!(matches!(err, PipelineError::Session(_)));
        assert_eq!(raster.invalid_region(), None);
    }

    #[test]
    fn test_failed_resize_keeps_store() {
        let mut raster = Raster::new(4, 4).unwrap();
        raster.paint(DamageRect::new(0, 0, 1, 1), &[1; 4]).unwrap();

        let err = raster.resize(MAX_DIMENSION + 1, 4).unwrap_err();
        assert!(matches!(err, PipelineError::ResizeFailed { .. }));
        assert_eq!((raster.width(), raster.height()), (4, 4));
        assert_eq!(raster.data().len(), 64);

        raster.resize(8, 2).unwrap();
        assert_eq!(raster.data().len(), 64);
        assert_eq!(raster.invalid_region(), None);
    }
}
