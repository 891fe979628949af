//! Shared fit-image buffers.
//!
//! `FitImage` owns the observed frame plus the accumulators that let many
//! overlapping peaks cooperate: `f_data` is the summed foreground model of
//! every added peak, `bg_data`/`bg_counts` accumulate per-peak background
//! (plus the sCMOS variance term) and coverage. The per-pixel model
//! intensity used everywhere is `f_data + bg_data / bg_counts`.

use crate::util::{PsfFitError, PsfFitResult};

/// Observed image and shared model accumulators for one channel.
#[derive(Clone, Debug)]
pub struct FitImage {
    width: usize,
    height: usize,
    x_data: Vec<f64>,
    scmos_term: Vec<f64>,
    f_data: Vec<f64>,
    bg_data: Vec<f64>,
    bg_counts: Vec<i32>,
    image_set: bool,
}

impl FitImage {
    /// Creates buffers for a `width x height` frame.
    ///
    /// `scmos_term` is the per-pixel additive variance contribution
    /// (`variance / gain^2`), one entry per pixel in row-major order.
    pub fn new(width: usize, height: usize, scmos_term: &[f64]) -> PsfFitResult<Self> {
        if width == 0 || height == 0 {
            return Err(PsfFitError::InvalidDimensions { width, height });
        }
        let len = width * height;
        if scmos_term.len() != len {
            return Err(PsfFitError::SizeMismatch {
                context: "scmos calibration",
                expected: len,
                got: scmos_term.len(),
            });
        }
        Ok(Self {
            width,
            height,
            x_data: vec![0.0; len],
            scmos_term: scmos_term.to_vec(),
            f_data: vec![0.0; len],
            bg_data: vec![0.0; len],
            bg_counts: vec![0; len],
            image_set: false,
        })
    }

    /// Stores a new observed frame and zeroes all accumulators.
    ///
    /// Pixel values are gain-corrected photon counts. Must be called before
    /// peaks are added.
    pub fn set_image(&mut self, image: &[f64]) -> PsfFitResult<()> {
        let len = self.width * self.height;
        if image.len() != len {
            return Err(PsfFitError::SizeMismatch {
                context: "observed image",
                expected: len,
                got: image.len(),
            });
        }
        self.x_data.copy_from_slice(image);
        self.f_data.fill(0.0);
        self.bg_data.fill(0.0);
        self.bg_counts.fill(0);
        self.image_set = true;
        Ok(())
    }

    /// Returns the image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns the image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    pub(crate) fn is_image_set(&self) -> bool {
        self.image_set
    }

    /// Zeroes the foreground and background accumulators, keeping the
    /// observed frame.
    pub(crate) fn reset_accumulators(&mut self) {
        self.f_data.fill(0.0);
        self.bg_data.fill(0.0);
        self.bg_counts.fill(0);
    }

    /// Row-major index of `(x, y)`.
    #[inline]
    pub fn index(&self, x: i64, y: i64) -> usize {
        debug_assert!(x >= 0 && (x as usize) < self.width);
        debug_assert!(y >= 0 && (y as usize) < self.height);
        y as usize * self.width + x as usize
    }

    /// Observed photon count at a pixel.
    #[inline]
    pub fn observed(&self, idx: usize) -> f64 {
        self.x_data[idx]
    }

    /// sCMOS variance term at a pixel.
    #[inline]
    pub fn scmos(&self, idx: usize) -> f64 {
        self.scmos_term[idx]
    }

    /// Model intensity `f_data + bg_data / bg_counts` at a pixel.
    ///
    /// Undefined for pixels no added peak covers; callers only evaluate it
    /// inside a footprint, where coverage is at least one.
    #[inline]
    pub fn model_intensity(&self, idx: usize) -> f64 {
        debug_assert!(self.bg_counts[idx] > 0, "model intensity outside any footprint");
        self.f_data[idx] + self.bg_data[idx] / f64::from(self.bg_counts[idx])
    }

    #[inline]
    pub(crate) fn accumulate(&mut self, idx: usize, foreground: f64, background: f64) {
        self.f_data[idx] += foreground;
        self.bg_counts[idx] += 1;
        self.bg_data[idx] += background + self.scmos_term[idx];
    }

    #[inline]
    pub(crate) fn deduct(&mut self, idx: usize, foreground: f64, background: f64) {
        self.f_data[idx] -= foreground;
        self.bg_counts[idx] -= 1;
        self.bg_data[idx] -= background + self.scmos_term[idx];
    }

    /// Summed foreground model, for inspection and invariant tests.
    pub fn f_data(&self) -> &[f64] {
        &self.f_data
    }

    /// Accumulated background sums, for inspection and invariant tests.
    pub fn bg_data(&self) -> &[f64] {
        &self.bg_data
    }

    /// Per-pixel count of covering peaks.
    pub fn bg_counts(&self) -> &[i32] {
        &self.bg_counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffers() {
        assert!(FitImage::new(0, 4, &[]).is_err());
        assert!(FitImage::new(4, 4, &[0.0; 15]).is_err());

        let mut image = FitImage::new(4, 4, &[0.0; 16]).unwrap();
        assert!(image.set_image(&[1.0; 15]).is_err());
        assert!(image.set_image(&[1.0; 16]).is_ok());
    }

    #[test]
    fn accumulate_then_deduct_restores_zero() {
        let mut image = FitImage::new(3, 3, &[0.5; 9]).unwrap();
        image.set_image(&[2.0; 9]).unwrap();

        let idx = image.index(1, 1);
        image.accumulate(idx, 10.0, 3.0);
        assert_eq!(image.bg_counts()[idx], 1);
        assert!((image.model_intensity(idx) - 13.5).abs() < 1e-12);

        image.deduct(idx, 10.0, 3.0);
        assert_eq!(image.bg_counts()[idx], 0);
        assert_eq!(image.f_data()[idx], 0.0);
        assert_eq!(image.bg_data()[idx], 0.0);
    }
}
