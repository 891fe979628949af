//! Error types for psffit.

use thiserror::Error;

/// Result alias for psffit operations.
pub type PsfFitResult<T> = std::result::Result<T, PsfFitError>;

/// Errors that can occur when setting up or driving a fit.
///
/// These cover caller-contract violations only. Numerical failures during
/// fitting (singular Hessian, peak drifting off the image, negative model
/// intensity) are not errors; they are per-peak status codes tracked by
/// [`Diagnostics`](crate::fit::Diagnostics).
#[derive(Debug, Error)]
pub enum PsfFitError {
    /// The image dimensions are unusable.
    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions {
        /// Requested width in pixels.
        width: usize,
        /// Requested height in pixels.
        height: usize,
    },
    /// A buffer did not have the expected number of elements.
    #[error("size mismatch for {context}: expected {expected}, got {got}")]
    SizeMismatch {
        /// What the buffer was for.
        context: &'static str,
        /// Expected element count.
        expected: usize,
        /// Actual element count.
        got: usize,
    },
    /// Peaks were added before an observed image was set.
    #[error("no image set: call set_image() before adding peaks")]
    ImageNotSet,
    /// The input data or parameters are invalid.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}
