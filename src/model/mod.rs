//! PSF models.
//!
//! A [`PsfModel`] evaluates a peak's shape over its integer footprint, adds
//! or removes that shape from the shared fit buffers, and assembles the
//! Gauss-Newton Jacobian and Hessian of the Poisson negative log-likelihood.
//! The Gaussian family lives in [`gaussian`]; tabulated families (cubic
//! spline, pupil function, PSF FFT) plug in through [`tabulated`] with their
//! own sampled values and gradients.

pub mod gaussian;
pub mod tabulated;
pub mod zcal;

use nalgebra::{DMatrix, DVector};

use crate::image::FitImage;
use crate::peak::{Peak, PeakSeed};
use crate::HYSTERESIS;

/// PSF value and gradient at one pixel offset.
#[derive(Clone, Copy, Debug, Default)]
pub struct PsfSample {
    /// Normalized PSF value.
    pub value: f64,
    /// Partial derivative with respect to the x offset.
    pub dx: f64,
    /// Partial derivative with respect to the y offset.
    pub dy: f64,
    /// Partial derivative with respect to z.
    pub dz: f64,
}

/// One PSF family, polymorphic over the fitting engine.
///
/// Implementations own no per-peak state; everything peak-specific lives in
/// the peak's scratch, re-derived from its parameters on each add.
pub trait PsfModel {
    /// Number of active fit parameters.
    fn jac_size(&self) -> usize;

    /// Parameter-array index for each Jacobian slot, in solver order.
    fn jacobian_params(&self) -> &'static [usize];

    /// Creates a peak with scratch storage matching this model.
    fn new_peak(&self) -> Peak;

    /// Fills parameters, anchor and footprint from a seed estimate.
    fn init_peak(&self, peak: &mut Peak, seed: &PeakSeed, margin: i64);

    /// Evaluates the shape at the current parameters and adds it to the
    /// foreground and background buffers over the peak footprint.
    fn add_peak(&self, image: &mut FitImage, peak: &mut Peak);

    /// Exact inverse of [`PsfModel::add_peak`], using the stored scratch.
    fn subtract_peak(&self, image: &mut FitImage, peak: &mut Peak);

    /// Gauss-Newton Jacobian and Hessian over the peak footprint.
    ///
    /// The peak must currently be added: the per-pixel model intensity
    /// includes the peak's own contribution.
    fn calc_jacobian_hessian(&self, image: &FitImage, peak: &Peak)
        -> (DVector<f64>, DMatrix<f64>);

    /// Applies solved deltas through the per-parameter clamps, then settles
    /// the integer anchor and enforces the z range.
    fn update_peak(&self, peak: &mut Peak, deltas: &DVector<f64>);

    /// Recomputes dependent widths and the footprint after an update.
    fn refresh_footprint(&self, peak: &mut Peak, margin: i64);

    /// Clamps the peak z into the model's valid range, if it has one.
    fn check_z_range(&self, peak: &mut Peak);
}

/// Half-window for a peak of the given inverse-exponent width.
///
/// Sized as `4 * sigma` with hysteresis on changes so that the footprint does
/// not chatter between add/subtract cycles, and capped at the margin. A
/// negative width (transiently possible mid-update) pins the window at 1.
pub(crate) fn calc_half_width(peak_width: f64, old_w: i64, margin: i64) -> i64 {
    if peak_width < 0.0 {
        return 1;
    }
    let mut new_w = old_w;
    let tmp = 4.0 * (1.0 / (2.0 * peak_width)).sqrt();
    if (tmp - old_w as f64 - 0.5).abs() > HYSTERESIS {
        new_w = tmp as i64;
    }
    new_w.min(margin)
}
