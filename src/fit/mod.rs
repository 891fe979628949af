//! Single-channel fit state.
//!
//! [`FitState`] owns the shared buffers, the peak list and a working-peak
//! scratch slot. All buffer mutation follows one protocol: a peak's Jacobian
//! and Hessian are computed with the peak still in the buffers, the peak is
//! then subtracted, updated, validated and re-added. The order matters for
//! overlapping peaks; the next peak's residual must not contain the peak
//! being updated, while its own derivatives must.

mod iterate;

use nalgebra::{DMatrix, DVector};

use crate::image::FitImage;
use crate::model::PsfModel;
use crate::peak::{param, Peak, PeakResult, PeakSeed, PeakStatus};
use crate::trace::{trace_event, trace_span};
use crate::util::{PsfFitError, PsfFitResult};
use crate::{LAMBDA_UP, MARGIN, NFITTING};

/// Iteration strategy for one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// One clamped Gauss-Newton step per peak per sweep.
    Original,
    /// Levenberg-Marquardt inner loop with trust adjustment per peak.
    #[default]
    LevenbergMarquardt,
}

/// Starting clamp values, in parameter order: height, x, x width, y,
/// y width, background, z.
pub const DEFAULT_CLAMP: [f64; NFITTING] = [1000.0, 1.0, 0.3, 1.0, 0.3, 100.0, 0.1];

/// Knobs for one fit.
#[derive(Clone, Copy, Debug)]
pub struct FitConfig {
    /// Relative error-change threshold for convergence.
    pub tolerance: f64,
    /// Unanalyzed edge around the image, in pixels. Also caps the footprint
    /// half-size. At most [`MARGIN`].
    pub margin: usize,
    /// Sweep strategy.
    pub strategy: Strategy,
    /// Starting clamp values per parameter.
    pub clamp: [f64; NFITTING],
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            tolerance: 1.0e-6,
            margin: MARGIN,
            strategy: Strategy::default(),
            clamp: DEFAULT_CLAMP,
        }
    }
}

/// Counters for the failure modes a fit can hit.
///
/// Reset on every [`FitState::new_peaks`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Cholesky factorization failures.
    pub n_dposv: u64,
    /// Peaks that drifted into the margin.
    pub n_margin: u64,
    /// Negative fitted heights.
    pub n_neg_height: u64,
    /// Negative fitted widths.
    pub n_neg_width: u64,
    /// Non-positive model intensity during error calculation.
    pub n_neg_fi: u64,
    /// Levenberg-Marquardt steps rejected for non-decreasing error.
    pub n_non_decr: u64,
    /// Total linear solves attempted.
    pub n_iterations: u64,
}

/// Fitting engine for one image.
#[derive(Clone, Debug)]
pub struct FitState<M> {
    pub(crate) model: M,
    pub(crate) image: FitImage,
    pub(crate) config: FitConfig,
    pub(crate) peaks: Vec<Peak>,
    pub(crate) working: Peak,
    pub(crate) diag: Diagnostics,
}

impl<M: PsfModel> FitState<M> {
    /// Creates a fit state for a `width x height` frame.
    ///
    /// `scmos_term` is the per-pixel `variance / gain^2` calibration; pass
    /// zeros for an EMCCD-style camera.
    pub fn new(
        model: M,
        width: usize,
        height: usize,
        scmos_term: &[f64],
        config: FitConfig,
    ) -> PsfFitResult<Self> {
        if !(config.tolerance > 0.0) {
            return Err(PsfFitError::InvalidInput("tolerance must be positive"));
        }
        if config.margin == 0 || config.margin > MARGIN {
            return Err(PsfFitError::InvalidInput("margin must be in 1..=MARGIN"));
        }
        let image = FitImage::new(width, height, scmos_term)?;
        let working = model.new_peak();
        Ok(Self {
            model,
            image,
            config,
            peaks: Vec::new(),
            working,
            diag: Diagnostics::default(),
        })
    }

    /// Stores a new observed frame, clearing all buffers and peaks.
    pub fn set_image(&mut self, image: &[f64]) -> PsfFitResult<()> {
        self.image.set_image(image)?;
        self.peaks.clear();
        Ok(())
    }

    /// Replaces the peak set with freshly seeded peaks.
    ///
    /// Seeds whose anchor violates the margin come out `Error` without
    /// touching the buffers. Everything else is added and gets an initial
    /// error evaluation.
    pub fn new_peaks(&mut self, seeds: &[PeakSeed]) -> PsfFitResult<()> {
        if !self.image.is_image_set() {
            return Err(PsfFitError::ImageNotSet);
        }
        let _span = trace_span!("new_peaks", count = seeds.len());

        self.diag = Diagnostics::default();
        self.image.reset_accumulators();
        self.peaks.clear();
        self.peaks.reserve(seeds.len());

        for seed in seeds {
            let mut peak = self.model.new_peak();
            peak.clamp = self.config.clamp;
            peak.status = seed.status;
            if seed.status == PeakStatus::Running {
                peak.error = 0.0;
                peak.error_old = 0.0;
            } else {
                peak.error = seed.error;
                peak.error_old = seed.error;
            }
            self.model
                .init_peak(&mut peak, seed, self.config.margin as i64);

            if !matches!(peak.status, PeakStatus::Error | PeakStatus::BadPeak)
                && self.anchor_outside_margin(&peak)
            {
                peak.status = PeakStatus::Error;
                self.diag.n_margin += 1;
            }
            if !matches!(peak.status, PeakStatus::Error | PeakStatus::BadPeak) {
                self.model.add_peak(&mut self.image, &mut peak);
            }
            self.peaks.push(peak);
        }

        for i in 0..self.peaks.len() {
            Self::calc_error_peak(
                &self.image,
                self.config.tolerance,
                &mut self.diag,
                &mut self.peaks[i],
            );
        }
        Ok(())
    }

    /// Number of peaks still `Running`; the outer loop's terminator.
    pub fn unconverged(&self) -> usize {
        self.peaks
            .iter()
            .filter(|p| p.status == PeakStatus::Running)
            .count()
    }

    /// Committed parameters, status and error per peak, in seed order.
    pub fn results(&self) -> Vec<PeakResult> {
        self.peaks.iter().map(PeakResult::from_peak).collect()
    }

    /// Failure-mode counters for the current peak set.
    pub fn diagnostics(&self) -> Diagnostics {
        self.diag
    }

    /// The committed peaks, for inspection.
    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    /// The shared image buffers, for inspection.
    pub fn image(&self) -> &FitImage {
        &self.image
    }

    /// The configured tolerance.
    pub fn tolerance(&self) -> f64 {
        self.config.tolerance
    }

    /// Externally rejects a peak: its contribution is removed from the
    /// buffers and it is skipped by subsequent sweeps.
    pub fn mark_bad(&mut self, index: usize) {
        if self.peaks[index].added {
            self.model
                .subtract_peak(&mut self.image, &mut self.peaks[index]);
        }
        self.peaks[index].status = PeakStatus::BadPeak;
    }

    /// Adds the committed peak `index` back into the buffers.
    pub fn add_peak(&mut self, index: usize) {
        self.model
            .add_peak(&mut self.image, &mut self.peaks[index]);
    }

    /// Removes the committed peak `index` from the buffers.
    pub fn subtract_peak(&mut self, index: usize) {
        self.model
            .subtract_peak(&mut self.image, &mut self.peaks[index]);
    }

    pub(crate) fn recalc_error(&mut self, index: usize) -> bool {
        Self::calc_error_peak(
            &self.image,
            self.config.tolerance,
            &mut self.diag,
            &mut self.peaks[index],
        )
    }

    fn anchor_outside_margin(&self, peak: &Peak) -> bool {
        let margin = self.config.margin as i64;
        let w = self.image.width() as i64;
        let h = self.image.height() as i64;
        peak.xi <= margin || peak.xi >= w - margin - 1 || peak.yi <= margin || peak.yi >= h - margin - 1
    }

    /// Poisson deviance of the working footprint, with status upkeep.
    ///
    /// On success stores the new error, keeps the previous one in
    /// `error_old`, and promotes the peak to `Converged` when the change
    /// relative to the previous error drops below tolerance. A non-positive
    /// model intensity fails the peak (`Error`, `n_neg_fi`) and returns
    /// false.
    pub(crate) fn calc_error_peak(
        image: &FitImage,
        tolerance: f64,
        diag: &mut Diagnostics,
        peak: &mut Peak,
    ) -> bool {
        if peak.status != PeakStatus::Running {
            return true;
        }
        let mut err = 0.0;
        for j in -peak.wy..=peak.wy {
            for k in -peak.wx..=peak.wx {
                let idx = image.index(peak.xi + k, peak.yi + j);
                let fi = image.model_intensity(idx);
                if fi <= 0.0 {
                    peak.status = PeakStatus::Error;
                    diag.n_neg_fi += 1;
                    return false;
                }
                let xi = image.observed(idx);
                // Poisson deviance; the x*ln(f/x) term vanishes at x = 0.
                err += if xi > 0.0 {
                    2.0 * ((fi - xi) - xi * (fi / xi).ln())
                } else {
                    2.0 * (fi - xi)
                };
            }
        }
        let old = peak.error;
        peak.error_old = old;
        peak.error = err;
        if ((err - old).abs() / old) < tolerance {
            peak.status = PeakStatus::Converged;
        }
        true
    }

    /// Margin and sign checks on the working peak, incrementing the matching
    /// diagnostics. All checks run even after the first failure, as each
    /// tracks its own counter.
    pub(crate) fn check_working(&mut self) -> bool {
        let margin = self.config.margin as i64;
        let w = self.image.width() as i64;
        let h = self.image.height() as i64;
        let peak = &mut self.working;
        let mut ok = true;
        if peak.xi <= margin
            || peak.xi >= w - margin - 1
            || peak.yi <= margin
            || peak.yi >= h - margin - 1
        {
            peak.status = PeakStatus::Error;
            self.diag.n_margin += 1;
            ok = false;
        }
        if peak.params[param::HEIGHT] < 0.0 {
            peak.status = PeakStatus::Error;
            self.diag.n_neg_height += 1;
            ok = false;
        }
        if peak.params[param::XWIDTH] < 0.0 || peak.params[param::YWIDTH] < 0.0 {
            peak.status = PeakStatus::Error;
            self.diag.n_neg_width += 1;
            ok = false;
        }
        ok
    }

    pub(crate) fn clone_to_working(&mut self, index: usize) {
        self.working = self.peaks[index].clone();
    }

    pub(crate) fn commit_working(&mut self, index: usize) {
        self.peaks[index] = self.working.clone();
    }

    /// Restores the working peak from its committed state after a rejected
    /// Levenberg-Marquardt step: damping is raised, the add/subtract state is
    /// preserved, and the status is left at `Error` in case this was the last
    /// attempt.
    pub(crate) fn restore_working(&mut self, index: usize) {
        let added = self.working.added;
        let lambda = self.working.lambda * LAMBDA_UP;
        self.working = self.peaks[index].clone();
        self.working.added = added;
        self.working.lambda = lambda;
        self.working.status = PeakStatus::Error;
    }

    pub(crate) fn calc_error_working(&mut self) -> bool {
        Self::calc_error_peak(
            &self.image,
            self.config.tolerance,
            &mut self.diag,
            &mut self.working,
        )
    }

    pub(crate) fn working_jacobian_hessian(&self) -> (DVector<f64>, DMatrix<f64>) {
        self.model.calc_jacobian_hessian(&self.image, &self.working)
    }

    pub(crate) fn add_working(&mut self) {
        self.model.add_peak(&mut self.image, &mut self.working);
    }

    pub(crate) fn subtract_working(&mut self) {
        self.model.subtract_peak(&mut self.image, &mut self.working);
    }

    pub(crate) fn refresh_working_footprint(&mut self) {
        self.model
            .refresh_footprint(&mut self.working, self.config.margin as i64);
    }

    pub(crate) fn emit_sweep_event(&self) {
        trace_event!(
            "sweep",
            unconverged = self.unconverged(),
            solves = self.diag.n_iterations
        );
    }
}

/// Solves the symmetric positive-definite system `H * delta = J`.
///
/// Returns `None` when the Cholesky factorization fails, including on
/// non-finite input; the caller maps that to the `Error` status policy.
pub(crate) fn solve_spd(hessian: DMatrix<f64>, jacobian: DVector<f64>) -> Option<DVector<f64>> {
    if hessian.iter().any(|v| !v.is_finite()) || jacobian.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let chol = hessian.cholesky()?;
    Some(chol.solve(&jacobian))
}
