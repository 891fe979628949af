//! Tabulated PSF families.
//!
//! Cubic-spline, pupil-function and PSF-FFT models all reduce to the same
//! shape here: an externally built table that can be sampled for a PSF value
//! and its x/y/z partials at a sub-pixel offset. Height and background enter
//! the model linearly, so the fitting engine treats every tabulated family
//! identically; only the table differs. Building the tables is out of scope.

use nalgebra::{DMatrix, DVector};

use crate::image::FitImage;
use crate::model::{PsfModel, PsfSample};
use crate::peak::{param, width_from_sigma, GridScratch, ModelScratch, Peak, PeakSeed};

/// An externally constructed PSF tabulation.
///
/// `sample` is queried at pixel offsets `(dx, dy)` from the sub-pixel peak
/// center, for the peak's current z. Implementations must return values and
/// partials that are consistent with each other; the engine differentiates
/// nothing itself.
pub trait PsfTable {
    /// Half-size of the usable footprint in pixels.
    fn half_width(&self) -> i64;

    /// Valid z range `(min_z, max_z)`.
    fn z_range(&self) -> (f64, f64);

    /// PSF value and gradient at the given offset and z.
    fn sample(&self, dx: f64, dy: f64, z: f64) -> PsfSample;
}

/// Fitting model backed by a [`PsfTable`].
///
/// Active parameters are height, x, y, z and background, in the same solver
/// order the z-calibrated Gaussian uses, so tabulated channels can be driven
/// by the multi-channel coordinator.
#[derive(Clone, Debug)]
pub struct TabulatedPsf<T> {
    table: T,
}

const TABULATED_PARAMS: [usize; 5] = [
    param::HEIGHT,
    param::XCENTER,
    param::YCENTER,
    param::ZCENTER,
    param::BACKGROUND,
];

impl<T: PsfTable> TabulatedPsf<T> {
    /// Wraps a table for fitting.
    pub fn new(table: T) -> Self {
        Self { table }
    }

    /// The wrapped table.
    pub fn table(&self) -> &T {
        &self.table
    }
}

impl<T: PsfTable> PsfModel for TabulatedPsf<T> {
    fn jac_size(&self) -> usize {
        TABULATED_PARAMS.len()
    }

    fn jacobian_params(&self) -> &'static [usize] {
        &TABULATED_PARAMS
    }

    fn new_peak(&self) -> Peak {
        Peak::new(ModelScratch::Grid(GridScratch::default()))
    }

    fn init_peak(&self, peak: &mut Peak, seed: &PeakSeed, margin: i64) {
        peak.params[param::HEIGHT] = seed.height;
        peak.params[param::XCENTER] = seed.x_center;
        peak.params[param::YCENTER] = seed.y_center;
        peak.params[param::BACKGROUND] = seed.background;
        peak.params[param::ZCENTER] = seed.z_center;
        // Widths are not fit; they are carried through for reporting only.
        peak.params[param::XWIDTH] = width_from_sigma(seed.x_sigma);
        peak.params[param::YWIDTH] = width_from_sigma(seed.y_sigma);
        peak.xi = peak.params[param::XCENTER] as i64;
        peak.yi = peak.params[param::YCENTER] as i64;
        peak.wx = self.table.half_width().min(margin);
        peak.wy = peak.wx;
    }

    fn add_peak(&self, image: &mut FitImage, peak: &mut Peak) {
        debug_assert!(!peak.added, "peak added twice");
        let (xc, yc) = (peak.xi, peak.yi);
        let (wx, wy) = (peak.wx, peak.wy);
        let xcenter = peak.params[param::XCENTER];
        let ycenter = peak.params[param::YCENTER];
        let z = peak.params[param::ZCENTER];
        let bg = peak.params[param::BACKGROUND];
        let mag = peak.params[param::HEIGHT];

        let cols = (2 * wx + 1) as usize;
        let rows = (2 * wy + 1) as usize;
        let samples = &mut peak.scratch.grid_mut().samples;
        samples.clear();
        samples.reserve(rows * cols);
        for j in -wy..=wy {
            for k in -wx..=wx {
                let s = self
                    .table
                    .sample((xc + k) as f64 - xcenter, (yc + j) as f64 - ycenter, z);
                samples.push(s);
            }
        }

        let samples = &peak.scratch.grid().samples;
        let mut n = 0;
        for j in -wy..=wy {
            for k in -wx..=wx {
                let idx = image.index(xc + k, yc + j);
                image.accumulate(idx, mag * samples[n].value, bg);
                n += 1;
            }
        }
        peak.added = true;
    }

    fn subtract_peak(&self, image: &mut FitImage, peak: &mut Peak) {
        debug_assert!(peak.added, "peak subtracted twice");
        let (xc, yc) = (peak.xi, peak.yi);
        let (wx, wy) = (peak.wx, peak.wy);
        let bg = peak.params[param::BACKGROUND];
        let mag = peak.params[param::HEIGHT];
        let samples = &peak.scratch.grid().samples;
        let mut n = 0;
        for j in -wy..=wy {
            for k in -wx..=wx {
                let idx = image.index(xc + k, yc + j);
                image.deduct(idx, mag * samples[n].value, bg);
                n += 1;
            }
        }
        peak.added = false;
    }

    fn calc_jacobian_hessian(
        &self,
        image: &FitImage,
        peak: &Peak,
    ) -> (DVector<f64>, DMatrix<f64>) {
        const N: usize = 5;
        let mag = peak.params[param::HEIGHT];
        let samples = &peak.scratch.grid().samples;
        let mut jacobian = DVector::zeros(N);
        let mut hessian = DMatrix::zeros(N, N);
        let mut n = 0;
        for j in -peak.wy..=peak.wy {
            for k in -peak.wx..=peak.wx {
                let idx = image.index(peak.xi + k, peak.yi + j);
                let fi = image.model_intensity(idx);
                let xi = image.observed(idx);
                let s = samples[n];
                n += 1;
                // The table derivatives are with respect to the pixel offset,
                // so the center partials pick up a sign flip.
                let jt = [s.value, -mag * s.dx, -mag * s.dy, mag * s.dz, 1.0];

                let t1 = 2.0 * (1.0 - xi / fi);
                let t2 = 2.0 * xi / (fi * fi);
                for a in 0..N {
                    jacobian[a] += t1 * jt[a];
                    for b in 0..N {
                        hessian[(a, b)] += t2 * jt[a] * jt[b];
                    }
                }
            }
        }
        (jacobian, hessian)
    }

    fn update_peak(&self, peak: &mut Peak, deltas: &DVector<f64>) {
        for (slot, &pi) in TABULATED_PARAMS.iter().enumerate() {
            peak.update_param(deltas[slot], pi);
        }
        peak.settle_anchor();
        self.check_z_range(peak);
    }

    fn refresh_footprint(&self, _peak: &mut Peak, _margin: i64) {
        // The tabulated footprint is fixed by the table.
    }

    fn check_z_range(&self, peak: &mut Peak) {
        let (min_z, max_z) = self.table.z_range();
        peak.params[param::ZCENTER] = peak.params[param::ZCENTER].clamp(min_z, max_z);
    }
}
