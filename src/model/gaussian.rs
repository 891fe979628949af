//! The 2D Gaussian PSF family.
//!
//! Four variants share one evaluation core: fixed widths, a single isotropic
//! width, independent x/y widths, and widths driven by a z calibration
//! curve. The per-pixel model is
//! `height * exp(-xw*dx^2 - yw*dy^2) + background + scmos_term`, evaluated
//! over the peak footprint with separable 1D exponential tables cached in
//! the peak scratch.

use nalgebra::{DMatrix, DVector};

use crate::image::FitImage;
use crate::model::zcal::ZCalibration;
use crate::model::{calc_half_width, PsfModel};
use crate::peak::{param, width_from_sigma, ModelScratch, Peak, PeakSeed};

#[derive(Clone, Debug)]
enum Variant {
    FixedWidth,
    Isotropic,
    Independent,
    ZCalibrated(ZCalibration),
}

/// Gaussian PSF model.
#[derive(Clone, Debug)]
pub struct GaussianPsf {
    variant: Variant,
}

const FIXED_PARAMS: [usize; 4] = [
    param::HEIGHT,
    param::XCENTER,
    param::YCENTER,
    param::BACKGROUND,
];
const ISO_PARAMS: [usize; 5] = [
    param::HEIGHT,
    param::XCENTER,
    param::YCENTER,
    param::XWIDTH,
    param::BACKGROUND,
];
const FREE_PARAMS: [usize; 6] = [
    param::HEIGHT,
    param::XCENTER,
    param::XWIDTH,
    param::YCENTER,
    param::YWIDTH,
    param::BACKGROUND,
];
const Z_PARAMS: [usize; 5] = [
    param::HEIGHT,
    param::XCENTER,
    param::YCENTER,
    param::ZCENTER,
    param::BACKGROUND,
];

impl GaussianPsf {
    /// Both widths stay at their seeded values.
    pub fn fixed_width() -> Self {
        Self {
            variant: Variant::FixedWidth,
        }
    }

    /// One shared width for x and y.
    pub fn isotropic() -> Self {
        Self {
            variant: Variant::Isotropic,
        }
    }

    /// Independent x and y widths (astigmatic "3D" fitting).
    pub fn independent() -> Self {
        Self {
            variant: Variant::Independent,
        }
    }

    /// Widths follow the calibration curve; z is a fit parameter.
    pub fn z_calibrated(calibration: ZCalibration) -> Self {
        Self {
            variant: Variant::ZCalibrated(calibration),
        }
    }

    fn set_widths_from_z(cal: &ZCalibration, peak: &mut Peak) {
        let (xw, wx_term, yw, wy_term) = cal.widths(peak.params[param::ZCENTER]);
        peak.params[param::XWIDTH] = xw;
        peak.params[param::YWIDTH] = yw;
        let scratch = peak.scratch.gaussian_mut();
        scratch.wx_term = wx_term;
        scratch.wy_term = wy_term;
    }
}

impl PsfModel for GaussianPsf {
    fn jac_size(&self) -> usize {
        self.jacobian_params().len()
    }

    fn jacobian_params(&self) -> &'static [usize] {
        match self.variant {
            Variant::FixedWidth => &FIXED_PARAMS,
            Variant::Isotropic => &ISO_PARAMS,
            Variant::Independent => &FREE_PARAMS,
            Variant::ZCalibrated(_) => &Z_PARAMS,
        }
    }

    fn new_peak(&self) -> Peak {
        Peak::new(ModelScratch::Gaussian(Box::default()))
    }

    fn init_peak(&self, peak: &mut Peak, seed: &PeakSeed, margin: i64) {
        peak.params[param::HEIGHT] = seed.height;
        peak.params[param::XCENTER] = seed.x_center;
        peak.params[param::YCENTER] = seed.y_center;
        peak.params[param::BACKGROUND] = seed.background;
        peak.params[param::ZCENTER] = seed.z_center;
        match &self.variant {
            Variant::ZCalibrated(cal) => Self::set_widths_from_z(cal, peak),
            _ => {
                peak.params[param::XWIDTH] = width_from_sigma(seed.x_sigma);
                peak.params[param::YWIDTH] = width_from_sigma(seed.y_sigma);
            }
        }
        peak.xi = peak.params[param::XCENTER] as i64;
        peak.yi = peak.params[param::YCENTER] as i64;
        peak.wx = calc_half_width(peak.params[param::XWIDTH], -10, margin);
        peak.wy = calc_half_width(peak.params[param::YWIDTH], -10, margin);
    }

    fn add_peak(&self, image: &mut FitImage, peak: &mut Peak) {
        debug_assert!(!peak.added, "peak added twice");
        let (xc, yc) = (peak.xi, peak.yi);
        let (wx, wy) = (peak.wx, peak.wy);
        {
            let xcenter = peak.params[param::XCENTER];
            let ycenter = peak.params[param::YCENTER];
            let xwidth = peak.params[param::XWIDTH];
            let ywidth = peak.params[param::YWIDTH];
            let scratch = peak.scratch.gaussian_mut();
            for j in (xc - wx)..=(xc + wx) {
                let xt = j as f64 - xcenter;
                let n = (j - xc + wx) as usize;
                scratch.xt[n] = xt;
                scratch.ext[n] = (-xt * xt * xwidth).exp();
            }
            for j in (yc - wy)..=(yc + wy) {
                let yt = j as f64 - ycenter;
                let n = (j - yc + wy) as usize;
                scratch.yt[n] = yt;
                scratch.eyt[n] = (-yt * yt * ywidth).exp();
            }
        }

        let bg = peak.params[param::BACKGROUND];
        let mag = peak.params[param::HEIGHT];
        let scratch = peak.scratch.gaussian();
        for j in -wy..=wy {
            let eyt = scratch.eyt[(j + wy) as usize];
            for k in -wx..=wx {
                let idx = image.index(xc + k, yc + j);
                image.accumulate(idx, mag * eyt * scratch.ext[(k + wx) as usize], bg);
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
        let scratch = peak.scratch.gaussian();
        for j in -wy..=wy {
            let eyt = scratch.eyt[(j + wy) as usize];
            for k in -wx..=wx {
                let idx = image.index(xc + k, yc + j);
                image.deduct(idx, mag * eyt * scratch.ext[(k + wx) as usize], bg);
            }
        }
        peak.added = false;
    }

    fn calc_jacobian_hessian(
        &self,
        image: &FitImage,
        peak: &Peak,
    ) -> (DVector<f64>, DMatrix<f64>) {
        let a1 = peak.params[param::HEIGHT];
        match &self.variant {
            Variant::FixedWidth => {
                let width = peak.params[param::XWIDTH];
                accumulate_jh::<4>(image, peak, |xt, yt, e_t| {
                    [
                        e_t,
                        2.0 * a1 * width * xt * e_t,
                        2.0 * a1 * width * yt * e_t,
                        1.0,
                    ]
                })
            }
            Variant::Isotropic => {
                let width = peak.params[param::XWIDTH];
                accumulate_jh::<5>(image, peak, |xt, yt, e_t| {
                    [
                        e_t,
                        2.0 * a1 * width * xt * e_t,
                        2.0 * a1 * width * yt * e_t,
                        -a1 * xt * xt * e_t - a1 * yt * yt * e_t,
                        1.0,
                    ]
                })
            }
            Variant::Independent => {
                let a3 = peak.params[param::XWIDTH];
                let a5 = peak.params[param::YWIDTH];
                accumulate_jh::<6>(image, peak, |xt, yt, e_t| {
                    [
                        e_t,
                        2.0 * a1 * a3 * xt * e_t,
                        -a1 * xt * xt * e_t,
                        2.0 * a1 * a5 * yt * e_t,
                        -a1 * yt * yt * e_t,
                        1.0,
                    ]
                })
            }
            Variant::ZCalibrated(cal) => {
                let a3 = peak.params[param::XWIDTH];
                let a5 = peak.params[param::YWIDTH];
                let scratch = peak.scratch.gaussian();
                let (gx, gy) = cal.gradients(
                    peak.params[param::ZCENTER],
                    scratch.wx_term,
                    scratch.wy_term,
                );
                accumulate_jh::<5>(image, peak, |xt, yt, e_t| {
                    [
                        e_t,
                        2.0 * a1 * a3 * xt * e_t,
                        2.0 * a1 * a5 * yt * e_t,
                        -a1 * xt * xt * gx * e_t - a1 * yt * yt * gy * e_t,
                        1.0,
                    ]
                })
            }
        }
    }

    fn update_peak(&self, peak: &mut Peak, deltas: &DVector<f64>) {
        for (slot, &pi) in self.jacobian_params().iter().enumerate() {
            peak.update_param(deltas[slot], pi);
        }
        // The isotropic width delta comes from the x column only; the y width
        // is kept equal by assignment.
        if matches!(self.variant, Variant::Isotropic) {
            peak.params[param::YWIDTH] = peak.params[param::XWIDTH];
        }
        peak.settle_anchor();
        self.check_z_range(peak);
    }

    fn refresh_footprint(&self, peak: &mut Peak, margin: i64) {
        match &self.variant {
            Variant::FixedWidth => {}
            Variant::Isotropic => {
                peak.wx = calc_half_width(peak.params[param::XWIDTH], peak.wx, margin);
                peak.wy = peak.wx;
            }
            Variant::Independent => {
                peak.wx = calc_half_width(peak.params[param::XWIDTH], peak.wx, margin);
                peak.wy = calc_half_width(peak.params[param::YWIDTH], peak.wy, margin);
            }
            Variant::ZCalibrated(cal) => {
                Self::set_widths_from_z(cal, peak);
                peak.wx = calc_half_width(peak.params[param::XWIDTH], peak.wx, margin);
                peak.wy = calc_half_width(peak.params[param::YWIDTH], peak.wy, margin);
            }
        }
    }

    fn check_z_range(&self, peak: &mut Peak) {
        if let Variant::ZCalibrated(cal) = &self.variant {
            peak.params[param::ZCENTER] = cal.clamp_z(peak.params[param::ZCENTER]);
        }
    }
}

/// Sums Jacobian and Hessian contributions over the peak footprint.
///
/// Per pixel the Jacobian weight is `2*(1 - x/f)` and the Hessian weight
/// `2*x/f^2`, with second-derivative terms omitted (Gauss-Newton). The full
/// symmetric Hessian is written out so the Cholesky factorization can read
/// either triangle.
fn accumulate_jh<const N: usize>(
    image: &FitImage,
    peak: &Peak,
    mut jt_fn: impl FnMut(f64, f64, f64) -> [f64; N],
) -> (DVector<f64>, DMatrix<f64>) {
    let mut jacobian = DVector::zeros(N);
    let mut hessian = DMatrix::zeros(N, N);
    let scratch = peak.scratch.gaussian();
    for j in -peak.wy..=peak.wy {
        let yt = scratch.yt[(j + peak.wy) as usize];
        let eyt = scratch.eyt[(j + peak.wy) as usize];
        for k in -peak.wx..=peak.wx {
            let idx = image.index(peak.xi + k, peak.yi + j);
            let fi = image.model_intensity(idx);
            let xi = image.observed(idx);
            let xt = scratch.xt[(k + peak.wx) as usize];
            let e_t = scratch.ext[(k + peak.wx) as usize] * eyt;
            let jt = jt_fn(xt, yt, e_t);

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
