//! Width-versus-z calibration for astigmatic 3D fitting.
//!
//! The defocus curve per axis is `w(z) = w0 * sqrt(1 + u^2 + A*u^3 + B*u^4)`
//! with `u = (z - c) / d`. In the inverse-exponent convention the stored
//! width becomes `2 / (w0^2 * (1 + u^2 + A*u^3 + B*u^4))`.

use crate::util::{PsfFitError, PsfFitResult};

/// Defocus curve coefficients for one axis: `(w0, c, d, A, B)`.
#[derive(Clone, Copy, Debug)]
pub struct ZWidthParams {
    /// In-focus width in pixels.
    pub w0: f64,
    /// Focal offset, z units.
    pub c: f64,
    /// Depth scale, z units.
    pub d: f64,
    /// Cubic coefficient.
    pub a: f64,
    /// Quartic coefficient.
    pub b: f64,
}

#[derive(Clone, Copy, Debug)]
struct Axis {
    w0_sq: f64,
    c: f64,
    d: f64,
    a: f64,
    b: f64,
}

impl Axis {
    fn new(p: ZWidthParams) -> Self {
        Self {
            w0_sq: p.w0 * p.w0,
            c: p.c,
            d: p.d,
            a: p.a,
            b: p.b,
        }
    }

    /// Inverse-exponent width and the squared polynomial term at `z`.
    fn width(&self, z: f64) -> (f64, f64) {
        let z0 = (z - self.c) / self.d;
        let z1 = z0 * z0;
        let z2 = z1 * z0;
        let z3 = z2 * z0;
        let tmp = 1.0 + z1 + self.a * z2 + self.b * z3;
        (2.0 / (self.w0_sq * tmp), tmp * tmp)
    }

    /// Width gradient used in the z Jacobian column.
    ///
    /// `term` must be the squared polynomial from the matching `width` call.
    fn gradient(&self, z: f64, term: f64) -> f64 {
        let z0 = (z - self.c) / self.d;
        let z1 = z0 * z0;
        let z2 = z1 * z0;
        let zt = 2.0 * z0 + 3.0 * self.a * z1 + 4.0 * self.b * z2;
        -2.0 * zt / (self.w0_sq * term)
    }
}

/// Per-axis defocus calibration plus the allowed z range.
#[derive(Clone, Copy, Debug)]
pub struct ZCalibration {
    wx: Axis,
    wy: Axis,
    min_z: f64,
    max_z: f64,
}

impl ZCalibration {
    /// Builds a calibration from per-axis coefficients and a z range.
    pub fn new(
        wx: ZWidthParams,
        wy: ZWidthParams,
        min_z: f64,
        max_z: f64,
    ) -> PsfFitResult<Self> {
        if wx.w0 <= 0.0 || wy.w0 <= 0.0 {
            return Err(PsfFitError::InvalidInput("z calibration w0 must be positive"));
        }
        if wx.d == 0.0 || wy.d == 0.0 {
            return Err(PsfFitError::InvalidInput("z calibration depth scale must be nonzero"));
        }
        if !(min_z < max_z) {
            return Err(PsfFitError::InvalidInput("z range must satisfy min_z < max_z"));
        }
        Ok(Self {
            wx: Axis::new(wx),
            wy: Axis::new(wy),
            min_z,
            max_z,
        })
    }

    /// Minimum allowed z.
    pub fn min_z(&self) -> f64 {
        self.min_z
    }

    /// Maximum allowed z.
    pub fn max_z(&self) -> f64 {
        self.max_z
    }

    /// Clamps `z` into the calibrated range.
    pub fn clamp_z(&self, z: f64) -> f64 {
        z.clamp(self.min_z, self.max_z)
    }

    /// `(x_width, wx_term, y_width, wy_term)` at `z`.
    pub(crate) fn widths(&self, z: f64) -> (f64, f64, f64, f64) {
        let (xw, xt) = self.wx.width(z);
        let (yw, yt) = self.wy.width(z);
        (xw, xt, yw, yt)
    }

    /// Width gradients `(gx, gy)` for the z Jacobian column.
    pub(crate) fn gradients(&self, z: f64, wx_term: f64, wy_term: f64) -> (f64, f64) {
        (self.wx.gradient(z, wx_term), self.wy.gradient(z, wy_term))
    }
}
