//! Shared helpers for integration tests: synthetic frame rendering and
//! ground-truth emitter definitions.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};

/// Ground-truth emitter for synthetic frames.
#[derive(Clone, Copy, Debug)]
pub struct Emitter {
    pub height: f64,
    pub x: f64,
    pub y: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
}

impl Emitter {
    pub fn round(height: f64, x: f64, y: f64, sigma: f64) -> Self {
        Self {
            height,
            x,
            y,
            sigma_x: sigma,
            sigma_y: sigma,
        }
    }
}

/// Renders emitters over a constant background, sampling each Gaussian at
/// pixel centers.
pub fn render(width: usize, height: usize, background: f64, emitters: &[Emitter]) -> Vec<f64> {
    let mut data = vec![background; width * height];
    for e in emitters {
        let xw = 1.0 / (2.0 * e.sigma_x * e.sigma_x);
        let yw = 1.0 / (2.0 * e.sigma_y * e.sigma_y);
        for py in 0..height {
            for px in 0..width {
                let dx = px as f64 - e.x;
                let dy = py as f64 - e.y;
                data[py * width + px] += e.height * (-dx * dx * xw - dy * dy * yw).exp();
            }
        }
    }
    data
}

/// Replaces each pixel with a Poisson draw of its expected count.
pub fn add_poisson_noise(data: &mut [f64], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for value in data.iter_mut() {
        if *value > 0.0 {
            *value = Poisson::new(*value).unwrap().sample(&mut rng);
        }
    }
}

/// Defocus sigma from the astigmatism curve, the inverse of what the
/// z-calibrated model stores.
pub fn defocus_sigma(w0: f64, c: f64, d: f64, a: f64, b: f64, z: f64) -> f64 {
    let u = (z - c) / d;
    let poly = 1.0 + u * u + a * u * u * u + b * u * u * u * u;
    0.5 * w0 * poly.sqrt()
}
