//! Astigmatic z fitting against the width calibration curve.

mod common;

use psffit::{
    FitConfig, FitState, GaussianPsf, PeakSeed, PeakStatus, Strategy, ZCalibration, ZWidthParams,
};

use common::{defocus_sigma, render, Emitter};

const W0: f64 = 3.0;
const CX: f64 = -0.2;
const CY: f64 = 0.2;
const D: f64 = 0.5;

fn calibration(min_z: f64, max_z: f64) -> ZCalibration {
    let wx = ZWidthParams {
        w0: W0,
        c: CX,
        d: D,
        a: 0.0,
        b: 0.0,
    };
    let wy = ZWidthParams {
        w0: W0,
        c: CY,
        d: D,
        a: 0.0,
        b: 0.0,
    };
    ZCalibration::new(wx, wy, min_z, max_z).unwrap()
}

fn defocused_frame(width: usize, height: usize, x: f64, y: f64, z: f64) -> Vec<f64> {
    let truth = Emitter {
        height: 500.0,
        x,
        y,
        sigma_x: defocus_sigma(W0, CX, D, 0.0, 0.0, z),
        sigma_y: defocus_sigma(W0, CY, D, 0.0, 0.0, z),
    };
    render(width, height, 20.0, &[truth])
}

fn z_state(cal: ZCalibration, image: &[f64], width: usize, height: usize) -> FitState<GaussianPsf> {
    let mut state = FitState::new(
        GaussianPsf::z_calibrated(cal),
        width,
        height,
        &vec![0.0; width * height],
        FitConfig {
            margin: 9,
            strategy: Strategy::LevenbergMarquardt,
            ..FitConfig::default()
        },
    )
    .unwrap();
    state.set_image(image).unwrap();
    state
}

fn run(state: &mut FitState<GaussianPsf>, max_sweeps: usize) {
    let mut sweeps = 0;
    while state.unconverged() > 0 && sweeps < max_sweeps {
        state.iterate();
        sweeps += 1;
    }
}

#[test]
fn recovers_defocus_from_widths() {
    // Defocused emitter at z = +0.2 (wider in x than y), seeded in focus.
    let width = 30;
    let height = 30;
    let image = defocused_frame(width, height, 15.3, 14.7, 0.2);

    let mut state = z_state(calibration(-0.6, 0.6), &image, width, height);
    state
        .new_peaks(&[PeakSeed::new(450.0, 15.0, 15.0, 20.0, 1.5)])
        .unwrap();

    run(&mut state, 500);
    assert_eq!(state.unconverged(), 0);

    let result = state.results()[0];
    assert_eq!(result.status, PeakStatus::Converged);
    assert!((result.z_center - 0.2).abs() < 0.01, "z = {}", result.z_center);
    assert!((result.x_center - 15.3).abs() < 1e-3);
    assert!((result.y_center - 14.7).abs() < 1e-3);

    // Reported sigmas follow the calibration curve at the fitted z.
    let expected_sx = defocus_sigma(W0, CX, D, 0.0, 0.0, result.z_center);
    assert!((result.x_sigma - expected_sx).abs() < 1e-6);
}

#[test]
fn out_of_range_z_seed_is_clamped_into_range() {
    let width = 30;
    let height = 30;
    let image = defocused_frame(width, height, 15.2, 14.8, 0.1);

    let mut state = z_state(calibration(-0.4, 0.4), &image, width, height);
    state
        .new_peaks(&[PeakSeed::new(450.0, 15.0, 15.0, 20.0, 1.5).with_z(0.9)])
        .unwrap();

    run(&mut state, 500);
    assert_eq!(state.unconverged(), 0);

    let result = state.results()[0];
    assert_eq!(result.status, PeakStatus::Converged);
    assert!(result.z_center <= 0.4 && result.z_center >= -0.4);
    assert!((result.z_center - 0.1).abs() < 0.01, "z = {}", result.z_center);
}

#[test]
fn widths_are_slaved_to_z() {
    // The z-calibrated model must never fit widths independently: after any
    // number of sweeps the stored widths match the curve at the current z.
    let width = 30;
    let height = 30;
    let image = defocused_frame(width, height, 15.0, 15.0, -0.15);

    let mut state = z_state(calibration(-0.6, 0.6), &image, width, height);
    state
        .new_peaks(&[PeakSeed::new(450.0, 14.8, 15.2, 20.0, 1.5)])
        .unwrap();

    for _ in 0..5 {
        state.iterate();
        let peak = &state.peaks()[0];
        let z = peak.params[psffit::peak::param::ZCENTER];
        let expected = defocus_sigma(W0, CX, D, 0.0, 0.0, z);
        let stored = (1.0 / (2.0 * peak.params[psffit::peak::param::XWIDTH])).sqrt();
        assert!((stored - expected).abs() < 1e-9, "sigma {stored} vs {expected}");
    }
}
