//! End-to-end fitting scenarios for the single-channel engine.

mod common;

use psffit::{FitConfig, FitState, GaussianPsf, PeakSeed, PeakStatus, Strategy};

use common::{add_poisson_noise, render, Emitter};

fn fit_until_done<M: psffit::PsfModel>(state: &mut FitState<M>, max_sweeps: usize) -> usize {
    let mut sweeps = 0;
    while state.unconverged() > 0 && sweeps < max_sweeps {
        state.iterate();
        sweeps += 1;
    }
    sweeps
}

#[test]
fn recovers_single_peak_parameters() {
    // One noiseless peak at (5.3, 4.7) on a 10x10 frame, seeded at the pixel
    // center next door.
    let width = 10;
    let height = 10;
    let image = render(width, height, 10.0, &[Emitter::round(100.0, 5.3, 4.7, 1.0)]);

    let mut state = FitState::new(
        GaussianPsf::independent(),
        width,
        height,
        &vec![0.0; width * height],
        FitConfig {
            tolerance: 1e-6,
            margin: 2,
            strategy: Strategy::LevenbergMarquardt,
            clamp: [1000.0, 1.0, 0.3, 1.0, 0.3, 100.0, 0.1],
        },
    )
    .unwrap();
    state.set_image(&image).unwrap();
    state
        .new_peaks(&[PeakSeed::new(100.0, 5.0, 5.0, 10.0, 1.0)])
        .unwrap();

    fit_until_done(&mut state, 200);
    assert_eq!(state.unconverged(), 0);

    let result = state.results()[0];
    assert_eq!(result.status, PeakStatus::Converged);
    assert!((result.x_center - 5.3).abs() < 1e-4, "x = {}", result.x_center);
    assert!((result.y_center - 4.7).abs() < 1e-4, "y = {}", result.y_center);
    assert!((result.height - 100.0).abs() < 0.1, "height = {}", result.height);
    assert!((result.background - 10.0).abs() < 0.1);
}

#[test]
fn original_strategy_recovers_single_peak() {
    let width = 20;
    let height = 20;
    let image = render(width, height, 8.0, &[Emitter::round(150.0, 9.6, 10.4, 1.1)]);

    let mut state = FitState::new(
        GaussianPsf::independent(),
        width,
        height,
        &vec![0.0; width * height],
        FitConfig {
            margin: 4,
            strategy: Strategy::Original,
            ..FitConfig::default()
        },
    )
    .unwrap();
    state.set_image(&image).unwrap();
    state
        .new_peaks(&[PeakSeed::new(140.0, 9.3, 10.6, 8.0, 1.1)])
        .unwrap();

    fit_until_done(&mut state, 500);
    assert_eq!(state.unconverged(), 0);

    let result = state.results()[0];
    assert_eq!(result.status, PeakStatus::Converged);
    assert!((result.x_center - 9.6).abs() < 1e-3);
    assert!((result.y_center - 10.4).abs() < 1e-3);
    assert!((result.height - 150.0).abs() < 0.5);
}

#[test]
fn zero_noise_fit_converges_to_machine_precision() {
    let width = 20;
    let height = 20;
    let image = render(width, height, 6.0, &[Emitter::round(120.0, 10.2, 9.7, 1.0)]);

    let mut state = FitState::new(
        GaussianPsf::independent(),
        width,
        height,
        &vec![0.0; width * height],
        FitConfig {
            tolerance: 1e-12,
            margin: 4,
            ..FitConfig::default()
        },
    )
    .unwrap();
    state.set_image(&image).unwrap();
    state
        .new_peaks(&[PeakSeed::new(110.0, 10.0, 10.0, 6.0, 1.0)])
        .unwrap();

    fit_until_done(&mut state, 2000);
    assert_eq!(state.unconverged(), 0);

    let result = state.results()[0];
    assert_eq!(result.status, PeakStatus::Converged);
    assert!((result.x_center - 10.2).abs() < 1e-6);
    assert!((result.y_center - 9.7).abs() < 1e-6);
}

#[test]
fn overlapping_peaks_share_pixels_without_double_counting() {
    // Two overlapping emitters two pixels apart; both must converge with
    // heights near truth, which only works if the shared-buffer accounting
    // splits the overlap region correctly.
    let width = 20;
    let height = 20;
    let emitters = [
        Emitter::round(500.0, 9.0, 10.0, 1.0),
        Emitter::round(500.0, 11.0, 10.0, 1.0),
    ];
    let mut image = render(width, height, 10.0, &emitters);
    add_poisson_noise(&mut image, 7);

    let mut state = FitState::new(
        GaussianPsf::independent(),
        width,
        height,
        &vec![0.0; width * height],
        FitConfig {
            margin: 3,
            ..FitConfig::default()
        },
    )
    .unwrap();
    state.set_image(&image).unwrap();
    state
        .new_peaks(&[
            PeakSeed::new(450.0, 9.0, 10.0, 10.0, 1.0),
            PeakSeed::new(450.0, 11.0, 10.0, 10.0, 1.0),
        ])
        .unwrap();

    fit_until_done(&mut state, 500);
    assert_eq!(state.unconverged(), 0);

    for (result, truth) in state.results().iter().zip(&emitters) {
        assert_eq!(result.status, PeakStatus::Converged);
        assert!(
            (result.height - truth.height).abs() / truth.height < 0.03,
            "height = {}",
            result.height
        );
        assert!((result.x_center - truth.x).abs() < 0.05);
        assert!((result.y_center - truth.y).abs() < 0.05);
    }
}

#[test]
fn noisy_frame_recovery_at_high_snr() {
    let width = 30;
    let height = 30;
    let truth = Emitter {
        height: 400.0,
        x: 15.2,
        y: 14.6,
        sigma_x: 1.3,
        sigma_y: 1.3,
    };
    let mut image = render(width, height, 10.0, &[truth]);
    add_poisson_noise(&mut image, 42);

    let mut state = FitState::new(
        GaussianPsf::independent(),
        width,
        height,
        &vec![0.0; width * height],
        FitConfig {
            margin: 8,
            ..FitConfig::default()
        },
    )
    .unwrap();
    state.set_image(&image).unwrap();
    state
        .new_peaks(&[PeakSeed::new(320.0, 15.6, 14.2, 10.0, 1.1)])
        .unwrap();

    fit_until_done(&mut state, 500);
    assert_eq!(state.unconverged(), 0);

    let result = state.results()[0];
    assert_eq!(result.status, PeakStatus::Converged);
    assert!((result.x_center - truth.x).abs() < 0.1);
    assert!((result.y_center - truth.y).abs() < 0.1);
    assert!((result.height - truth.height).abs() / truth.height < 0.1);
    assert!((result.x_sigma - truth.sigma_x).abs() / truth.sigma_x < 0.1);
    assert!((result.y_sigma - truth.sigma_y).abs() / truth.sigma_y < 0.1);
}

#[test]
fn results_report_widths_as_sigmas() {
    let width = 26;
    let height = 26;
    let truth = Emitter {
        height: 300.0,
        x: 12.4,
        y: 13.1,
        sigma_x: 1.4,
        sigma_y: 0.9,
    };
    let image = render(width, height, 5.0, &[truth]);

    let mut state = FitState::new(
        GaussianPsf::independent(),
        width,
        height,
        &vec![0.0; width * height],
        FitConfig {
            margin: 6,
            ..FitConfig::default()
        },
    )
    .unwrap();
    state.set_image(&image).unwrap();
    state
        .new_peaks(&[PeakSeed {
            x_sigma: 1.2,
            y_sigma: 1.1,
            ..PeakSeed::new(280.0, 12.2, 13.3, 5.0, 1.2)
        }])
        .unwrap();

    fit_until_done(&mut state, 500);
    assert_eq!(state.unconverged(), 0);

    let result = state.results()[0];
    assert!((result.x_sigma - 1.4).abs() < 0.03, "sigma_x = {}", result.x_sigma);
    assert!((result.y_sigma - 0.9).abs() < 0.03, "sigma_y = {}", result.y_sigma);
}

#[test]
fn scmos_term_shifts_the_model_intensity() {
    // A constant sCMOS variance term enters the model intensity; fitting the
    // same frame with and without it must change the fitted background.
    let width = 20;
    let height = 20;
    let image = render(width, height, 20.0, &[Emitter::round(200.0, 10.3, 9.8, 1.0)]);

    let run = |scmos: f64| {
        let mut state = FitState::new(
            GaussianPsf::independent(),
            width,
            height,
            &vec![scmos; width * height],
            FitConfig {
                margin: 4,
                ..FitConfig::default()
            },
        )
        .unwrap();
        state.set_image(&image).unwrap();
        state
            .new_peaks(&[PeakSeed::new(180.0, 10.0, 10.0, 20.0, 1.0)])
            .unwrap();
        fit_until_done(&mut state, 500);
        state.results()[0]
    };

    let plain = run(0.0);
    let calibrated = run(4.0);
    assert_eq!(plain.status, PeakStatus::Converged);
    assert_eq!(calibrated.status, PeakStatus::Converged);
    // The additive term is absorbed by the fitted background.
    assert!((plain.background - 20.0).abs() < 0.1);
    assert!((calibrated.background - 16.0).abs() < 0.1);
    assert!((plain.x_center - calibrated.x_center).abs() < 1e-3);
}
