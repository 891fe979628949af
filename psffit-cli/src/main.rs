use clap::Parser;
use psffit::{
    Diagnostics, FitConfig, FitState, GaussianPsf, PeakResult, PeakSeed, PeakStatus, Strategy,
    ZCalibration, ZWidthParams, DEFAULT_CLAMP, MARGIN, NFITTING,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const EXAMPLE_JSON: &str = r#"{
  "image_path": "frame.json",
  "peaks_path": "peaks.json",
  "output_path": null,
  "max_iterations": 200,
  "fit": {
    "model": "gaussian_3d",
    "strategy": "levenberg_marquardt",
    "tolerance": 1e-6,
    "margin": 10,
    "clamp": [1000.0, 1.0, 0.3, 1.0, 0.3, 100.0, 0.1]
  }
}"#;

#[derive(Parser, Debug)]
#[command(author, version, about = "psffit CLI (JSON config driven)")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,
    /// Print an example config and exit.
    #[arg(long)]
    print_example: bool,
    /// Enable tracing output for performance profiling.
    #[arg(long)]
    trace: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
enum ModelConfig {
    #[serde(rename = "gaussian_2d_fixed")]
    Gaussian2dFixed,
    #[serde(rename = "gaussian_2d")]
    Gaussian2d,
    #[default]
    #[serde(rename = "gaussian_3d")]
    Gaussian3d,
    #[serde(rename = "gaussian_z")]
    GaussianZ,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "snake_case")]
enum StrategyConfig {
    Original,
    #[default]
    LevenbergMarquardt,
}

impl From<StrategyConfig> for Strategy {
    fn from(value: StrategyConfig) -> Self {
        match value {
            StrategyConfig::Original => Strategy::Original,
            StrategyConfig::LevenbergMarquardt => Strategy::LevenbergMarquardt,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct ZAxisJson {
    w0: f64,
    c: f64,
    d: f64,
    #[serde(default)]
    a: f64,
    #[serde(default)]
    b: f64,
}

impl From<ZAxisJson> for ZWidthParams {
    fn from(value: ZAxisJson) -> Self {
        ZWidthParams {
            w0: value.w0,
            c: value.c,
            d: value.d,
            a: value.a,
            b: value.b,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct ZCalibrationJson {
    wx: ZAxisJson,
    wy: ZAxisJson,
    min_z: f64,
    max_z: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct FitConfigJson {
    model: ModelConfig,
    strategy: StrategyConfig,
    tolerance: f64,
    margin: usize,
    clamp: [f64; NFITTING],
    z_calibration: Option<ZCalibrationJson>,
}

impl Default for FitConfigJson {
    fn default() -> Self {
        let cfg = FitConfig::default();
        Self {
            model: ModelConfig::default(),
            strategy: StrategyConfig::default(),
            tolerance: cfg.tolerance,
            margin: MARGIN,
            clamp: DEFAULT_CLAMP,
            z_calibration: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    image_path: String,
    peaks_path: String,
    output_path: Option<String>,
    max_iterations: usize,
    fit: FitConfigJson,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_path: String::new(),
            peaks_path: String::new(),
            output_path: None,
            max_iterations: 200,
            fit: FitConfigJson::default(),
        }
    }
}

/// Gain-corrected frame: photon counts plus optional sCMOS calibration.
#[derive(Debug, Deserialize)]
struct FrameJson {
    width: usize,
    height: usize,
    data: Vec<f64>,
    #[serde(default)]
    scmos: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct SeedJson {
    height: f64,
    x: f64,
    y: f64,
    #[serde(default)]
    z: f64,
    background: f64,
    sigma_x: f64,
    sigma_y: f64,
}

impl From<&SeedJson> for PeakSeed {
    fn from(value: &SeedJson) -> Self {
        PeakSeed {
            height: value.height,
            x_center: value.x,
            y_center: value.y,
            z_center: value.z,
            background: value.background,
            x_sigma: value.sigma_x,
            y_sigma: value.sigma_y,
            status: PeakStatus::Running,
            error: 0.0,
        }
    }
}

#[derive(Debug, Serialize)]
struct PeakRecord {
    height: f64,
    x: f64,
    y: f64,
    z: f64,
    background: f64,
    sigma_x: f64,
    sigma_y: f64,
    status: String,
    error: f64,
}

impl From<PeakResult> for PeakRecord {
    fn from(value: PeakResult) -> Self {
        let status = match value.status {
            PeakStatus::Running => "running",
            PeakStatus::Converged => "converged",
            PeakStatus::Error => "error",
            PeakStatus::BadPeak => "bad_peak",
        };
        Self {
            height: value.height,
            x: value.x_center,
            y: value.y_center,
            z: value.z_center,
            background: value.background,
            sigma_x: value.x_sigma,
            sigma_y: value.y_sigma,
            status: status.to_string(),
            error: value.error,
        }
    }
}

#[derive(Debug, Serialize)]
struct DiagnosticsRecord {
    n_dposv: u64,
    n_margin: u64,
    n_neg_height: u64,
    n_neg_width: u64,
    n_neg_fi: u64,
    n_non_decr: u64,
    n_iterations: u64,
}

impl From<Diagnostics> for DiagnosticsRecord {
    fn from(value: Diagnostics) -> Self {
        Self {
            n_dposv: value.n_dposv,
            n_margin: value.n_margin,
            n_neg_height: value.n_neg_height,
            n_neg_width: value.n_neg_width,
            n_neg_fi: value.n_neg_fi,
            n_non_decr: value.n_non_decr,
            n_iterations: value.n_iterations,
        }
    }
}

#[derive(Debug, Serialize)]
struct Output {
    peaks: Vec<PeakRecord>,
    diagnostics: DiagnosticsRecord,
    sweeps: usize,
    converged: bool,
}

fn build_model(cfg: &FitConfigJson) -> Result<GaussianPsf, Box<dyn std::error::Error>> {
    Ok(match cfg.model {
        ModelConfig::Gaussian2dFixed => GaussianPsf::fixed_width(),
        ModelConfig::Gaussian2d => GaussianPsf::isotropic(),
        ModelConfig::Gaussian3d => GaussianPsf::independent(),
        ModelConfig::GaussianZ => {
            let zc = cfg
                .z_calibration
                .ok_or("gaussian_z requires fit.z_calibration")?;
            GaussianPsf::z_calibrated(ZCalibration::new(
                zc.wx.into(),
                zc.wy.into(),
                zc.min_z,
                zc.max_z,
            )?)
        }
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive("psffit=info".parse()?))
            .with_target(false)
            .init();
    }

    if cli.print_example {
        println!("{EXAMPLE_JSON}");
        return Ok(());
    }

    let config_text = fs::read_to_string(&cli.config)?;
    let config: Config = serde_json::from_str(&config_text)?;
    if config.image_path.is_empty() || config.peaks_path.is_empty() {
        return Err("image_path and peaks_path must be set in the config".into());
    }
    if config.max_iterations == 0 {
        return Err("max_iterations must be at least 1".into());
    }

    let frame_text = fs::read_to_string(&config.image_path)?;
    let frame: FrameJson = serde_json::from_str(&frame_text)?;
    let scmos = frame
        .scmos
        .unwrap_or_else(|| vec![0.0; frame.width * frame.height]);

    let seeds_text = fs::read_to_string(&config.peaks_path)?;
    let seed_records: Vec<SeedJson> = serde_json::from_str(&seeds_text)?;
    let seeds: Vec<PeakSeed> = seed_records.iter().map(PeakSeed::from).collect();

    let model = build_model(&config.fit)?;
    let mut state = FitState::new(
        model,
        frame.width,
        frame.height,
        &scmos,
        FitConfig {
            tolerance: config.fit.tolerance,
            margin: config.fit.margin,
            strategy: config.fit.strategy.clone().into(),
            clamp: config.fit.clamp,
        },
    )?;
    state.set_image(&frame.data)?;
    state.new_peaks(&seeds)?;

    let mut sweeps = 0;
    while state.unconverged() > 0 && sweeps < config.max_iterations {
        state.iterate();
        sweeps += 1;
    }

    let output = Output {
        peaks: state.results().into_iter().map(PeakRecord::from).collect(),
        diagnostics: state.diagnostics().into(),
        sweeps,
        converged: state.unconverged() == 0,
    };
    let json = serde_json::to_string_pretty(&output)?;

    match config.output_path {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }

    Ok(())
}
