//! PsfFit is a maximum-likelihood multi-emitter PSF fitting engine for
//! single-molecule localization microscopy.
//!
//! The fitter extracts sub-pixel localizations of many possibly overlapping
//! emitters from a photon-count image, assuming Poisson statistics with an
//! optional additive sCMOS variance term. Overlapping peaks cooperate
//! through shared foreground and background buffers; each peak is updated by
//! a damped Gauss-Newton step on its own footprint with the rest of the
//! model held fixed. A multi-channel coordinator couples peaks across
//! affine-mapped image planes for multi-plane and multi-color data.

pub mod fit;
pub mod image;
pub mod model;
pub mod multi;
pub mod peak;
pub mod util;

pub(crate) mod trace;

pub use fit::{Diagnostics, FitConfig, FitState, Strategy, DEFAULT_CLAMP};
pub use image::FitImage;
pub use model::gaussian::GaussianPsf;
pub use model::tabulated::{PsfTable, TabulatedPsf};
pub use model::zcal::{ZCalibration, ZWidthParams};
pub use model::{PsfModel, PsfSample};
pub use multi::{ChannelWeights, MultiChannelFit};
pub use peak::{Peak, PeakResult, PeakSeed, PeakStatus};
pub use util::{PsfFitError, PsfFitResult};

/// Number of fit parameters per peak.
pub const NFITTING: usize = 7;

/// Entries per peak in flat result arrays: the parameters plus status and
/// error.
pub const NPEAKPAR: usize = 9;

/// Default unanalyzed edge around the image, in pixels. Also the hard cap on
/// the per-peak footprint half-size.
pub const MARGIN: usize = 10;

/// Minimum change required to move an integer anchor or resize a footprint.
pub const HYSTERESIS: f64 = 0.6;

/// Damping increase factor on a rejected Levenberg-Marquardt step.
pub const LAMBDA_UP: f64 = 4.0;

/// Damping decrease factor on an accepted improving step.
pub const LAMBDA_DOWN: f64 = 0.75;

/// Initial Levenberg-Marquardt damping for a fresh peak.
pub const LAMBDA_START: f64 = 1.0;
