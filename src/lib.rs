//! Candle-DDNM: null-space conditional sampling from pretrained DDPMs.
//!
//! This crate solves linear image-restoration problems (colorization,
//! inpainting) with an unconditional denoising diffusion model and no
//! retraining: every reverse step replaces the range-space part of the
//! model's clean-image estimate with what the observed measurement implies.

pub mod cond_diffusion;
pub mod config;
pub mod degradation;
pub mod denoiser;
pub mod diffusion;
pub mod error;
pub mod image_io;
pub mod schedule;
pub mod utils;

pub use cond_diffusion::ConditionalDiffusion;
pub use config::{Dataset, DiffusionConfig, ExperimentConfig};
pub use degradation::{Degradation, DegradationKind, DegradationOperator, get_operator};
pub use denoiser::{Denoiser, GaussianPriorDenoiser};
pub use diffusion::{GaussianDiffusion, MeanVar, ModelMeanType, ModelVarType, SampleInit, StepOutput};
pub use error::{DdnmError, Result};
pub use schedule::{BetaSchedule, get_beta_schedule};
pub use utils::{NoiseSource, Pcg32, PerSampleRng};
