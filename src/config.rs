//! Configuration structures for diffusion sampling
//!
//! Configs mirror the JSON layout of `configs/<dataset>.json`:
//!
//! ```json
//! {
//!   "diffusion": {
//!     "beta_schedule": "linear",
//!     "beta_start": 0.0001,
//!     "beta_end": 0.02,
//!     "timesteps": 1000,
//!     "model_mean_type": "eps",
//!     "model_var_type": "fixed-large",
//!     "loss_type": "mse"
//!   }
//! }
//! ```
//!
//! Keys that only matter for training (`loss_type`, the `denoise` network
//! block, ...) are ignored.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::diffusion::{GaussianDiffusion, ModelMeanType, ModelVarType};
use crate::error::{DdnmError, Result};
use crate::schedule::{BetaSchedule, get_beta_schedule};

/// Diffusion process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// How betas evolve over the forward process
    pub beta_schedule: BetaSchedule,
    /// First beta of the schedule
    pub beta_start: f64,
    /// Last beta of the schedule
    pub beta_end: f64,
    /// Number of diffusion timesteps T
    pub timesteps: usize,
    /// What the denoiser predicts: "mean", "x_0" or "eps"
    pub model_mean_type: ModelMeanType,
    /// Reverse variance: "fixed-small", "fixed-large" or "learned"
    pub model_var_type: ModelVarType,
    /// Clip clean-image estimates to [-1, 1]
    #[serde(default = "default_clip_denoised")]
    pub clip_denoised: bool,
}

fn default_clip_denoised() -> bool {
    true
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            beta_schedule: BetaSchedule::Linear,
            beta_start: 0.0001,
            beta_end: 0.02,
            timesteps: 1000,
            model_mean_type: ModelMeanType::Eps,
            model_var_type: ModelVarType::FixedLarge,
            clip_denoised: true,
        }
    }
}

impl DiffusionConfig {
    /// Set the number of diffusion timesteps
    pub fn with_timesteps(mut self, timesteps: usize) -> Self {
        self.timesteps = timesteps;
        self
    }

    /// Compute the beta schedule and precompute the diffusion coefficients.
    pub fn build(&self) -> Result<GaussianDiffusion> {
        let betas = get_beta_schedule(
            self.beta_schedule,
            self.beta_start,
            self.beta_end,
            self.timesteps,
        )?;
        GaussianDiffusion::new(betas, self.model_mean_type, self.model_var_type)
    }
}

/// Top-level experiment config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub diffusion: DiffusionConfig,
}

impl ExperimentConfig {
    pub fn from_json_str(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DdnmError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content).map_err(|source| DdnmError::JsonParse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Datasets with a known image geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Mnist,
    Cifar10,
    Celeba,
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mnist => "mnist",
            Self::Cifar10 => "cifar10",
            Self::Celeba => "celeba",
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Self::Mnist => 1,
            Self::Cifar10 | Self::Celeba => 3,
        }
    }

    /// Square image side length
    pub fn resolution(&self) -> usize {
        match self {
            Self::Mnist | Self::Cifar10 => 32,
            Self::Celeba => 64,
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = DdnmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mnist" => Ok(Self::Mnist),
            "cifar10" => Ok(Self::Cifar10),
            "celeba" => Ok(Self::Celeba),
            other => Err(DdnmError::UnknownDataset(other.to_string())),
        }
    }
}
