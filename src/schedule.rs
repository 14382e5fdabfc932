//! Beta schedules for the forward noising process
//!
//! Supported schedules:
//! - `quad`: betas evenly spaced in square-root space
//! - `linear`: betas evenly spaced between `beta_start` and `beta_end`
//! - `warmup10` / `warmup50`: constant `beta_end` after a linear warmup over
//!   the first 10% / 50% of steps
//! - `const`: `beta_end` everywhere
//! - `jsd`: 1/T, 1/(T-1), ..., 1. Its final beta of 1 drives ᾱ to zero, so
//!   `GaussianDiffusion::new` rejects it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DdnmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetaSchedule {
    Quad,
    Linear,
    Warmup10,
    Warmup50,
    Const,
    Jsd,
}

impl BetaSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quad => "quad",
            Self::Linear => "linear",
            Self::Warmup10 => "warmup10",
            Self::Warmup50 => "warmup50",
            Self::Const => "const",
            Self::Jsd => "jsd",
        }
    }
}

impl fmt::Display for BetaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BetaSchedule {
    type Err = DdnmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quad" => Ok(Self::Quad),
            "linear" => Ok(Self::Linear),
            "warmup10" => Ok(Self::Warmup10),
            "warmup50" => Ok(Self::Warmup50),
            "const" => Ok(Self::Const),
            "jsd" => Ok(Self::Jsd),
            other => Err(DdnmError::UnknownBetaSchedule(other.to_string())),
        }
    }
}

pub(crate) fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps == 0 {
        return vec![];
    }
    if steps == 1 {
        return vec![start];
    }
    let denom = (steps - 1) as f64;
    (0..steps)
        .map(|i| start + (end - start) * (i as f64) / denom)
        .collect()
}

fn warmup_betas(beta_start: f64, beta_end: f64, timesteps: usize, warmup_frac: f64) -> Vec<f64> {
    let mut betas = vec![beta_end; timesteps];
    let warmup_time = (timesteps as f64 * warmup_frac) as usize;
    for (beta, ramp) in betas
        .iter_mut()
        .zip(linspace(beta_start, beta_end, warmup_time))
    {
        *beta = ramp;
    }
    betas
}

/// Build the per-timestep betas for `schedule`.
///
/// Fails if `timesteps` is zero or any beta falls outside (0, 1].
pub fn get_beta_schedule(
    schedule: BetaSchedule,
    beta_start: f64,
    beta_end: f64,
    timesteps: usize,
) -> Result<Vec<f64>> {
    if timesteps == 0 {
        return Err(DdnmError::InvalidSchedule(
            "timesteps must be at least 1".to_string(),
        ));
    }

    let betas = match schedule {
        BetaSchedule::Quad => linspace(beta_start.sqrt(), beta_end.sqrt(), timesteps)
            .into_iter()
            .map(|b| b * b)
            .collect(),
        BetaSchedule::Linear => linspace(beta_start, beta_end, timesteps),
        BetaSchedule::Warmup10 => warmup_betas(beta_start, beta_end, timesteps, 0.1),
        BetaSchedule::Warmup50 => warmup_betas(beta_start, beta_end, timesteps, 0.5),
        BetaSchedule::Const => vec![beta_end; timesteps],
        BetaSchedule::Jsd => linspace(timesteps as f64, 1.0, timesteps)
            .into_iter()
            .map(|d| 1.0 / d)
            .collect(),
    };

    validate_betas(&betas)?;
    Ok(betas)
}

pub(crate) fn validate_betas(betas: &[f64]) -> Result<()> {
    if betas.is_empty() {
        return Err(DdnmError::InvalidSchedule(
            "betas must not be empty".to_string(),
        ));
    }
    if let Some((i, b)) = betas
        .iter()
        .enumerate()
        .find(|(_, b)| !(**b > 0.0 && **b <= 1.0))
    {
        return Err(DdnmError::InvalidSchedule(format!(
            "beta[{i}] = {b} is outside (0, 1]"
        )));
    }
    Ok(())
}
