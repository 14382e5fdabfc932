//! Gaussian diffusion base process (DDPM)
//!
//! Precomputes the per-timestep coefficients of the forward process and
//! provides the algebra for the reverse step:
//! - q(x_t | x_0) sampling
//! - posterior mean/variance of q(x_{t-1} | x_t, x_0)
//! - x_0 recovery from a predicted noise or a predicted posterior mean
//! - the unconditional ancestral sampler p(x_{t-1} | x_t)
//!
//! All tables are kept in f64 on the host and gathered per batch element as
//! f32 tensors on the sample's device.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Shape, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::denoiser::Denoiser;
use crate::error::{DdnmError, Result};
use crate::schedule::validate_betas;
use crate::utils::NoiseSource;

/// What the denoiser output represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelMeanType {
    /// Posterior mean of the reverse step
    #[serde(rename = "mean")]
    Mean,
    /// Clean image x_0
    #[serde(rename = "x_0")]
    X0,
    /// Noise added by the forward process
    #[serde(rename = "eps")]
    Eps,
}

impl ModelMeanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::X0 => "x_0",
            Self::Eps => "eps",
        }
    }
}

impl fmt::Display for ModelMeanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelMeanType {
    type Err = DdnmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Self::Mean),
            "x_0" => Ok(Self::X0),
            "eps" => Ok(Self::Eps),
            other => Err(DdnmError::UnknownParameterization(other.to_string())),
        }
    }
}

/// How the reverse-step variance is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVarType {
    /// Posterior variance β̃_t
    FixedSmall,
    /// Forward variance β_t
    FixedLarge,
    /// Log-variance predicted in the second half of the output channels
    Learned,
}

impl ModelVarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedSmall => "fixed-small",
            Self::FixedLarge => "fixed-large",
            Self::Learned => "learned",
        }
    }
}

impl fmt::Display for ModelVarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVarType {
    type Err = DdnmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed-small" => Ok(Self::FixedSmall),
            "fixed-large" => Ok(Self::FixedLarge),
            "learned" => Ok(Self::Learned),
            other => Err(DdnmError::UnknownParameterization(other.to_string())),
        }
    }
}

/// Gaussian parameters of one reverse transition.
#[derive(Debug, Clone)]
pub struct MeanVar {
    pub mean: Tensor,
    pub var: Tensor,
    pub logvar: Tensor,
    /// Clean-image estimate used to derive `mean`
    pub pred_x0: Tensor,
}

/// Output from a reverse step
#[derive(Debug)]
pub struct StepOutput {
    /// Less noisy sample (x_{t-1})
    pub sample: Tensor,
    /// Clean-image estimate at this step
    pub pred_x0: Tensor,
}

/// Starting point of a reverse chain.
#[derive(Debug, Clone)]
pub enum SampleInit {
    /// Draw standard-Gaussian noise of this shape from the chain's noise source
    Shape(Shape),
    /// Start from this tensor as-is
    Noise(Tensor),
}

/// Gather `arr[t[i]]` for every batch element and broadcast to `x`'s shape.
pub fn extract(arr: &[f64], t: &Tensor, x: &Tensor) -> candle_core::Result<Tensor> {
    let idx = t.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let vals = idx
        .iter()
        .map(|&i| {
            arr.get(i as usize).map(|v| *v as f32).ok_or_else(|| {
                candle_core::Error::Msg(format!(
                    "timestep {i} out of range for a {}-step schedule",
                    arr.len()
                ))
            })
        })
        .collect::<candle_core::Result<Vec<f32>>>()?;

    let mut shape = vec![1usize; x.rank()];
    shape[0] = vals.len();
    Tensor::from_vec(vals, shape, x.device())?
        .to_dtype(x.dtype())?
        .broadcast_as(x.shape())
}

/// Per-batch-element mask that is 0 where `t == 0` and 1 elsewhere.
pub(crate) fn nonzero_mask(t: &Tensor, x: &Tensor) -> candle_core::Result<Tensor> {
    let mut shape = vec![1usize; x.rank()];
    shape[0] = t.elem_count();
    t.ne(&t.zeros_like()?)?.to_dtype(x.dtype())?.reshape(shape)
}

#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    model_mean_type: ModelMeanType,
    model_var_type: ModelVarType,
    timesteps: usize,

    betas: Vec<f64>,
    alphas_bar: Vec<f64>,
    alphas_bar_prev: Vec<f64>,
    sqrt_alphas_bar: Vec<f64>,
    sqrt_one_minus_alphas_bar: Vec<f64>,
    sqrt_recip_alphas_bar: Vec<f64>,
    sqrt_recip_m1_alphas_bar: Vec<f64>,

    posterior_var: Vec<f64>,
    posterior_logvar_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,

    fixed_model_var: Vec<f64>,
    fixed_model_logvar: Vec<f64>,
}

impl GaussianDiffusion {
    pub fn new(
        betas: Vec<f64>,
        model_mean_type: ModelMeanType,
        model_var_type: ModelVarType,
    ) -> Result<Self> {
        validate_betas(&betas)?;
        let timesteps = betas.len();

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let mut alphas_bar = Vec::with_capacity(timesteps);
        let mut cumprod = 1.0;
        for alpha in alphas.iter() {
            cumprod *= alpha;
            alphas_bar.push(cumprod);
        }
        // ᾱ_t must stay positive or x_0 recovery divides by zero
        if let Some((t, ab)) = alphas_bar
            .iter()
            .enumerate()
            .find(|(_, ab)| !(ab.is_finite() && **ab > 0.0))
        {
            return Err(DdnmError::InvalidSchedule(format!(
                "alphas_bar[{t}] = {ab} collapses to zero; a beta of 1 cannot be sampled"
            )));
        }
        let alphas_bar_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_bar[..timesteps - 1].iter().copied())
            .collect();

        let sqrt_alphas_bar = alphas_bar.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_bar = alphas_bar.iter().map(|a| (1.0 - a).sqrt()).collect();
        let sqrt_recip_alphas_bar = alphas_bar.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recip_m1_alphas_bar = alphas_bar.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect();

        let posterior_var: Vec<f64> = (0..timesteps)
            .map(|t| betas[t] * (1.0 - alphas_bar_prev[t]) / (1.0 - alphas_bar[t]))
            .collect();
        let posterior_mean_coef1 = (0..timesteps)
            .map(|t| betas[t] * alphas_bar_prev[t].sqrt() / (1.0 - alphas_bar[t]))
            .collect();
        let posterior_mean_coef2 = (0..timesteps)
            .map(|t| alphas[t].sqrt() * (1.0 - alphas_bar_prev[t]) / (1.0 - alphas_bar[t]))
            .collect();

        // posterior_var[0] is exactly 0; its log is replaced by the value at t = 1
        let first_var = posterior_var.get(1).copied().unwrap_or(posterior_var[0]);
        let posterior_logvar_clipped: Vec<f64> = std::iter::once(first_var)
            .chain(posterior_var[1..].iter().copied())
            .map(|v| v.max(1e-20).ln())
            .collect();

        let (fixed_model_var, fixed_model_logvar) = match model_var_type {
            ModelVarType::FixedLarge => {
                let logvar = std::iter::once(first_var)
                    .chain(betas[1..].iter().copied())
                    .map(|v| v.max(1e-20).ln())
                    .collect();
                (betas.clone(), logvar)
            }
            ModelVarType::FixedSmall | ModelVarType::Learned => {
                (posterior_var.clone(), posterior_logvar_clipped.clone())
            }
        };

        Ok(Self {
            model_mean_type,
            model_var_type,
            timesteps,
            betas,
            alphas_bar,
            alphas_bar_prev,
            sqrt_alphas_bar,
            sqrt_one_minus_alphas_bar,
            sqrt_recip_alphas_bar,
            sqrt_recip_m1_alphas_bar,
            posterior_var,
            posterior_logvar_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
            fixed_model_var,
            fixed_model_logvar,
        })
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn model_mean_type(&self) -> ModelMeanType {
        self.model_mean_type
    }

    pub fn model_var_type(&self) -> ModelVarType {
        self.model_var_type
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_bar(&self) -> &[f64] {
        &self.alphas_bar
    }

    pub fn alphas_bar_prev(&self) -> &[f64] {
        &self.alphas_bar_prev
    }

    pub fn posterior_var(&self) -> &[f64] {
        &self.posterior_var
    }

    pub fn posterior_mean_coefs(&self) -> (&[f64], &[f64]) {
        (&self.posterior_mean_coef1, &self.posterior_mean_coef2)
    }

    /// Fixed per-timestep (variance, log-variance) tables for the configured
    /// variance type. `Learned` falls back to the posterior tables.
    pub fn fixed_model_var(&self) -> (&[f64], &[f64]) {
        (&self.fixed_model_var, &self.fixed_model_logvar)
    }

    /// Diffuse `x_0` to timestep `t`: √ᾱ_t·x_0 + √(1-ᾱ_t)·noise
    pub fn q_sample(&self, x_0: &Tensor, t: &Tensor, noise: &Tensor) -> candle_core::Result<Tensor> {
        let a = extract(&self.sqrt_alphas_bar, t, x_0)?;
        let s = extract(&self.sqrt_one_minus_alphas_bar, t, x_0)?;
        (a * x_0)? + (s * noise)?
    }

    /// Mean, variance and clipped log-variance of q(x_{t-1} | x_t, x_0).
    pub fn q_posterior_mean_var(
        &self,
        x_0: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
    ) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let coef1 = extract(&self.posterior_mean_coef1, t, x_t)?;
        let coef2 = extract(&self.posterior_mean_coef2, t, x_t)?;
        let mean = ((coef1 * x_0)? + (coef2 * x_t)?)?;
        let var = extract(&self.posterior_var, t, x_t)?;
        let logvar = extract(&self.posterior_logvar_clipped, t, x_t)?;
        Ok((mean, var, logvar))
    }

    /// x_0 = √(1/ᾱ_t)·x_t - √(1/ᾱ_t - 1)·eps
    pub fn pred_x0_from_eps(
        &self,
        x_t: &Tensor,
        eps: &Tensor,
        t: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let a = extract(&self.sqrt_recip_alphas_bar, t, x_t)?;
        let b = extract(&self.sqrt_recip_m1_alphas_bar, t, x_t)?;
        (a * x_t)? - (b * eps)?
    }

    /// Inverse of the posterior mean formula: x_0 = (mean - coef2·x_t) / coef1
    pub fn pred_x0_from_mean(
        &self,
        x_t: &Tensor,
        mean: &Tensor,
        t: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let coef1 = extract(&self.posterior_mean_coef1, t, x_t)?;
        let coef2 = extract(&self.posterior_mean_coef2, t, x_t)?;
        (mean - (coef2 * x_t)?)? / coef1
    }

    /// Resolve a raw denoiser output into reverse-step parameters.
    ///
    /// `refine` receives the (optionally clipped) clean-image estimate and
    /// returns the estimate used from then on. For the `Mean` parameterization
    /// the step mean stays the raw denoiser output regardless of `refine`.
    pub(crate) fn mean_var_from_output<F>(
        &self,
        out: Tensor,
        x_t: &Tensor,
        t: &Tensor,
        clip_denoised: bool,
        refine: F,
    ) -> Result<MeanVar>
    where
        F: FnOnce(Tensor) -> candle_core::Result<Tensor>,
    {
        let channels = x_t.dim(1)?;
        let out_channels = out.dim(1)?;

        let (out, var, logvar) = match self.model_var_type {
            ModelVarType::Learned => {
                if out_channels != 2 * channels {
                    return Err(DdnmError::ChannelMismatch {
                        expected: 2 * channels,
                        got: out_channels,
                        var: self.model_var_type,
                    });
                }
                let out_half = out.narrow(1, 0, channels)?;
                let logvar = out.narrow(1, channels, channels)?;
                let var = logvar.exp()?;
                (out_half, var, logvar)
            }
            ModelVarType::FixedSmall | ModelVarType::FixedLarge => {
                if out_channels != channels {
                    return Err(DdnmError::ChannelMismatch {
                        expected: channels,
                        got: out_channels,
                        var: self.model_var_type,
                    });
                }
                let var = extract(&self.fixed_model_var, t, x_t)?;
                let logvar = extract(&self.fixed_model_logvar, t, x_t)?;
                (out, var, logvar)
            }
        };

        let clip = |x: Tensor| -> candle_core::Result<Tensor> {
            if clip_denoised {
                x.clamp(-1f32, 1f32)
            } else {
                Ok(x)
            }
        };

        let (mean, pred_x0) = match self.model_mean_type {
            ModelMeanType::Mean => {
                let pred_x0 = refine(clip(self.pred_x0_from_mean(x_t, &out, t)?)?)?;
                (out, pred_x0)
            }
            ModelMeanType::X0 => {
                let pred_x0 = refine(clip(out)?)?;
                let (mean, _, _) = self.q_posterior_mean_var(&pred_x0, x_t, t)?;
                (mean, pred_x0)
            }
            ModelMeanType::Eps => {
                let pred_x0 = refine(clip(self.pred_x0_from_eps(x_t, &out, t)?)?)?;
                let (mean, _, _) = self.q_posterior_mean_var(&pred_x0, x_t, t)?;
                (mean, pred_x0)
            }
        };

        Ok(MeanVar {
            mean,
            var,
            logvar,
            pred_x0,
        })
    }

    /// Draw x_{t-1} = mean + mask·exp(logvar/2)·noise, with the noise term
    /// suppressed exactly for batch elements at t == 0.
    pub(crate) fn sample_from(
        &self,
        mean_var: &MeanVar,
        x_t: &Tensor,
        t: &Tensor,
        rng: &mut dyn NoiseSource,
    ) -> candle_core::Result<Tensor> {
        let noise = rng
            .standard_normal(x_t.shape(), x_t.device())?
            .to_dtype(x_t.dtype())?;
        let mask = nonzero_mask(t, x_t)?;
        let std = (&mean_var.logvar * 0.5)?.exp()?;
        let perturbation = mask.broadcast_mul(&(std * noise)?)?;
        &mean_var.mean + perturbation
    }

    /// Run the reverse chain from T-1 down to 0, calling `step` once per
    /// timestep. Each state is detached so no autograd graph spans steps.
    pub(crate) fn reverse_chain<F>(&self, x_t: Tensor, mut step: F) -> Result<Tensor>
    where
        F: FnMut(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let batch = x_t.dim(0)?;
        let device = x_t.device().clone();
        let mut x_t = x_t.detach();
        for ti in (0..self.timesteps).rev() {
            let t = Tensor::full(ti as u32, (batch,), &device)?;
            debug!(timestep = ti, sample_shape = ?x_t.dims(), "Reverse step");
            x_t = step(&x_t, &t)?.detach();
        }
        Ok(x_t)
    }

    pub(crate) fn initial_sample(
        init: SampleInit,
        device: &Device,
        rng: &mut dyn NoiseSource,
    ) -> Result<Tensor> {
        let x_t = match init {
            SampleInit::Shape(shape) => rng.standard_normal(&shape, device)?,
            SampleInit::Noise(noise) => noise.to_device(device)?,
        };
        Ok(x_t)
    }

    /// Unconditional reverse-step distribution p(x_{t-1} | x_t).
    pub fn p_mean_var<M: Denoiser + ?Sized>(
        &self,
        denoiser: &mut M,
        x_t: &Tensor,
        t: &Tensor,
        clip_denoised: bool,
    ) -> Result<MeanVar> {
        let out = denoiser.forward(x_t, t)?;
        self.mean_var_from_output(out, x_t, t, clip_denoised, Ok)
    }

    pub fn p_sample_step<M: Denoiser + ?Sized>(
        &self,
        denoiser: &mut M,
        x_t: &Tensor,
        t: &Tensor,
        clip_denoised: bool,
        rng: &mut dyn NoiseSource,
    ) -> Result<StepOutput> {
        let mean_var = self.p_mean_var(denoiser, x_t, t, clip_denoised)?;
        let sample = self.sample_from(&mean_var, x_t, t, rng)?;
        Ok(StepOutput {
            sample,
            pred_x0: mean_var.pred_x0,
        })
    }

    /// Unconditional ancestral sampling over all `timesteps()` steps.
    pub fn p_sample<M: Denoiser + ?Sized>(
        &self,
        denoiser: &mut M,
        init: SampleInit,
        device: &Device,
        clip_denoised: bool,
        rng: &mut dyn NoiseSource,
    ) -> Result<Tensor> {
        let x_t = Self::initial_sample(init, device, rng)?;
        info!(
            timesteps = self.timesteps,
            shape = ?x_t.dims(),
            mean_type = %self.model_mean_type,
            var_type = %self.model_var_type,
            "Starting unconditional sampling"
        );
        let x_0 = self.reverse_chain(x_t, |x_t, t| {
            Ok(self
                .p_sample_step(&mut *denoiser, x_t, t, clip_denoised, &mut *rng)?
                .sample)
        })?;
        info!("Unconditional sampling complete");
        Ok(x_0)
    }
}
