//! Denoiser interface and a closed-form stand-in network

use candle_core::{Result, Tensor};

use crate::diffusion::{GaussianDiffusion, ModelMeanType, ModelVarType, extract};

/// A denoising network `(x_t, t) -> output`.
///
/// `x_t` is [B, C, H, W] and `t` is a `U32` tensor of shape [B]. The output is
/// [B, C, H, W], or [B, 2C, H, W] when the diffusion learns its variance (the
/// second half holding log-variances). Implementations must not depend on
/// gradient tracking.
pub trait Denoiser {
    fn forward(&mut self, x_t: &Tensor, t: &Tensor) -> Result<Tensor>;
}

impl<F> Denoiser for F
where
    F: FnMut(&Tensor, &Tensor) -> Result<Tensor>,
{
    fn forward(&mut self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        self(x_t, t)
    }
}

/// Exact denoiser for data drawn from an isotropic Gaussian N(0, σ²I).
///
/// With x_t = √ᾱ·x_0 + √(1-ᾱ)·ε, the posterior expectations are linear in x_t:
///   E[x_0 | x_t] = √ᾱ·σ² / (ᾱσ² + 1 - ᾱ) · x_t
///   E[ε | x_t]   = √(1-ᾱ) / (ᾱσ² + 1 - ᾱ) · x_t
///
/// The output follows the diffusion's mean parameterization, and for learned
/// variance the fixed-small log-variance is appended as the second stream.
/// Useful for exercising the sampler end to end without a trained network.
#[derive(Debug, Clone)]
pub struct GaussianPriorDenoiser {
    output_coef: Vec<f64>,
    logvar: Option<Vec<f64>>,
}

impl GaussianPriorDenoiser {
    pub fn new(diffusion: &GaussianDiffusion, sigma_data: f64) -> Self {
        let var_data = sigma_data * sigma_data;
        let (coef1, coef2) = diffusion.posterior_mean_coefs();

        let output_coef = diffusion
            .alphas_bar()
            .iter()
            .enumerate()
            .map(|(t, &ab)| {
                let denom = ab * var_data + 1.0 - ab;
                let x0_coef = ab.sqrt() * var_data / denom;
                match diffusion.model_mean_type() {
                    ModelMeanType::Eps => (1.0 - ab).sqrt() / denom,
                    ModelMeanType::X0 => x0_coef,
                    ModelMeanType::Mean => coef1[t] * x0_coef + coef2[t],
                }
            })
            .collect();

        let logvar = match diffusion.model_var_type() {
            ModelVarType::Learned => Some(diffusion.fixed_model_var().1.to_vec()),
            ModelVarType::FixedSmall | ModelVarType::FixedLarge => None,
        };

        Self {
            output_coef,
            logvar,
        }
    }
}

impl Denoiser for GaussianPriorDenoiser {
    fn forward(&mut self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        let out = (extract(&self.output_coef, t, x_t)? * x_t)?;
        match &self.logvar {
            Some(logvar) => {
                let logvar = extract(logvar, t, x_t)?.contiguous()?;
                Tensor::cat(&[&out, &logvar], 1)
            }
            None => Ok(out),
        }
    }
}
