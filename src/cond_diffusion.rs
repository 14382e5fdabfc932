//! Null-space conditional sampling
//!
//! Wraps a [`GaussianDiffusion`] with a degradation operator A and its
//! pseudo-inverse A⁺. At every reverse step the clean-image estimate is
//! replaced by
//!
//!   x̂_0 ← A⁺(y) + x̂_0 - A⁺(A(x̂_0))
//!
//! so its range-space component comes from the measurement y while the
//! null-space component (what A cannot observe) is left to the model. The
//! corrected estimate then drives the posterior mean of the next step.

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::degradation::{Degradation, DegradationOperator};
use crate::denoiser::Denoiser;
use crate::diffusion::{
    GaussianDiffusion, MeanVar, ModelMeanType, ModelVarType, SampleInit, StepOutput,
};
use crate::error::{DdnmError, Result};
use crate::utils::{NoiseSource, Pcg32};

/// Reverse diffusion steered toward consistency with a measurement.
///
/// Only ε-prediction with fixed (small or large) variance is accepted; other
/// parameterizations are rejected by [`ConditionalDiffusion::new`]. The
/// sampler holds no per-call state and can be shared between threads; each
/// call brings its own [`NoiseSource`].
#[derive(Debug, Clone)]
pub struct ConditionalDiffusion<O: Degradation = DegradationOperator> {
    base: GaussianDiffusion,
    operator: O,
    clip_denoised: bool,
}

impl<O: Degradation> ConditionalDiffusion<O> {
    pub fn new(base: GaussianDiffusion, operator: O) -> Result<Self> {
        let mean = base.model_mean_type();
        let var = base.model_var_type();
        let supported = mean == ModelMeanType::Eps
            && matches!(var, ModelVarType::FixedSmall | ModelVarType::FixedLarge);
        if !supported {
            return Err(DdnmError::UnsupportedParameterization { mean, var });
        }

        Ok(Self {
            base,
            operator,
            clip_denoised: true,
        })
    }

    /// Whether clean-image estimates are clipped to [-1, 1] during
    /// [`ConditionalDiffusion::p_cond_sample`] (default: true).
    pub fn with_clip_denoised(mut self, clip_denoised: bool) -> Self {
        self.clip_denoised = clip_denoised;
        self
    }

    pub fn base(&self) -> &GaussianDiffusion {
        &self.base
    }

    pub fn operator(&self) -> &O {
        &self.operator
    }

    pub fn clip_denoised(&self) -> bool {
        self.clip_denoised
    }

    /// A⁺(y) + x̂_0 - A⁺(A(x̂_0)). A measurement with batch size 1 is
    /// broadcast over the batch of `pred_x0`.
    pub fn null_space_correction(
        &self,
        y: &Tensor,
        pred_x0: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let range = self.operator.pseudo_inverse(y)?;
        let projected = self
            .operator
            .pseudo_inverse(&self.operator.forward(pred_x0)?)?;
        range.broadcast_add(&(pred_x0 - projected)?)
    }

    /// Measurement-corrected reverse-step distribution.
    pub fn p_cond_mean_var<M: Denoiser + ?Sized>(
        &self,
        denoiser: &mut M,
        x_t: &Tensor,
        t: &Tensor,
        y: &Tensor,
        clip_denoised: bool,
    ) -> Result<MeanVar> {
        let out = denoiser.forward(x_t, t)?;
        self.base
            .mean_var_from_output(out, x_t, t, clip_denoised, |pred_x0| {
                self.null_space_correction(y, &pred_x0)
            })
    }

    /// One reverse step x_t -> x_{t-1}. Elements at t == 0 receive no noise.
    pub fn p_cond_sample_step<M: Denoiser + ?Sized>(
        &self,
        denoiser: &mut M,
        x_t: &Tensor,
        t: &Tensor,
        y: &Tensor,
        clip_denoised: bool,
        rng: &mut dyn NoiseSource,
    ) -> Result<StepOutput> {
        let mean_var = self.p_cond_mean_var(denoiser, x_t, t, y, clip_denoised)?;
        let sample = self.base.sample_from(&mean_var, x_t, t, rng)?;
        Ok(StepOutput {
            sample,
            pred_x0: mean_var.pred_x0,
        })
    }

    /// Run the full conditional chain from T-1 down to 0.
    ///
    /// Makes exactly `timesteps()` denoiser calls. The measurement must share
    /// the sample's (C, H, W) and have batch size 1 or B; this is checked
    /// before the first denoiser call.
    pub fn p_cond_sample<M: Denoiser + ?Sized>(
        &self,
        denoiser: &mut M,
        y: &Tensor,
        init: SampleInit,
        device: &Device,
        rng: &mut dyn NoiseSource,
    ) -> Result<Tensor> {
        let x_t = GaussianDiffusion::initial_sample(init, device, rng)?;
        check_measurement(y, &x_t)?;
        let y = y.to_device(device)?;

        info!(
            timesteps = self.base.timesteps(),
            shape = ?x_t.dims(),
            measurement_shape = ?y.dims(),
            "Starting conditional sampling"
        );
        let clip_denoised = self.clip_denoised;
        let x_0 = self.base.reverse_chain(x_t, |x_t, t| {
            let step =
                self.p_cond_sample_step(&mut *denoiser, x_t, t, &y, clip_denoised, &mut *rng)?;
            debug!(pred_x0_shape = ?step.pred_x0.dims(), "Corrected estimate");
            Ok(step.sample)
        })?;
        info!("Conditional sampling complete");
        Ok(x_0)
    }

    /// [`ConditionalDiffusion::p_cond_sample`] with a fresh [`Pcg32`] seeded
    /// from `seed`.
    pub fn p_cond_sample_seeded<M: Denoiser + ?Sized>(
        &self,
        denoiser: &mut M,
        y: &Tensor,
        init: SampleInit,
        device: &Device,
        seed: u64,
    ) -> Result<Tensor> {
        let mut rng = Pcg32::seeded(seed);
        self.p_cond_sample(denoiser, y, init, device, &mut rng)
    }
}

fn check_measurement(y: &Tensor, x_t: &Tensor) -> Result<()> {
    let (yd, xd) = (y.dims(), x_t.dims());
    let compatible = yd.len() == xd.len()
        && !xd.is_empty()
        && (yd[0] == 1 || yd[0] == xd[0])
        && yd[1..] == xd[1..];
    if !compatible {
        return Err(DdnmError::MeasurementShape {
            measurement: yd.to_vec(),
            sample: xd.to_vec(),
        });
    }
    Ok(())
}
