//! Linear degradation operators and their pseudo-inverses
//!
//! Each operator pair (A, A⁺) satisfies range consistency:
//!   A(A⁺(A(x))) == A(x)
//! which is what the null-space correction in the conditional sampler relies on.
//!
//! Supported:
//! - colorization: equal-weight channel average (A) / broadcast of the gray
//!   channel (A⁺)
//! - inpainting: fixed 0/1 mask with a blocked centered square, its own
//!   pseudo-inverse
//!
//! Denoising, super-resolution and composite degradations are rejected when the
//! operator is requested.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Result, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DdnmError;

/// Degradation operator A with pseudo-inverse A⁺.
pub trait Degradation {
    /// Apply the lossy measurement operator A.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Apply the pseudo-inverse A⁺ to a measurement.
    fn pseudo_inverse(&self, y: &Tensor) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    Colorization,
    Inpainting,
    Denoising,
    SuperResolution,
    Composite,
}

impl DegradationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Colorization => "colorization",
            Self::Inpainting => "inpainting",
            Self::Denoising => "denoising",
            Self::SuperResolution => "super_resolution",
            Self::Composite => "composite",
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Colorization | Self::Inpainting)
    }
}

impl fmt::Display for DegradationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DegradationKind {
    type Err = DdnmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "colorization" => Ok(Self::Colorization),
            "inpainting" => Ok(Self::Inpainting),
            "denoising" => Ok(Self::Denoising),
            "super_resolution" | "sr_averagepooling" => Ok(Self::SuperResolution),
            "composite" | "all" => Ok(Self::Composite),
            other => Err(DdnmError::UnknownOperator(other.to_string())),
        }
    }
}

/// Gray-scale projection with equal per-channel weights 1/C.
#[derive(Debug, Clone)]
pub struct Colorization {
    channels: usize,
}

impl Colorization {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }

    fn weight(&self) -> f64 {
        1.0 / self.channels as f64
    }

    fn check_channels(&self, x: &Tensor) -> Result<()> {
        let c = x.dim(1)?;
        if c != self.channels {
            candle_core::bail!(
                "colorization expects {} channels, got {:?}",
                self.channels,
                x.dims()
            );
        }
        Ok(())
    }
}

impl Degradation for Colorization {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_channels(x)?;
        let gray = x.sum_keepdim(1)?.affine(self.weight(), 0.0)?;
        gray.repeat((1, self.channels, 1, 1))
    }

    fn pseudo_inverse(&self, y: &Tensor) -> Result<Tensor> {
        self.check_channels(y)?;
        // w / Σw² over equal weights
        let w = self.weight();
        let scale = w / (self.channels as f64 * w * w);
        let gray = y.narrow(1, 0, 1)?.affine(scale, 0.0)?;
        gray.repeat((1, self.channels, 1, 1))
    }
}

/// Masking with a blocked centered square spanning `[res/3, res/2)` in both
/// spatial dimensions.
#[derive(Debug, Clone)]
pub struct Inpainting {
    mask: Tensor,
}

impl Inpainting {
    pub fn new(channels: usize, resolution: usize, device: &Device) -> Result<Self> {
        let lo = resolution / 3;
        let hi = resolution / 2;
        let mut data = vec![1f32; channels * resolution * resolution];
        for c in 0..channels {
            for i in lo..hi {
                let row = (c * resolution + i) * resolution;
                data[row + lo..row + hi].fill(0.0);
            }
        }
        let mask = Tensor::from_vec(data, (channels, resolution, resolution), device)?;
        Ok(Self { mask })
    }

    /// The (C, H, W) 0/1 mask.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }
}

impl Degradation for Inpainting {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_mul(&self.mask.to_dtype(x.dtype())?)
    }

    fn pseudo_inverse(&self, y: &Tensor) -> Result<Tensor> {
        self.forward(y)
    }
}

/// The operators available from [`get_operator`].
#[derive(Debug, Clone)]
pub enum DegradationOperator {
    Colorization(Colorization),
    Inpainting(Inpainting),
}

impl DegradationOperator {
    pub fn kind(&self) -> DegradationKind {
        match self {
            Self::Colorization(_) => DegradationKind::Colorization,
            Self::Inpainting(_) => DegradationKind::Inpainting,
        }
    }
}

impl Degradation for DegradationOperator {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Colorization(op) => op.forward(x),
            Self::Inpainting(op) => op.forward(x),
        }
    }

    fn pseudo_inverse(&self, y: &Tensor) -> Result<Tensor> {
        match self {
            Self::Colorization(op) => op.pseudo_inverse(y),
            Self::Inpainting(op) => op.pseudo_inverse(y),
        }
    }
}

/// Build the degradation operator pair for `kind`.
///
/// Unsupported kinds fail before anything is allocated.
pub fn get_operator(
    kind: DegradationKind,
    channels: usize,
    resolution: usize,
    device: &Device,
) -> std::result::Result<DegradationOperator, DdnmError> {
    if !kind.is_supported() {
        return Err(DdnmError::UnsupportedOperator(kind));
    }
    if channels == 0 || resolution == 0 {
        return Err(DdnmError::InvalidDimensions {
            channels,
            resolution,
        });
    }
    info!(%kind, channels, resolution, "Building degradation operator");

    let op = match kind {
        DegradationKind::Colorization => {
            DegradationOperator::Colorization(Colorization::new(channels))
        }
        DegradationKind::Inpainting => {
            DegradationOperator::Inpainting(Inpainting::new(channels, resolution, device)?)
        }
        DegradationKind::Denoising
        | DegradationKind::SuperResolution
        | DegradationKind::Composite => return Err(DdnmError::UnsupportedOperator(kind)),
    };
    Ok(op)
}
