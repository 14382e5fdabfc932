//! Error types shared across the crate

use crate::degradation::DegradationKind;
use crate::diffusion::{ModelMeanType, ModelVarType};

/// Errors raised while configuring or running a restoration sampler.
///
/// Configuration problems are reported at construction time so a doomed
/// setup never reaches the denoiser. Tensor and device failures from candle
/// are passed through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum DdnmError {
    #[error("Degradation operator '{0}' is not supported")]
    UnsupportedOperator(DegradationKind),

    #[error("Unknown degradation operator: {0:?}")]
    UnknownOperator(String),

    #[error("Invalid operator dimensions: channels={channels}, resolution={resolution}")]
    InvalidDimensions { channels: usize, resolution: usize },

    #[error(
        "Unsupported parameterization for conditional sampling: mean={mean}, var={var} \
         (expected mean=eps with fixed-small or fixed-large variance)"
    )]
    UnsupportedParameterization {
        mean: ModelMeanType,
        var: ModelVarType,
    },

    #[error("Unknown parameterization: {0:?}")]
    UnknownParameterization(String),

    #[error("Unknown beta schedule: {0:?}")]
    UnknownBetaSchedule(String),

    #[error("Invalid noise schedule: {0}")]
    InvalidSchedule(String),

    #[error("Unknown dataset: {0:?}")]
    UnknownDataset(String),

    #[error("Denoiser returned {got} channels, expected {expected} for {var} variance")]
    ChannelMismatch {
        expected: usize,
        got: usize,
        var: ModelVarType,
    },

    #[error("Measurement shape {measurement:?} is incompatible with sample shape {sample:?}")]
    MeasurementShape {
        measurement: Vec<usize>,
        sample: Vec<usize>,
    },

    #[error("Cannot write {0}-channel images (expected 1 or 3)")]
    UnsupportedChannels(usize),

    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write: {path}")]
    FileWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DdnmError>;
