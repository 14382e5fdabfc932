//! Tests for degradation operators and the null-space correction
//!
//! Covers:
//! - Operator factory (supported kinds, rejection of the rest)
//! - Range consistency A(A⁺(A(x))) == A(x)
//! - Null-space correction for inpainting and colorization

use candle_core::{DType, Device, Result, Tensor};
use candle_ddnm::degradation::Inpainting;
use candle_ddnm::{
    BetaSchedule, ConditionalDiffusion, DdnmError, Degradation, DegradationKind,
    DegradationOperator, GaussianDiffusion, ModelMeanType, ModelVarType, Pcg32, get_beta_schedule,
    get_operator,
};

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

fn sampler(operator: DegradationOperator) -> ConditionalDiffusion {
    let betas = get_beta_schedule(BetaSchedule::Linear, 1e-4, 0.02, 10).unwrap();
    let base = GaussianDiffusion::new(betas, ModelMeanType::Eps, ModelVarType::FixedLarge).unwrap();
    ConditionalDiffusion::new(base, operator).unwrap()
}

// ============================================================================
// Factory
// ============================================================================

#[test]
fn test_supported_operators() {
    let device = Device::Cpu;
    let op = get_operator(DegradationKind::Colorization, 3, 32, &device).unwrap();
    assert_eq!(op.kind(), DegradationKind::Colorization);
    let op = get_operator(DegradationKind::Inpainting, 1, 32, &device).unwrap();
    assert_eq!(op.kind(), DegradationKind::Inpainting);
}

#[test]
fn test_unsupported_operators_rejected() {
    let device = Device::Cpu;
    for kind in [
        DegradationKind::Denoising,
        DegradationKind::SuperResolution,
        DegradationKind::Composite,
    ] {
        let err = get_operator(kind, 3, 32, &device).unwrap_err();
        assert!(
            matches!(err, DdnmError::UnsupportedOperator(k) if k == kind),
            "expected UnsupportedOperator for {kind}, got {err}"
        );
    }
}

#[test]
fn test_operator_names() {
    assert_eq!(
        "sr_averagepooling".parse::<DegradationKind>().unwrap(),
        DegradationKind::SuperResolution
    );
    assert_eq!(
        "all".parse::<DegradationKind>().unwrap(),
        DegradationKind::Composite
    );
    assert!(matches!(
        "deblur".parse::<DegradationKind>(),
        Err(DdnmError::UnknownOperator(_))
    ));
}

#[test]
fn test_zero_dimensions_rejected() {
    let err = get_operator(DegradationKind::Inpainting, 3, 0, &Device::Cpu).unwrap_err();
    assert!(matches!(err, DdnmError::InvalidDimensions { .. }));
}

// ============================================================================
// Operator algebra
// ============================================================================

#[test]
fn test_inpainting_mask_blocks_center() -> Result<()> {
    let op = Inpainting::new(3, 32, &Device::Cpu)?;
    let mask = op.mask().to_vec3::<f32>()?;
    // res/3 = 10, res/2 = 16
    assert_eq!(mask[0][10][10], 0.0);
    assert_eq!(mask[2][15][15], 0.0);
    assert_eq!(mask[1][9][12], 1.0);
    assert_eq!(mask[1][12][16], 1.0);
    let observed = op.mask().sum_all()?.to_scalar::<f32>()?;
    assert_eq!(observed, (3 * (32 * 32 - 6 * 6)) as f32);
    Ok(())
}

#[test]
fn test_range_consistency() -> Result<()> {
    let device = Device::Cpu;
    let mut rng = Pcg32::seeded(3);
    for kind in [DegradationKind::Colorization, DegradationKind::Inpainting] {
        let op = get_operator(kind, 3, 16, &device).unwrap();
        let x = rng.randn((2, 3, 16, 16), &device)?;
        let ax = op.forward(&x)?;
        let round_trip = op.forward(&op.pseudo_inverse(&ax)?)?;
        let diff = max_abs_diff(&round_trip, &ax)?;
        assert!(diff < 1e-6, "{kind}: A(A⁺(A(x))) differs by {diff}");
    }
    Ok(())
}

#[test]
fn test_colorization_keeps_batch() -> Result<()> {
    let device = Device::Cpu;
    let op = get_operator(DegradationKind::Colorization, 3, 8, &device).unwrap();
    let x = Pcg32::seeded(9).randn((4, 3, 8, 8), &device)?;
    let y = op.forward(&x)?;
    assert_eq!(y.dims(), &[4, 3, 8, 8]);
    assert_eq!(op.pseudo_inverse(&y)?.dims(), &[4, 3, 8, 8]);

    // each output channel is the channel mean
    let mean = x.mean_keepdim(1)?;
    let diff = max_abs_diff(&y.narrow(1, 2, 1)?, &mean)?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn test_colorization_channel_mismatch() -> Result<()> {
    let device = Device::Cpu;
    let op = get_operator(DegradationKind::Colorization, 3, 8, &device).unwrap();
    let x = Tensor::zeros((1, 1, 8, 8), DType::F32, &device)?;
    assert!(op.forward(&x).is_err());
    Ok(())
}

// ============================================================================
// Null-space correction
// ============================================================================

#[test]
fn test_inpainting_correction_keeps_observed_pixels() -> Result<()> {
    let device = Device::Cpu;
    let inpainting = Inpainting::new(3, 16, &device)?;
    let mask = inpainting.mask().unsqueeze(0)?;
    let sampler = sampler(DegradationOperator::Inpainting(inpainting));

    let mut rng = Pcg32::seeded(11);
    let x = rng.randn((1, 3, 16, 16), &device)?;
    let y = sampler.operator().forward(&x)?;
    let z = rng.randn((2, 3, 16, 16), &device)?;

    let corrected = sampler.null_space_correction(&y, &z)?;
    assert_eq!(corrected.dims(), &[2, 3, 16, 16]);

    // z + M ⊙ (y - z)
    let expected = (&z + mask.broadcast_mul(&y.broadcast_sub(&z)?)?)?;
    assert!(max_abs_diff(&corrected, &expected)? < 1e-6);

    // observed pixels come from y, blocked pixels from z
    let observed = corrected.broadcast_mul(&mask)?;
    let y_observed = y.broadcast_mul(&mask)?.broadcast_as(observed.shape())?;
    assert!(max_abs_diff(&observed, &y_observed)? < 1e-6);
    let blocked = (1.0 - &mask)?;
    let hidden = corrected.broadcast_mul(&blocked)?;
    assert!(max_abs_diff(&hidden, &z.broadcast_mul(&blocked)?)? < 1e-6);
    Ok(())
}

#[test]
fn test_colorization_correction_matches_measurement() -> Result<()> {
    let device = Device::Cpu;
    let op = get_operator(DegradationKind::Colorization, 3, 8, &device).unwrap();
    let sampler = sampler(op);

    let mut rng = Pcg32::seeded(5);
    let x = rng.randn((1, 3, 8, 8), &device)?;
    let y = sampler.operator().forward(&x)?;
    let z = rng.randn((3, 3, 8, 8), &device)?;

    let corrected = sampler.null_space_correction(&y, &z)?;
    let a_corrected = sampler.operator().forward(&corrected)?;
    let diff = max_abs_diff(&a_corrected, &y.broadcast_as(a_corrected.shape())?)?;
    assert!(diff < 1e-5, "A(corrected) differs from y by {diff}");
    Ok(())
}
