//! Image restoration with null-space conditional DDPM sampling
//!
//! Degrades an input image with the chosen operator, then samples restorations
//! consistent with that measurement. Checkpoint loading is out of scope, so
//! the denoiser is the closed-form Gaussian-prior model; swap in a trained
//! network through the `Denoiser` trait for real restorations.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin restore -- \
//!     --input photo.png \
//!     --dataset cifar10 \
//!     --degradation inpainting \
//!     --config configs/cifar10.json \
//!     --output restored
//! ```

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use candle_ddnm::{
    ConditionalDiffusion, Dataset, DegradationKind, ExperimentConfig, GaussianPriorDenoiser,
    Pcg32, SampleInit,
    degradation::Degradation,
    get_operator,
    image_io::{load_image, save_images},
};

/// Command line arguments for restoration sampling
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Restore degraded images with null-space conditional DDPM sampling"
)]
struct Args {
    /// Clean input image; the measurement is produced by degrading it
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Dataset geometry: mnist, cifar10 or celeba
    #[arg(long, default_value = "cifar10")]
    dataset: Dataset,

    /// Degradation: colorization or inpainting
    #[arg(short, long, default_value = "inpainting")]
    degradation: DegradationKind,

    /// Experiment config JSON (uses built-in defaults if not provided)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of diffusion timesteps
    #[arg(long)]
    steps: Option<usize>,

    /// Samples per batch
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Total number of samples to generate
    #[arg(long, default_value_t = 16)]
    total_size: usize,

    /// Data standard deviation assumed by the Gaussian-prior denoiser
    #[arg(long, default_value_t = 0.5)]
    sigma_data: f64,

    /// Random seed; batch i uses seed + i (wrapping)
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output directory for generated images
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Sample without a measurement
    #[arg(long)]
    unconditional: bool,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,
}

/// Sizes of the sampling batches; only the last one may be short.
fn batch_sizes(total: usize, batch: usize) -> Vec<usize> {
    (0..total.div_ceil(batch))
        .map(|i| (total - i * batch).min(batch))
        .collect()
}

/// Seed for batch `index`, wrapping at `u64::MAX`.
fn batch_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add(index as u64)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_ddnm=info".parse()?)
                .add_directive("restore=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if args.batch_size == 0 {
        anyhow::bail!("batch_size must be at least 1");
    }

    let device = if args.cpu {
        info!("Using CPU");
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                info!("Using CUDA device 0");
                device
            }
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };

    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    if let Some(steps) = args.steps {
        config.diffusion = config.diffusion.with_timesteps(steps);
    }
    let clip_denoised = config.diffusion.clip_denoised;
    let diffusion = config
        .diffusion
        .build()
        .context("Invalid diffusion configuration")?;
    let mut denoiser = GaussianPriorDenoiser::new(&diffusion, args.sigma_data);

    let channels = args.dataset.channels();
    let resolution = args.dataset.resolution();
    info!(
        dataset = %args.dataset,
        timesteps = diffusion.timesteps(),
        total = args.total_size,
        batch = args.batch_size,
        "Configured sampler"
    );

    let batches = batch_sizes(args.total_size, args.batch_size);
    let num_batches = batches.len();

    if args.unconditional {
        for (i, &len) in batches.iter().enumerate() {
            let shape = (len, channels, resolution, resolution);
            let mut rng = Pcg32::seeded(batch_seed(args.seed, i));
            let x = diffusion
                .p_sample(
                    &mut denoiser,
                    SampleInit::Shape(shape.into()),
                    &device,
                    clip_denoised,
                    &mut rng,
                )
                .with_context(|| format!("Sampling failed on batch {i}"))?;
            save_images(&x, &args.output, &format!("batch{i:03}"))
                .context("Failed to save images")?;
            info!("Batch {}/{} saved", i + 1, num_batches);
        }
        return Ok(());
    }

    let input = args
        .input
        .as_ref()
        .context("--input is required unless --unconditional is set")?;
    let operator = get_operator(args.degradation, channels, resolution, &device)
        .context("Failed to build degradation operator")?;
    let image = load_image(input, resolution, channels, &device)
        .with_context(|| format!("Failed to load input image {}", input.display()))?;
    let measurement = operator.forward(&image)?;
    save_images(&measurement, &args.output, "measurement")
        .context("Failed to save measurement")?;

    let sampler = ConditionalDiffusion::new(diffusion, operator)
        .context("Diffusion config cannot be used for conditional sampling")?
        .with_clip_denoised(clip_denoised);

    let start = std::time::Instant::now();
    for (i, &len) in batches.iter().enumerate() {
        let shape = (len, channels, resolution, resolution);
        let mut rng = Pcg32::seeded(batch_seed(args.seed, i));
        let x = sampler
            .p_cond_sample(
                &mut denoiser,
                &measurement,
                SampleInit::Shape(shape.into()),
                &device,
                &mut rng,
            )
            .with_context(|| format!("Sampling failed on batch {i}"))?;
        save_images(&x, &args.output, &format!("batch{i:03}"))
            .context("Failed to save images")?;
        info!("Batch {}/{} saved", i + 1, num_batches);
    }

    info!(
        "Restoration complete in {:.2}s, images in {}",
        start.elapsed().as_secs_f64(),
        args.output.display()
    );
    Ok(())
}
