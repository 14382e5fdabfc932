//! Conversion between image files and [-1, 1] sample tensors

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{DdnmError, Result};

/// Load an image, resize it to `resolution`², and return a [1, C, R, R]
/// tensor in [-1, 1]. `channels` selects gray (1) or RGB (3).
pub fn load_image(
    path: impl AsRef<Path>,
    resolution: usize,
    channels: usize,
    device: &Device,
) -> Result<Tensor> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| DdnmError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    let img = image::load_from_memory(&bytes)?.resize_exact(
        resolution as u32,
        resolution as u32,
        image::imageops::FilterType::Lanczos3,
    );

    let raw = match channels {
        1 => img.to_luma8().into_raw(),
        3 => img.to_rgb8().into_raw(),
        c => return Err(DdnmError::UnsupportedChannels(c)),
    };
    let data: Vec<f32> = raw.iter().map(|&p| (p as f32 / 255.0) * 2.0 - 1.0).collect();

    let tensor = Tensor::from_vec(data, (resolution, resolution, channels), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Map [-1, 1] samples [B, C, H, W] to `u8` pixels [B, H, W, C].
pub fn to_u8_images(x: &Tensor) -> candle_core::Result<Tensor> {
    x.to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))
}

/// Write every batch element of `x` as `<dir>/<prefix>_<i>.png`.
///
/// Files are encoded and written in parallel. Returns the written paths in
/// batch order.
pub fn save_images(x: &Tensor, dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(|source| DdnmError::FileWrite {
        path: dir.display().to_string(),
        source,
    })?;

    let (batch, channels, height, width) = x.dims4()?;
    if channels != 1 && channels != 3 {
        return Err(DdnmError::UnsupportedChannels(channels));
    }
    let pixels = to_u8_images(x)?;
    let items = (0..batch)
        .map(|i| pixels.i(i)?.flatten_all()?.to_vec1::<u8>())
        .collect::<candle_core::Result<Vec<_>>>()?;

    items
        .into_par_iter()
        .enumerate()
        .map(|(i, data)| -> Result<PathBuf> {
            let path = dir.join(format!("{prefix}_{i:04}.png"));
            let (w, h) = (width as u32, height as u32);
            if channels == 1 {
                image::GrayImage::from_raw(w, h, data)
                    .ok_or_else(|| candle_core::Error::Msg("Failed to create image".to_string()))?
                    .save(&path)?;
            } else {
                image::RgbImage::from_raw(w, h, data)
                    .ok_or_else(|| candle_core::Error::Msg("Failed to create image".to_string()))?
                    .save(&path)?;
            }
            debug!(path = %path.display(), "Saved image");
            Ok(path)
        })
        .collect()
}
