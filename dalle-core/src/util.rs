use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use tracing::warn;

use crate::DeviceMap;

/// Resolves a device map to concrete devices, one per model replica.
pub fn select_devices(device_map: &DeviceMap) -> Result<Vec<Device>> {
    let ordinals = device_map.ordinals();
    if ordinals.is_empty() {
        return Ok(vec![Device::Cpu]);
    }
    if cuda_is_available() {
        return ordinals
            .into_iter()
            .map(|ordinal| Ok(Device::new_cuda(ordinal)?))
            .collect();
    }
    if metal_is_available() {
        return ordinals
            .into_iter()
            .map(|ordinal| Ok(Device::new_metal(ordinal)?))
            .collect();
    }
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
    }
    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    {
        warn!("Running on CPU, to run on GPU, build with `--features cuda`");
    }
    Ok(vec![Device::Cpu])
}

/// Converts a `(height, width, 3)` pixel tensor in `[0, 1]` into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (height, width, channels) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let pixels = (img.clamp(0f32, 1f32)? * 255.0)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}
