//! Deterministic image preprocessing
//!
//! Resize the shorter side, crop, scale to [0,1] and normalize per channel. With
//! augmentation enabled the single center crop becomes five crops (four corners plus
//! center) that the engine averages over.

use crate::config::PreprocessConfig;
use binsight_core::{Error, Result};
use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;

/// Crop position within the resized image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropRegion {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
}

impl CropRegion {
    /// Five-crop order
    pub const FIVE: [CropRegion; 5] = [
        CropRegion::TopLeft,
        CropRegion::TopRight,
        CropRegion::BottomLeft,
        CropRegion::BottomRight,
        CropRegion::Center,
    ];
}

/// Normalized crops ready for the model
#[derive(Debug, Clone)]
pub struct PreprocessedBatch {
    /// `N×3×crop×crop` f32 tensor on the CPU
    pub tensor: Tensor,

    /// Crop regions in batch order
    pub crops: Vec<CropRegion>,
}

impl PreprocessedBatch {
    /// Number of crops in the batch (1 or 5)
    pub fn len(&self) -> usize {
        self.crops.len()
    }

    /// Always false for batches produced by [`Preprocessor`]
    pub fn is_empty(&self) -> bool {
        self.crops.is_empty()
    }
}

/// Image to tensor conversion with fixed geometry and normalization
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    /// Create a preprocessor, validating the geometry
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Geometry and normalization parameters
    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Convert an image into a batch of 1 (center) or 5 (corners + center) crops
    pub fn preprocess(&self, image: &RgbImage, augment: bool) -> Result<PreprocessedBatch> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::preprocess(format!(
                "Image has no pixels ({}x{})",
                width, height
            )));
        }

        let resized = resize_shorter_side(image, self.config.resize)?;
        let crop = self.config.crop;
        let (rw, rh) = resized.dimensions();
        if rw < crop || rh < crop {
            return Err(Error::preprocess(format!(
                "Resized image {}x{} is smaller than crop {}",
                rw, rh, crop
            )));
        }

        let crops = if augment {
            CropRegion::FIVE.to_vec()
        } else {
            vec![CropRegion::Center]
        };

        let plane = (crop * crop) as usize;
        let mut data = Vec::with_capacity(crops.len() * 3 * plane);
        for region in &crops {
            let (x, y) = crop_offsets(rw, rh, crop, *region);
            self.normalize_into(&resized, x, y, &mut data);
        }

        let tensor = Tensor::from_vec(data, (crops.len(), 3, crop as usize, crop as usize), &Device::Cpu)
            .map_err(|e| Error::preprocess(format!("Failed to build input tensor: {}", e)))?;

        Ok(PreprocessedBatch { tensor, crops })
    }

    /// Append the channels-first normalized crop at (x, y)
    fn normalize_into(&self, image: &RgbImage, x: u32, y: u32, out: &mut Vec<f32>) {
        let crop = self.config.crop;
        for channel in 0..3 {
            let mean = self.config.mean[channel];
            let std = self.config.std[channel];
            for row in y..y + crop {
                for col in x..x + crop {
                    let value = image.get_pixel(col, row)[channel] as f32 / 255.0;
                    out.push((value - mean) / std);
                }
            }
        }
    }
}

/// Scale so the shorter side equals `target`; the longer side is scaled proportionally
/// and truncated. Images already at the target size are borrowed unchanged.
pub fn resize_shorter_side(image: &RgbImage, target: u32) -> Result<Cow<'_, RgbImage>> {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = scaled_dimensions(width, height, target)?;

    if (new_width, new_height) == (width, height) {
        return Ok(Cow::Borrowed(image));
    }

    Ok(Cow::Owned(imageops::resize(
        image,
        new_width,
        new_height,
        FilterType::Triangle,
    )))
}

/// Output size of [`resize_shorter_side`]
pub fn scaled_dimensions(width: u32, height: u32, target: u32) -> Result<(u32, u32)> {
    let (short, long) = (width.min(height), width.max(height));
    if short == 0 {
        return Err(Error::preprocess(format!(
            "Image has no pixels ({}x{})",
            width, height
        )));
    }

    let scaled = u32::try_from(long as u64 * target as u64 / short as u64).map_err(|_| {
        Error::preprocess(format!(
            "Cannot resize {}x{} to shorter side {}: longer side overflows",
            width, height, target
        ))
    })?;

    Ok(if width <= height {
        (target, scaled)
    } else {
        (scaled, target)
    })
}

/// Top-left corner of `region` for a `crop`-sized window in a `width×height` image.
/// Center offsets round half to even.
pub fn crop_offsets(width: u32, height: u32, crop: u32, region: CropRegion) -> (u32, u32) {
    let right = width - crop;
    let bottom = height - crop;
    match region {
        CropRegion::TopLeft => (0, 0),
        CropRegion::TopRight => (right, 0),
        CropRegion::BottomLeft => (0, bottom),
        CropRegion::BottomRight => (right, bottom),
        CropRegion::Center => (half_even(right), half_even(bottom)),
    }
}

fn half_even(span: u32) -> u32 {
    (span as f64 / 2.0).round_ties_even() as u32
}
