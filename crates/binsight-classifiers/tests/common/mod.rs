//! Mock models for testing
//!
//! Configurable `ImageModel` implementations with shared call counters, so tests can
//! observe forward passes after the model has been moved into an engine.

#![allow(dead_code)]

use binsight_classifiers::{ImageModel, InferenceEngine, ModelHandle, PredictionCache, PreprocessConfig, Preprocessor};
use binsight_core::{ClassLabelSet, Error, Result};
use candle_core::{Device, Tensor};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Returns the same logits row for every crop
pub struct FixedLogitsModel {
    logits: Vec<f32>,
    calls: Arc<AtomicU32>,
}

impl FixedLogitsModel {
    pub fn new(logits: Vec<f32>) -> Self {
        Self {
            logits,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Handle to the call counter
    pub fn counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl ImageModel for FixedLogitsModel {
    fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = batch.dim(0).map_err(|e| Error::inference(e.to_string()))?;
        Tensor::new(self.logits.as_slice(), &Device::Cpu)
            .and_then(|t| t.unsqueeze(0))
            .and_then(|t| t.repeat((n, 1)))
            .map_err(|e| Error::inference(e.to_string()))
    }
}

/// Logits proportional to the mean pixel value of each crop
pub struct PixelMeanModel {
    weights: Vec<f32>,
    calls: Arc<AtomicU32>,
}

impl PixelMeanModel {
    pub fn new(weights: Vec<f32>) -> Self {
        Self {
            weights,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl ImageModel for PixelMeanModel {
    fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let k = self.weights.len();
        let weights = Tensor::new(self.weights.as_slice(), &Device::Cpu)
            .and_then(|t| t.reshape((1, k)))
            .map_err(|e| Error::inference(e.to_string()))?;
        batch
            .flatten_from(1)
            .and_then(|t| t.mean_keepdim(1))
            .and_then(|m| m.broadcast_mul(&weights))
            .map_err(|e| Error::inference(e.to_string()))
    }
}

/// Always fails
pub struct FailingModel {
    calls: Arc<AtomicU32>,
}

impl FailingModel {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl ImageModel for FailingModel {
    fn forward(&self, _batch: &Tensor) -> Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::inference("simulated device failure"))
    }
}

/// Labels `class0 .. class{n-1}`
pub fn labels(n: usize) -> ClassLabelSet {
    ClassLabelSet::new((0..n).map(|i| format!("class{}", i))).unwrap()
}

/// Small geometry so tests stay fast
pub fn small_preprocessor() -> Preprocessor {
    Preprocessor::new(PreprocessConfig {
        resize: 16,
        crop: 12,
        ..Default::default()
    })
    .unwrap()
}

/// Engine around `model` with small preprocessing geometry
pub fn engine_with(model: impl ImageModel + 'static, labels: ClassLabelSet, capacity: usize) -> InferenceEngine {
    let handle = ModelHandle::new(model, "mock", "mock:0000000000000000");
    InferenceEngine::new(
        Some(handle),
        labels,
        small_preprocessor(),
        PredictionCache::new(capacity).unwrap(),
    )
}

/// Engine without a model
pub fn degraded_engine() -> InferenceEngine {
    InferenceEngine::new(
        None,
        labels(10),
        small_preprocessor(),
        PredictionCache::new(8).unwrap(),
    )
}

/// Deterministic test image; different seeds give different pixels
pub fn test_image(seed: u8) -> RgbImage {
    RgbImage::from_fn(24, 20, |x, y| {
        Rgb([
            (x as u8).wrapping_mul(9).wrapping_add(seed),
            (y as u8).wrapping_mul(5).wrapping_add(seed),
            seed,
        ])
    })
}

/// Image with every pixel the same
pub fn uniform_image(value: u8) -> RgbImage {
    RgbImage::from_pixel(24, 20, Rgb([value, value / 2, value / 3]))
}
