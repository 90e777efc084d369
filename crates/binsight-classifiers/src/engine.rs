//! Inference engine: fingerprint, cache lookup, preprocess, forward, aggregate, threshold
//!
//! One engine owns the loaded model, the label set, the preprocessor and the prediction
//! cache. It is shared across callers behind an `Arc`; `classify` takes `&self`.

use crate::cache::PredictionCache;
use crate::config::EngineConfig;
use crate::fingerprint::{fingerprint, NO_MODEL_IDENTITY};
use crate::model_loader::{ModelAdapter, ModelHandle};
use crate::preprocess::Preprocessor;
use binsight_core::{ClassLabelSet, ClassScore, ClassificationResult, Error, InferenceOptions, Result};
use candle_core::{Tensor, D};
use image::RgbImage;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Image classifier with a content-addressed prediction cache
pub struct InferenceEngine {
    model: RwLock<Option<Arc<ModelHandle>>>,
    labels: ClassLabelSet,
    preprocessor: Preprocessor,
    cache: PredictionCache,
    defaults: InferenceOptions,
    forward_passes: AtomicU64,
}

impl InferenceEngine {
    /// Create an engine. `None` starts it degraded: every uncached call reports the
    /// missing model.
    pub fn new(
        model: Option<ModelHandle>,
        labels: ClassLabelSet,
        preprocessor: Preprocessor,
        cache: PredictionCache,
    ) -> Self {
        if let Some(handle) = &model {
            check_output_width(handle, &labels);
        }

        Self {
            model: RwLock::new(model.map(Arc::new)),
            labels,
            preprocessor,
            cache,
            defaults: InferenceOptions::default(),
            forward_passes: AtomicU64::new(0),
        }
    }

    /// Set the options used by [`classify_default`](Self::classify_default)
    pub fn with_defaults(mut self, defaults: InferenceOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build an engine from configuration, loading the configured model.
    ///
    /// Invalid configuration is an error. A model that fails to load is not: the engine
    /// starts degraded and the failure is logged.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let labels = config.label_set()?;
        let preprocessor = Preprocessor::new(config.preprocessing.clone())?;
        let cache = PredictionCache::new(config.cache_capacity)?;

        let model = match config.to_model_config() {
            Some(model_config) => {
                match ModelAdapter::for_device(labels.clone(), model_config.device)
                    .and_then(|adapter| adapter.load(&model_config))
                {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        tracing::warn!(error = %e, "Model failed to load, running degraded");
                        None
                    }
                }
            }
            None => {
                tracing::warn!("No model configured, running degraded");
                None
            }
        };

        Ok(Self::new(model, labels, preprocessor, cache).with_defaults(config.defaults))
    }

    /// Classify an image into a full distribution, an unknown verdict or a failure record.
    ///
    /// Forward-pass failures are returned as `Err` and are not cached. The cache key covers
    /// the pixels, the augmentation flag and the model, not `confidence_threshold`: a repeat
    /// call with another threshold returns the verdict stored by the first call.
    pub fn classify(
        &self,
        image: Option<&RgbImage>,
        options: &InferenceOptions,
    ) -> Result<ClassificationResult> {
        options.validate()?;

        let Some(image) = image else {
            metrics::counter!("binsight_inference_total", "outcome" => "no_image").increment(1);
            return Ok(ClassificationResult::no_image());
        };

        let model = self.model.read().clone();
        let identity = model
            .as_ref()
            .map(|m| m.identity())
            .unwrap_or(NO_MODEL_IDENTITY);
        let key = fingerprint(image, options.augment, identity);

        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(%key, "Prediction cache hit");
            metrics::counter!("binsight_inference_total", "outcome" => "cached").increment(1);
            return Ok(cached);
        }

        let Some(model) = model else {
            metrics::counter!("binsight_inference_total", "outcome" => "model_unavailable")
                .increment(1);
            return Ok(ClassificationResult::model_unavailable());
        };

        let batch = self.preprocessor.preprocess(image, options.augment)?;

        let start = Instant::now();
        let logits = model.forward(&batch.tensor)?;
        let elapsed = start.elapsed();
        self.forward_passes.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!("binsight_forward_latency_us").record(elapsed.as_micros() as f64);
        tracing::debug!(
            crops = batch.len(),
            latency_us = elapsed.as_micros() as u64,
            "Forward pass complete"
        );

        let averaged = aggregate_logits(&logits)?;
        let probabilities = softmax(&averaged)?;
        let probabilities = reconcile_distribution(probabilities, self.labels.len());
        let result = apply_threshold(&probabilities, &self.labels, options.confidence_threshold);

        let outcome = if result.is_unknown() { "unknown" } else { "classified" };
        metrics::counter!("binsight_inference_total", "outcome" => outcome).increment(1);

        self.cache.put(key, result.clone());
        Ok(result)
    }

    /// [`classify`](Self::classify) reduced to the `top_k` most probable classes
    pub fn top_labels(
        &self,
        image: Option<&RgbImage>,
        options: &InferenceOptions,
    ) -> Result<ClassificationResult> {
        Ok(self.classify(image, options)?.top_k(options.top_k))
    }

    /// [`classify`](Self::classify) with the engine's default options
    pub fn classify_default(&self, image: Option<&RgbImage>) -> Result<ClassificationResult> {
        self.classify(image, &self.defaults)
    }

    /// Run [`classify`](Self::classify) on the blocking thread pool
    pub async fn classify_async(
        self: Arc<Self>,
        image: Option<RgbImage>,
        options: InferenceOptions,
    ) -> Result<ClassificationResult> {
        tokio::task::spawn_blocking(move || self.classify(image.as_ref(), &options))
            .await
            .map_err(|e| Error::internal(format!("Inference task failed: {}", e)))?
    }

    /// Run [`top_labels`](Self::top_labels) on the blocking thread pool
    pub async fn top_labels_async(
        self: Arc<Self>,
        image: Option<RgbImage>,
        options: InferenceOptions,
    ) -> Result<ClassificationResult> {
        tokio::task::spawn_blocking(move || self.top_labels(image.as_ref(), &options))
            .await
            .map_err(|e| Error::internal(format!("Inference task failed: {}", e)))?
    }

    /// Swap in a new model. Cached predictions are dropped.
    pub fn reload(&self, model: ModelHandle) {
        check_output_width(&model, &self.labels);
        tracing::info!(
            architecture = model.architecture(),
            identity = model.identity(),
            "Reloading model"
        );

        *self.model.write() = Some(Arc::new(model));
        self.cache.clear();
    }

    /// Whether a model is loaded
    pub fn is_ready(&self) -> bool {
        self.model.read().is_some()
    }

    /// Identity of the loaded model
    pub fn model_identity(&self) -> Option<String> {
        self.model.read().as_ref().map(|m| m.identity().to_string())
    }

    /// Currently loaded model
    pub fn model(&self) -> Option<Arc<ModelHandle>> {
        self.model.read().clone()
    }

    pub fn labels(&self) -> &ClassLabelSet {
        &self.labels
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn defaults(&self) -> &InferenceOptions {
        &self.defaults
    }

    /// Number of forward passes run since construction
    pub fn forward_passes(&self) -> u64 {
        self.forward_passes.load(Ordering::Relaxed)
    }
}

fn check_output_width(model: &ModelHandle, labels: &ClassLabelSet) {
    if let Some(actual) = model.num_outputs() {
        if let Err(e) = reconcile_strict(actual, labels.len()) {
            tracing::warn!(
                error = %e,
                architecture = model.architecture(),
                "Model head does not match label set; outputs will be padded or truncated"
            );
        }
    }
}

/// Average an `N×K` logits batch over crops into a `K` vector.
///
/// Rank-1 output is a single prediction; higher ranks are flattened per crop.
pub fn aggregate_logits(logits: &Tensor) -> Result<Tensor> {
    let per_crop = match logits.rank() {
        0 => return Err(Error::inference("Model produced a scalar output")),
        1 => logits.unsqueeze(0),
        2 => Ok(logits.clone()),
        _ => logits.flatten_from(1),
    }
    .map_err(|e| Error::inference(format!("Failed to reshape logits: {}", e)))?;

    per_crop
        .mean(0)
        .map_err(|e| Error::inference(format!("Failed to average logits: {}", e)))
}

/// Softmax over a logits vector
pub fn softmax(logits: &Tensor) -> Result<Vec<f32>> {
    candle_nn::ops::softmax(logits, D::Minus1)
        .and_then(|p| p.to_vec1::<f32>())
        .map_err(|e| Error::inference(format!("Failed to compute probabilities: {}", e)))
}

/// Fit a probability vector to `expected` classes.
///
/// Short vectors are zero-padded at the tail. Long vectors are truncated at the tail and
/// renormalized to sum to 1.
pub fn reconcile_distribution(mut probabilities: Vec<f32>, expected: usize) -> Vec<f32> {
    let actual = probabilities.len();
    if actual == expected {
        return probabilities;
    }

    let mismatch = Error::ShapeMismatch { expected, actual };
    if actual < expected {
        tracing::warn!(error = %mismatch, "Padding model output with zero probabilities");
        probabilities.resize(expected, 0.0);
    } else {
        tracing::warn!(error = %mismatch, "Truncating model output");
        probabilities.truncate(expected);
        let total: f32 = probabilities.iter().sum();
        if total > 0.0 {
            for p in &mut probabilities {
                *p /= total;
            }
        }
    }

    probabilities
}

/// Fail with [`Error::ShapeMismatch`] unless `actual == expected`
pub fn reconcile_strict(actual: usize, expected: usize) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::ShapeMismatch { expected, actual })
    }
}

/// Label the distribution, or report it unknown when the top probability is strictly
/// below `threshold`
pub fn apply_threshold(
    probabilities: &[f32],
    labels: &ClassLabelSet,
    threshold: f32,
) -> ClassificationResult {
    let max = probabilities.iter().copied().fold(0.0f32, f32::max);
    if max < threshold {
        return ClassificationResult::Unknown { probability: max };
    }

    ClassificationResult::Distribution(
        labels
            .iter()
            .zip(probabilities)
            .map(|(label, p)| ClassScore::new(label, *p))
            .collect(),
    )
}
