//! BinSight Classifiers
//!
//! Candle-backed image classification for waste sorting.
//!
//! The pipeline for one image:
//! - fingerprint the pixels and configuration, return a cached result on a hit
//! - resize and crop (one center crop, or five crops with test-time augmentation)
//! - run the model, average logits over crops, apply softmax
//! - report the distribution, or `Unknown/Mixed` when the top class is not confident
//!
//! Models are loaded from PyTorch checkpoints, safetensors files or (with the `onnx`
//! feature) ONNX graphs, without knowing the checkpoint layout in advance.

pub mod architecture;
pub mod artifact;
pub mod cache;
pub mod config;
pub mod engine;
pub mod fingerprint;
#[cfg(feature = "onnx")]
pub mod graph;
pub mod model_loader;
pub mod preprocess;

pub use architecture::{detect_architecture, Architecture, ArchitectureRule, WeightIndex};
pub use artifact::{read_artifact, Artifact, ArtifactFormat};
pub use cache::{CacheStats, PredictionCache};
pub use config::{
    DeviceSpec, EngineConfig, ModelSourceSpec, PreprocessConfig, DEFAULT_CACHE_CAPACITY,
};
pub use engine::InferenceEngine;
pub use fingerprint::{fingerprint, CacheKey};
pub use model_loader::{
    CandleModel, DeviceType, ImageModel, LoadReport, LoadStrategy, ModelAdapter, ModelConfig,
    ModelHandle, ModelSource,
};
pub use preprocess::{CropRegion, PreprocessedBatch, Preprocessor};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::InferenceEngine;
    pub use crate::model_loader::{DeviceType, ImageModel, ModelAdapter, ModelConfig, ModelHandle};
    pub use crate::preprocess::Preprocessor;
    pub use binsight_core::{ClassificationResult, InferenceOptions};
}
