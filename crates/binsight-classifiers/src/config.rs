//! Configuration for the inference engine and model loading

use crate::model_loader::{DeviceType, ModelConfig, ModelSource};
use binsight_core::types::default_label_names;
use binsight_core::{ClassLabelSet, Error, InferenceOptions, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of cached predictions
pub const DEFAULT_CACHE_CAPACITY: usize = 500;

/// Configuration for one inference engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model artifact to load at startup; absent means the engine starts degraded
    #[serde(default)]
    pub model: Option<ModelSourceSpec>,

    /// Device to run inference on (`cpu`, or a map such as `cuda: {index: 1}`)
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub device: DeviceSpec,

    /// Ordered class names; index is class identity
    #[serde(default = "default_label_names")]
    pub labels: Vec<String>,

    /// Options used when a caller does not supply its own
    #[serde(default)]
    pub defaults: InferenceOptions,

    /// Maximum number of cached predictions
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Image geometry and normalization
    #[serde(default)]
    pub preprocessing: PreprocessConfig,
}

/// Model source specification (for config files)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelSourceSpec {
    /// Local file path (a directory picks the first artifact in it)
    Local {
        path: PathBuf,
    },

    /// Hugging Face Hub
    HuggingFace {
        repo_id: String,
        filename: String,
        revision: Option<String>,
    },
}

/// Device specification (for config files)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda { index: Option<usize> },
    Metal { index: Option<usize> },
}

impl DeviceSpec {
    /// Convert to DeviceType
    pub fn to_device_type(&self) -> DeviceType {
        match self {
            DeviceSpec::Cpu => DeviceType::Cpu,
            DeviceSpec::Cuda { index } => DeviceType::Cuda(index.unwrap_or(0)),
            DeviceSpec::Metal { index } => DeviceType::Metal(index.unwrap_or(0)),
        }
    }
}

/// Resize, crop and normalization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Target length of the shorter image side
    #[serde(default = "default_resize")]
    pub resize: u32,

    /// Side of the square crop fed to the model
    #[serde(default = "default_crop")]
    pub crop: u32,

    /// Per-channel mean (RGB)
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],

    /// Per-channel standard deviation (RGB)
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            resize: default_resize(),
            crop: default_crop(),
            mean: default_mean(),
            std: default_std(),
        }
    }
}

impl PreprocessConfig {
    /// Check geometry and normalization parameters
    pub fn validate(&self) -> Result<()> {
        if self.crop == 0 {
            return Err(Error::config("preprocessing.crop must be at least 1"));
        }
        if self.resize < self.crop {
            return Err(Error::config(format!(
                "preprocessing.resize ({}) must be >= preprocessing.crop ({})",
                self.resize, self.crop
            )));
        }
        if self.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(Error::config("preprocessing.std values must be positive"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: None,
            device: DeviceSpec::Cpu,
            labels: default_label_names(),
            defaults: InferenceOptions::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            preprocessing: PreprocessConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::config(format!("Invalid YAML config: {}", e)))
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Check every field; fails on the first invalid one
    pub fn validate(&self) -> Result<()> {
        self.label_set()?;
        self.defaults.validate()?;
        if self.cache_capacity == 0 {
            return Err(Error::config("cache_capacity must be at least 1"));
        }
        self.preprocessing.validate()
    }

    /// Build the label set
    pub fn label_set(&self) -> Result<ClassLabelSet> {
        ClassLabelSet::new(self.labels.iter().cloned())
    }

    /// Convert to ModelConfig for loading
    pub fn to_model_config(&self) -> Option<ModelConfig> {
        let source = match self.model.as_ref()? {
            ModelSourceSpec::Local { path } => ModelSource::LocalPath(path.clone()),
            ModelSourceSpec::HuggingFace {
                repo_id,
                filename,
                revision,
            } => ModelSource::HuggingFace {
                repo_id: repo_id.clone(),
                revision: revision.clone(),
                filename: filename.clone(),
            },
        };

        Some(ModelConfig {
            source,
            device: self.device.to_device_type(),
        })
    }
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_resize() -> u32 {
    256
}

fn default_crop() -> u32 {
    224
}

fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}
