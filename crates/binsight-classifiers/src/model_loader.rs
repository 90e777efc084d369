//! Model loading for Candle-based image classifiers
//!
//! Checkpoint provenance is routinely lost between training and serving, so the loader
//! does not require a fixed file schema. The artifact is decoded once and run through an
//! ordered chain of strategies; the first strategy that produces a model wins:
//!
//! 1. self-describing executable graph
//! 2. flat weight mapping (architecture inferred from key names)
//! 3. checkpoint nesting a weight mapping under a well-known key
//! 4. pickled full model object

use crate::architecture::{detect_architecture, Architecture, WeightIndex};
use crate::artifact::{read_artifact, Artifact};
use binsight_core::{ClassLabelSet, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder, VarMap};
use hf_hub::{api::sync::Api, Repo, RepoType};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Checkpoint keys known to hold a nested weight mapping, tried in order
pub const CHECKPOINT_KEYS: &[&str] = &["model_state_dict", "state_dict", "model_state", "model", "net"];

/// Namespace added to every key by `DataParallel` / `DistributedDataParallel`
pub const DISTRIBUTED_PREFIX: &str = "module.";

/// A network that maps an `N×C×H×W` batch to `N×K` logits
pub trait ImageModel: Send + Sync {
    /// Run a forward pass in inference mode
    fn forward(&self, batch: &Tensor) -> Result<Tensor>;
}

/// Adapter exposing any Candle [`Module`] as an [`ImageModel`]
pub struct CandleModel<M> {
    module: M,
}

impl<M: Module + Send + Sync> CandleModel<M> {
    /// Wrap a Candle module
    pub fn new(module: M) -> Self {
        Self { module }
    }
}

impl<M: Module + Send + Sync> ImageModel for CandleModel<M> {
    fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        self.module
            .forward(batch)
            .map_err(|e| Error::inference(format!("Model forward pass failed: {}", e)))
    }
}

/// Configuration for loading a model artifact
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Source of the artifact
    pub source: ModelSource,

    /// Device to run inference on
    pub device: DeviceType,
}

/// Source location for the model artifact
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Load from local file system
    LocalPath(PathBuf),

    /// Download from Hugging Face Hub
    HuggingFace {
        repo_id: String,
        revision: Option<String>,
        filename: String,
    },
}

/// Device type for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// CPU inference (always available)
    Cpu,
    /// CUDA GPU inference (if available)
    Cuda(usize), // GPU index
    /// Metal (Apple Silicon)
    Metal(usize),
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            source: ModelSource::LocalPath(PathBuf::new()),
            device: DeviceType::Cpu,
        }
    }
}

impl ModelConfig {
    /// Create a new model configuration from local path
    pub fn from_local(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ModelSource::LocalPath(path.into()),
            ..Default::default()
        }
    }

    /// Create a new model configuration from Hugging Face
    pub fn from_hf(repo_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            source: ModelSource::HuggingFace {
                repo_id: repo_id.into(),
                revision: None,
                filename: filename.into(),
            },
            ..Default::default()
        }
    }

    /// Set device
    pub fn with_device(mut self, device: DeviceType) -> Self {
        self.device = device;
        self
    }

    /// Set Hugging Face revision
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        if let ModelSource::HuggingFace { repo_id, filename, .. } = self.source {
            self.source = ModelSource::HuggingFace {
                repo_id,
                revision: Some(revision.into()),
                filename,
            };
        }
        self
    }
}

/// Strategy that produced a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStrategy {
    /// The artifact carried its own computation graph
    ExecutableGraph,
    /// The artifact was a bare weight dictionary
    FlatWeights,
    /// The weight dictionary was nested under `key`
    NestedCheckpoint { key: String },
    /// The artifact was a whole pickled model object
    FullModel { class_name: String },
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutableGraph => write!(f, "executable-graph"),
            Self::FlatWeights => write!(f, "flat-weights"),
            Self::NestedCheckpoint { key } => write!(f, "nested-checkpoint[{}]", key),
            Self::FullModel { class_name } => write!(f, "full-model[{}]", class_name),
        }
    }
}

/// Outcome of copying a weight dictionary into a freshly built network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Tensors copied into the network
    pub loaded: usize,
    /// Network tensors absent from the weights (left at their default initialization)
    pub missing: Vec<String>,
    /// Weights with no counterpart in the network
    pub unexpected: Vec<String>,
    /// Weights whose shape differs from the network tensor (skipped)
    pub mismatched: Vec<String>,
}

impl LoadReport {
    /// Whether every network tensor was filled and every weight used
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Loaded classifier plus its metadata.
///
/// Created once at startup and shared read-only by every inference call.
pub struct ModelHandle {
    model: Box<dyn ImageModel>,
    architecture: String,
    identity: String,
    strategy: Option<LoadStrategy>,
    device: Device,
    num_outputs: Option<usize>,
    report: Option<LoadReport>,
}

impl ModelHandle {
    /// Wrap an already constructed model running on the CPU
    pub fn new(
        model: impl ImageModel + 'static,
        architecture: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            model: Box::new(model),
            architecture: architecture.into(),
            identity: identity.into(),
            strategy: None,
            device: Device::Cpu,
            num_outputs: None,
            report: None,
        }
    }

    /// Declare the model's output width
    pub fn with_num_outputs(mut self, num_outputs: usize) -> Self {
        self.num_outputs = Some(num_outputs);
        self
    }

    /// Set the device batches are moved to before the forward pass
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Run the model on a CPU batch. Returns `N×K` logits on the CPU.
    pub fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        let input = batch
            .to_device(&self.device)
            .map_err(|e| Error::inference(format!("Failed to move batch to device: {}", e)))?;

        let logits = self.model.forward(&input)?;

        logits
            .to_device(&Device::Cpu)
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(|e| Error::inference(format!("Failed to read logits: {}", e)))
    }

    /// Architecture name, e.g. `efficientnet_b0`
    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// Identity string distinguishing this model in cache keys
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Strategy that produced this handle, if it came from an artifact
    pub fn strategy(&self) -> Option<&LoadStrategy> {
        self.strategy.as_ref()
    }

    /// Device the model runs on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Output width, when known before running the model
    pub fn num_outputs(&self) -> Option<usize> {
        self.num_outputs
    }

    /// Weight loading report for non-strictly loaded models
    pub fn load_report(&self) -> Option<&LoadReport> {
        self.report.as_ref()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("architecture", &self.architecture)
            .field("identity", &self.identity)
            .field("strategy", &self.strategy)
            .field("num_outputs", &self.num_outputs)
            .finish()
    }
}

/// Model produced by a strategy, before it is bound to an identity
struct LoadedModel {
    model: Box<dyn ImageModel>,
    /// Device the model's tensors live on
    device: Device,
    architecture: String,
    strategy: LoadStrategy,
    num_outputs: Option<usize>,
    report: Option<LoadReport>,
}

/// A loading strategy: `Ok(None)` means the artifact is not of this kind
type Strategy = fn(&ModelAdapter, &Artifact) -> Result<Option<LoadedModel>>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("executable-graph", load_executable_graph),
    ("flat-weights", load_flat_weights),
    ("nested-checkpoint", load_nested_checkpoint),
    ("full-model", load_full_model),
];

/// Turns model artifacts into [`ModelHandle`]s sized for a label set
pub struct ModelAdapter {
    labels: ClassLabelSet,
    device: Device,
}

impl ModelAdapter {
    /// Create an adapter building networks on `device`
    pub fn new(labels: ClassLabelSet, device: Device) -> Self {
        Self { labels, device }
    }

    /// Create an adapter for the device named by `device_type`
    pub fn for_device(labels: ClassLabelSet, device_type: DeviceType) -> Result<Self> {
        Ok(Self::new(labels, create_device(device_type)?))
    }

    /// Resolve, decode and load the artifact described by `config`
    pub fn load(&self, config: &ModelConfig) -> Result<ModelHandle> {
        let path = resolve_model_path(config)?;
        self.load_path(&path)
    }

    /// Decode and load the artifact at `path`
    pub fn load_path(&self, path: impl AsRef<Path>) -> Result<ModelHandle> {
        let path = path.as_ref();
        let artifact = read_artifact(path)?;
        let identity = artifact_identity(path)?;
        self.load_artifact(&artifact, &identity)
    }

    /// Run the strategy chain over a decoded artifact
    pub fn load_artifact(&self, artifact: &Artifact, identity: &str) -> Result<ModelHandle> {
        let mut errors = Vec::new();

        for (name, strategy) in STRATEGIES {
            match strategy(self, artifact) {
                Ok(Some(loaded)) => {
                    tracing::info!(
                        strategy = %loaded.strategy,
                        architecture = %loaded.architecture,
                        identity,
                        "Model loaded"
                    );
                    return Ok(ModelHandle {
                        model: loaded.model,
                        architecture: loaded.architecture,
                        identity: identity.to_string(),
                        strategy: Some(loaded.strategy),
                        device: loaded.device,
                        num_outputs: loaded.num_outputs,
                        report: loaded.report,
                    });
                }
                Ok(None) => {
                    tracing::debug!(strategy = name, "Strategy not applicable");
                    errors.push(format!("{}: not applicable", name));
                }
                Err(e) => {
                    tracing::warn!(strategy = name, error = %e, "Strategy failed");
                    errors.push(format!("{}: {}", name, e));
                }
            }
        }

        Err(Error::model_load(format!(
            "Unable to interpret {} artifact [{}]",
            artifact.kind(),
            errors.join(" | ")
        )))
    }

    /// Labels the classification head is sized for
    pub fn labels(&self) -> &ClassLabelSet {
        &self.labels
    }

    /// Build `architecture` with `num_classes` outputs and copy `weights` into it,
    /// tolerating missing, unexpected and shape-mismatched keys
    fn build_non_strict(
        &self,
        architecture: Architecture,
        weights: &[(String, Tensor)],
        num_classes: usize,
    ) -> Result<(Box<dyn ImageModel>, LoadReport)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = architecture.build(vb, num_classes).map_err(|e| {
            Error::model_load(format!("Failed to instantiate {}: {}", architecture, e))
        })?;

        let vars = varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?;

        let mut report = LoadReport::default();
        let mut provided = HashSet::with_capacity(weights.len());

        for (name, tensor) in weights {
            provided.insert(name.as_str());
            match vars.get(name) {
                Some(var) if var.dims() == tensor.dims() => {
                    tensor
                        .to_device(&self.device)
                        .and_then(|t| var.set(&t))
                        .map_err(|e| Error::model_load(format!("Failed to load {}: {}", name, e)))?;
                    report.loaded += 1;
                }
                Some(_) => report.mismatched.push(name.clone()),
                None => report.unexpected.push(name.clone()),
            }
        }

        report.missing = vars
            .keys()
            .filter(|k| !provided.contains(k.as_str()))
            .cloned()
            .collect();
        report.missing.sort();
        report.unexpected.sort();
        report.mismatched.sort();

        if report.is_exact() {
            tracing::info!(loaded = report.loaded, "Loaded weights into {}", architecture);
        } else {
            tracing::warn!(
                loaded = report.loaded,
                missing = ?report.missing,
                unexpected = ?report.unexpected,
                mismatched = ?report.mismatched,
                "Loaded weights into {} (non-strict)",
                architecture
            );
        }

        Ok((model, report))
    }

    fn load_weight_mapping(&self, mapping: &Artifact, strategy: LoadStrategy) -> Result<Option<LoadedModel>> {
        if !mapping.looks_like_weights() {
            return Ok(None);
        }

        let weights = strip_distributed_prefix(mapping.tensor_entries());
        let index = WeightIndex::new(weights.iter().map(|(k, t)| (k.as_str(), t)));
        let architecture = detect_architecture(&index);
        tracing::info!("Instantiating {} from weight mapping", architecture);

        let num_classes = self.labels.len();
        let (model, report) = self.build_non_strict(architecture, &weights, num_classes)?;

        Ok(Some(LoadedModel {
            model,
            device: self.device.clone(),
            architecture: architecture.to_string(),
            strategy,
            num_outputs: Some(num_classes),
            report: Some(report),
        }))
    }
}

#[cfg(feature = "onnx")]
fn load_executable_graph(_adapter: &ModelAdapter, artifact: &Artifact) -> Result<Option<LoadedModel>> {
    let Artifact::Graph(proto) = artifact else {
        return Ok(None);
    };
    let model = crate::graph::OnnxModel::new(proto.as_ref().clone())?;
    // simple_eval reads initializers on the CPU
    Ok(Some(LoadedModel {
        model: Box::new(model),
        device: Device::Cpu,
        architecture: "onnx-graph".to_string(),
        strategy: LoadStrategy::ExecutableGraph,
        num_outputs: None,
        report: None,
    }))
}

#[cfg(not(feature = "onnx"))]
fn load_executable_graph(_adapter: &ModelAdapter, _artifact: &Artifact) -> Result<Option<LoadedModel>> {
    Ok(None)
}

fn load_flat_weights(adapter: &ModelAdapter, artifact: &Artifact) -> Result<Option<LoadedModel>> {
    adapter.load_weight_mapping(artifact, LoadStrategy::FlatWeights)
}

fn load_nested_checkpoint(adapter: &ModelAdapter, artifact: &Artifact) -> Result<Option<LoadedModel>> {
    if artifact.as_mapping().is_none() {
        return Ok(None);
    }

    for key in CHECKPOINT_KEYS {
        if let Some(nested) = artifact.get(key) {
            if nested.looks_like_weights() {
                tracing::info!("Found nested weight mapping under '{}'", key);
                let strategy = LoadStrategy::NestedCheckpoint {
                    key: key.to_string(),
                };
                return adapter.load_weight_mapping(nested, strategy);
            }
        }
    }

    Ok(None)
}

fn load_full_model(adapter: &ModelAdapter, artifact: &Artifact) -> Result<Option<LoadedModel>> {
    let Artifact::Module { class_name, state } = artifact else {
        return Ok(None);
    };

    let index = WeightIndex::new(state.iter().map(|(k, t)| (k.as_str(), t)));
    let architecture = Architecture::from_class_name(class_name, &index).ok_or_else(|| {
        Error::model_load(format!("Unsupported model class '{}'", class_name))
    })?;

    // The object is used as-is: keep its own head width
    let num_outputs = architecture
        .head_width(&index)
        .unwrap_or_else(|| adapter.labels.len());
    tracing::info!(
        "Rebuilding {} from pickled {} ({} outputs)",
        architecture,
        class_name,
        num_outputs
    );

    let (model, report) = adapter.build_non_strict(architecture, state, num_outputs)?;

    Ok(Some(LoadedModel {
        model,
        device: adapter.device.clone(),
        architecture: architecture.to_string(),
        strategy: LoadStrategy::FullModel {
            class_name: class_name.clone(),
        },
        num_outputs: Some(num_outputs),
        report: Some(report),
    }))
}

/// Remove leading `module.` segments added by distributed training wrappers
pub fn strip_distributed_prefix(weights: Vec<(String, Tensor)>) -> Vec<(String, Tensor)> {
    weights
        .into_iter()
        .map(|(name, tensor)| {
            let mut key = name.as_str();
            while let Some(rest) = key.strip_prefix(DISTRIBUTED_PREFIX) {
                key = rest;
            }
            (key.to_string(), tensor)
        })
        .collect()
}

/// `<file stem>:<first 16 hex digits of the file's SHA-256>`
pub fn artifact_identity(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();

    Ok(format!("{}:{}", stem, hex))
}

/// Resolve model path from source
pub fn resolve_model_path(config: &ModelConfig) -> Result<PathBuf> {
    match &config.source {
        ModelSource::LocalPath(path) => {
            if !path.exists() {
                return Err(Error::model_load(format!(
                    "Model file not found: {:?}",
                    path
                )));
            }
            if path.is_dir() {
                return discover_models(path)?.into_iter().next().ok_or_else(|| {
                    Error::model_load(format!("No model artifacts in {}", path.display()))
                });
            }
            Ok(path.clone())
        }
        ModelSource::HuggingFace {
            repo_id,
            revision,
            filename,
        } => {
            // Download from Hugging Face Hub
            let api = Api::new()
                .map_err(|e| Error::model_load(format!("Failed to initialize HF API: {}", e)))?;

            let repo = api.repo(Repo::with_revision(
                repo_id.clone(),
                RepoType::Model,
                revision.clone().unwrap_or_else(|| "main".to_string()),
            ));

            repo.get(filename)
                .map_err(|e| Error::model_load(format!("Failed to download model from HF: {}", e)))
        }
    }
}

/// Create Candle device from device type
pub fn create_device(device_type: DeviceType) -> Result<Device> {
    match device_type {
        DeviceType::Cpu => Ok(Device::Cpu),
        DeviceType::Cuda(idx) => Device::new_cuda(idx)
            .map_err(|e| Error::model_load(format!("Failed to create CUDA device: {}", e))),
        DeviceType::Metal(idx) => Device::new_metal(idx)
            .map_err(|e| Error::model_load(format!("Failed to create Metal device: {}", e))),
    }
}

/// Find model artifacts in a directory, sorted by file name
pub fn discover_models(models_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut model_paths = Vec::new();

    let entries = std::fs::read_dir(models_dir.as_ref())
        .map_err(|e| Error::config(format!("Failed to read models directory: {}", e)))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::config(format!("Failed to read directory entry: {}", e)))?;
        let path = entry.path();

        if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
            if matches!(ext, "safetensors" | "pt" | "pth" | "bin" | "ckpt" | "onnx") {
                model_paths.push(path);
            }
        }
    }

    model_paths.sort();
    Ok(model_paths)
}
