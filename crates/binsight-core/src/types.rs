//! Core types for BinSight

use crate::error::{Error, Result};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::sync::Arc;

/// Label reported when the top probability falls below the confidence threshold
pub const UNKNOWN_LABEL: &str = "Unknown/Mixed";

/// Key carrying the message of a failed classification
pub const ERROR_KEY: &str = "error";

/// Fixed, ordered set of class names.
///
/// The index of a name is its canonical class identity: logit `i`, probability `i` and
/// output key `i` all refer to the same class. The set is immutable once built and cheap
/// to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabelSet {
    labels: Arc<[String]>,
}

impl ClassLabelSet {
    /// Build a label set, rejecting empty sets and duplicate names
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();

        if labels.is_empty() {
            return Err(Error::config("class label set must not be empty"));
        }

        let mut seen = HashSet::with_capacity(labels.len());
        for label in &labels {
            if label.trim().is_empty() {
                return Err(Error::config("class labels must not be blank"));
            }
            if !seen.insert(label.as_str()) {
                return Err(Error::config(format!("duplicate class label '{}'", label)));
            }
        }

        Ok(Self {
            labels: labels.into(),
        })
    }

    /// The ten waste categories the stock classifier was trained on
    pub fn waste_categories() -> Self {
        Self {
            labels: default_label_names().into(),
        }
    }

    /// Number of classes
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Always false for a constructed set; provided for API symmetry
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Class name at `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Position of `label`, if present
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Iterate class names in canonical order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Borrow the names as a slice
    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }
}

impl Default for ClassLabelSet {
    fn default() -> Self {
        Self::waste_categories()
    }
}

/// Names of the stock waste categories, in canonical order
pub fn default_label_names() -> Vec<String> {
    [
        "battery",
        "biological",
        "cardboard",
        "clothes",
        "glass",
        "metal",
        "paper",
        "plastic",
        "shoes",
        "trash",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Probability assigned to one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    /// Class name
    pub label: String,

    /// Probability (0.0-1.0)
    pub probability: f32,
}

impl ClassScore {
    /// Create a new class score
    pub fn new(label: impl Into<String>, probability: f32) -> Self {
        Self {
            label: label.into(),
            probability,
        }
    }
}

/// Why a classification produced no prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No image was supplied
    NoImage,
    /// No model is loaded
    ModelUnavailable,
}

/// Outcome of classifying one image.
///
/// Serializes to the result record handed back to transport layers:
/// `{"<class>": p, ...}`, `{"Unknown/Mixed": p}` or `{"error": "<message>"}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationResult {
    /// Class probabilities. Holds every class in label order for a full classification,
    /// or the K most probable classes in descending order after a top-K reduction.
    Distribution(Vec<ClassScore>),

    /// Top probability was below the confidence threshold
    Unknown { probability: f32 },

    /// No prediction could be made
    Failed { kind: FailureKind, message: String },
}

impl ClassificationResult {
    /// Result for a call without an image
    pub fn no_image() -> Self {
        Self::Failed {
            kind: FailureKind::NoImage,
            message: "no image provided".to_string(),
        }
    }

    /// Result for a call while no model is loaded
    pub fn model_unavailable() -> Self {
        Self::Failed {
            kind: FailureKind::ModelUnavailable,
            message: "model not loaded on server".to_string(),
        }
    }

    /// Whether this result carries class probabilities
    pub fn is_distribution(&self) -> bool {
        matches!(self, Self::Distribution(_))
    }

    /// Whether this is the low-confidence verdict
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }

    /// Whether this is an error record
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Class scores, if any
    pub fn scores(&self) -> Option<&[ClassScore]> {
        match self {
            Self::Distribution(scores) => Some(scores),
            _ => None,
        }
    }

    /// Probability of `label`, if it is part of the distribution
    pub fn probability_of(&self, label: &str) -> Option<f32> {
        self.scores()?
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.probability)
    }

    /// Most probable class; for ties the earliest class wins
    pub fn top(&self) -> Option<&ClassScore> {
        self.scores()?.iter().fold(None, |best: Option<&ClassScore>, s| match best {
            Some(b) if b.probability >= s.probability => Some(b),
            _ => Some(s),
        })
    }

    /// Number of entries the serialized record will contain
    pub fn len(&self) -> usize {
        match self {
            Self::Distribution(scores) => scores.len(),
            _ => 1,
        }
    }

    /// True only for an empty distribution
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the `k` most probable classes sorted by descending probability.
    ///
    /// Unknown and failure results pass through unchanged.
    pub fn top_k(&self, k: usize) -> Self {
        match self {
            Self::Distribution(scores) => {
                let mut ranked = scores.clone();
                // Stable sort: equal probabilities keep label order
                ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
                ranked.truncate(k);
                Self::Distribution(ranked)
            }
            other => other.clone(),
        }
    }

    /// Render as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        // Serializing into a Value cannot fail for this type
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for ClassificationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        match self {
            Self::Distribution(scores) => {
                for score in scores {
                    map.serialize_entry(&score.label, &score.probability)?;
                }
            }
            Self::Unknown { probability } => {
                map.serialize_entry(UNKNOWN_LABEL, probability)?;
            }
            Self::Failed { message, .. } => {
                map.serialize_entry(ERROR_KEY, message)?;
            }
        }
        map.end()
    }
}

/// Per-call classification options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// Average predictions over five crops
    #[serde(default)]
    pub augment: bool,

    /// Minimum top-class probability required to report a class
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Number of entries kept by top-K reductions
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            augment: false,
            confidence_threshold: default_confidence_threshold(),
            top_k: default_top_k(),
        }
    }
}

impl InferenceOptions {
    /// Enable or disable test-time augmentation
    pub fn with_augment(mut self, augment: bool) -> Self {
        self.augment = augment;
        self
    }

    /// Set the confidence threshold
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Set K for top-K reductions
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Check that the threshold lies in (0, 1) and K is at least 1
    pub fn validate(&self) -> Result<()> {
        let t = self.confidence_threshold;
        if !(t > 0.0 && t < 1.0) {
            return Err(Error::config(format!(
                "confidence_threshold must be in (0, 1), got {}",
                t
            )));
        }
        if self.top_k == 0 {
            return Err(Error::config("top_k must be at least 1"));
        }
        Ok(())
    }
}

fn default_confidence_threshold() -> f32 {
    0.35
}

fn default_top_k() -> usize {
    3
}
