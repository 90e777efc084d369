//! JSON records printed for each classified image

use binsight_core::ClassificationResult;
use serde::Serialize;

/// One line of output
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Record {
    Prediction(PredictionRecord),
    Error(ErrorRecord),
}

/// Successful classification of one file
#[derive(Debug, Serialize)]
pub struct PredictionRecord {
    pub path: String,
    pub predictions: ClassificationResult,
    pub inference_time_s: f64,
    pub width: u32,
    pub height: u32,
}

/// File that could not be decoded or classified
#[derive(Debug, Serialize)]
pub struct ErrorRecord {
    pub path: String,
    pub error: String,
}

impl Record {
    pub fn error(path: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Error(ErrorRecord {
            path: path.into(),
            error: error.to_string(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Single-line JSON rendering
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"error":"failed to serialize record: {}"}}"#, e)
        })
    }
}
