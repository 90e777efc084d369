//! Error types for BinSight

/// Result type alias using BinSight's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for BinSight operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The model artifact could not be read or was not recognized by any loading strategy
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Model output dimensionality differs from the class label count
    #[error("shape mismatch: expected {expected} outputs, model produced {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Image to tensor conversion errors
    #[error("preprocess error: {0}")]
    Preprocess(String),

    /// Forward pass and post-processing errors
    #[error("inference error: {0}")]
    Inference(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new model load error
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    /// Create a new preprocess error
    pub fn preprocess(msg: impl Into<String>) -> Self {
        Self::Preprocess(msg.into())
    }

    /// Create a new inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::model_load("unrecognized artifact");
        assert_eq!(err.to_string(), "model load error: unrecognized artifact");

        let err = Error::ShapeMismatch {
            expected: 10,
            actual: 8,
        };
        assert_eq!(
            err.to_string(),
            "shape mismatch: expected 10 outputs, model produced 8"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
