//! BinSight Core
//!
//! Core types and error handling shared across BinSight components.
//!
//! This crate provides:
//! - The fixed, ordered class label set used as canonical class identity
//! - Classification result records and their wire representation
//! - Per-call inference options
//! - Error types and result handling

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    ClassLabelSet, ClassScore, ClassificationResult, FailureKind, InferenceOptions, ERROR_KEY,
    UNKNOWN_LABEL,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::{ClassLabelSet, ClassificationResult, InferenceOptions};
}
