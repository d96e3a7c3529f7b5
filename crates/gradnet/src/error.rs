//! Typed error taxonomy carried inside `anyhow::Error`.
//!
//! Fallible APIs return `anyhow::Result`; callers that need to classify a failure
//! downcast to one of these enums. Configuration, naming, and persistence errors
//! are fatal and never retried. Batch-scoped errors may be skipped under an
//! explicit trainer policy.

use std::path::PathBuf;

use thiserror::Error;

/// Structural misuse detected while assembling or compiling a model.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("layer '{layer}' cannot consume input shape {shape:?}: {reason}")]
    IncompatibleInput {
        layer: String,
        shape: Vec<usize>,
        reason: String,
    },
    #[error("duplicate parameter name '{name}' declared during compile")]
    DuplicateParameter { name: String },
    #[error("model is already compiled; layers can no longer be added")]
    ModelFrozen,
    #[error("model compiled twice with incompatible settings: {reason}")]
    RecompileMismatch { reason: String },
    #[error("invalid layer configuration for '{layer}': {reason}")]
    InvalidLayer { layer: String, reason: String },
    #[error("model has no layers to compile")]
    EmptyModel,
    #[error("model must be compiled before this operation")]
    NotCompiled,
}

/// Registry-level failures inside a parameter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot merge parameter '{name}': entries are different parameter kinds")]
    NamingCollision { name: String },
    #[error("parameter '{name}' shape mismatch: resolved {resolved:?}, requested {requested:?}")]
    ShapeMismatch {
        name: String,
        resolved: Vec<usize>,
        requested: Vec<usize>,
    },
    #[error("no constant named '{name}'; pass a value to create a new constant")]
    MissingConstantValue { name: String },
    #[error("parameter '{name}' already exists but is not a constant")]
    NotAConstant { name: String },
    #[error("parameter '{name}' has no materialized value")]
    NotMaterialized { name: String },
    #[error("parameter '{name}' has no resolved shape and does not allow deferred initialization")]
    UnresolvedShape { name: String },
}

/// Save/load failures. Load validates every name before mutating any parameter,
/// so a persistence error never leaves a store partially restored.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("parameter '{name}' is missing in file '{path}'")]
    MissingParameter { path: PathBuf, name: String },
    #[error("file '{path}' contains parameter '{name}' which is not present in the store")]
    UnexpectedParameter { path: PathBuf, name: String },
    #[error(
        "prefix '{prefix}' is to be stripped before saving, but parameter '{name}' \
         does not start with it"
    )]
    StripPrefixMismatch { prefix: String, name: String },
    #[error("restore prefix is '{prefix}' but parameter '{name}' does not start with it")]
    RestorePrefixMismatch { prefix: String, name: String },
}

/// Per-batch failures surfaced during the fit loop.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch {batch}: input shape {got:?} does not match compiled input shape {expected:?}")]
    Shape {
        batch: usize,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        value: f32,
        epoch: usize,
        batch: usize,
    },
}
