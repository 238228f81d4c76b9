//! Error types for model loading and inference.

use std::path::PathBuf;

use thiserror::Error;

use crate::gguf::GgmlType;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while parsing a container, materializing weights or driving a session.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Structural problem in the container header or metadata section.
    #[error("format error at byte {offset}: {reason}")]
    Format { offset: u64, reason: String },

    /// Wrong file signature.
    #[error("bad magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    /// Container version below the supported minimum.
    #[error("unsupported container version {found}, minimum is {minimum}")]
    UnsupportedVersion { found: u32, minimum: u32 },

    #[error("tensor '{name}' not found")]
    TensorNotFound { name: String },

    /// Declared tensor size does not fit the bytes available after its offset.
    #[error("tensor '{name}' at offset {offset} needs {needed} bytes, only {available} available")]
    TruncatedTensor { name: String, offset: u64, needed: u64, available: u64 },

    #[error("tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch { name: String, expected: Vec<u64>, actual: Vec<u64> },

    #[error("tensor '{name}' has unsupported element type {ty}")]
    UnsupportedType { name: String, ty: GgmlType },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation requires a loaded model.
    #[error("no model loaded")]
    NotLoaded,

    /// Session is in a state that does not allow the requested transition.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Caller-supplied buffer does not match the expected length.
    #[error("output buffer has length {actual}, expected {expected}")]
    OutputBuffer { expected: usize, actual: usize },

    /// Input vector or token outside the model's domain.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Failure reported by a token sink.
    #[error("token sink failed: {0}")]
    Sink(String),
}

impl ModelError {
    pub(crate) fn format(offset: u64, reason: impl Into<String>) -> Self {
        Self::Format { offset, reason: reason.into() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Whether this error concerns a tensor that may be skipped when optional.
    pub fn is_missing_tensor(&self) -> bool {
        matches!(self, Self::TensorNotFound { .. } | Self::TruncatedTensor { .. })
    }
}
