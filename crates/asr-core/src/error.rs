//! Error types for RustASR.

use thiserror::Error;

/// Main error type for ASR operations.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Invalid construction parameters (layer/head counts, widths, dropout, vocabulary).
    #[error("Config error: {0}")]
    Config(String),

    /// A tensor whose rank or per-dimension size violates the model contract.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A padding reference row whose PAD positions are not a right-aligned suffix.
    #[error("Padding invariant violated: {0}")]
    PaddingInvariant(String),

    /// Model loading and bookkeeping errors.
    #[error("Model error: {0}")]
    Model(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AsrError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }
}

/// Result type alias for ASR operations.
pub type AsrResult<T> = Result<T, AsrError>;
