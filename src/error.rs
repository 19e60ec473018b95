//! Error types for Koopman ensemble training.
//!
//! No error in this crate is retried. A shape violation, a failed checkpoint
//! write or a backend failure aborts the member being trained and, through
//! `?`, the whole ensemble run.

use thiserror::Error;

/// Result type for Koopman training operations.
pub type KoopmanResult<T> = Result<T, KoopmanError>;

/// Errors that can occur while training or checkpointing Koopman models.
#[derive(Debug, Error)]
pub enum KoopmanError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Batch and model disagree on a dimension
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint could not be written, read or applied
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Safetensors encoding error
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// TOML config could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// TOML config could not be written
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),
}

impl KoopmanError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}
