//! Error types for the cache and blend engines.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by cache engine, registry and blend operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Malformed mask, shape or length mismatch. Raised before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unrecognized tensor layout tag.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Registry reuse with a config or metadata that differs from the registered one.
    #[error("instance {instance_id} already exists with a different configuration or metadata")]
    ConfigMismatch { instance_id: String },

    /// Blend layers invoked out of order, or an operation on a closed engine.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
