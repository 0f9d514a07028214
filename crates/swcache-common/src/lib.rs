//! # swcache common
//!
//! Shared error type and logging configuration for the swcache crates.
//!
//! ## Features
//!
//! - Unified error type for configuration and storage I/O
//! - Logging configuration and setup

use std::path::PathBuf;
use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for swcache configuration and storage.
#[derive(Error, Debug)]
pub enum SwCacheError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Persistent storage errors.
    #[error("Storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SwCacheError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error for a path.
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            SwCacheError::Config { .. } => "config",
            SwCacheError::Storage { .. } => "storage",
            SwCacheError::Io(_) => "io",
            SwCacheError::Json(_) => "json",
            SwCacheError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for swcache operations.
pub type Result<T> = std::result::Result<T, SwCacheError>;
