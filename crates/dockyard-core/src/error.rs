//! Core domain errors.

use thiserror::Error;

/// Core domain errors for Dockyard.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration rejected before any process was started.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
