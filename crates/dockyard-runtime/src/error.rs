//! Error types for the runtime integration layer.

use thiserror::Error;

/// Errors that can occur while talking to a container engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Failed to spawn a subprocess.
    #[error("Failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    /// An engine probe did not complete successfully.
    #[error("Probe '{probe}' failed for {engine}: {message}")]
    Probe {
        engine: &'static str,
        probe: &'static str,
        message: String,
    },

    /// A background task was cancelled or panicked.
    #[error("Background task failed: {0}")]
    TaskJoin(String),
}
