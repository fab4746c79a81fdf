//! Renderer error types.

use lumen_rhi::RhiError;
use thiserror::Error;

/// Errors raised by the renderer's own subsystems.
///
/// Device failures pass through unchanged as [`RenderError::Rhi`].
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// The OS refused to start the decode thread
    #[error("Failed to spawn decode worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A request was submitted after the worker was stopped
    #[error("Decode worker has stopped")]
    WorkerStopped,
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
