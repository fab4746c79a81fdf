//! Error types for scene import and image decoding.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for resource loading operations.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// The scene file exists but could not be imported.
    #[error("Failed to load scene '{path}': {message}")]
    SceneLoad {
        /// Path to the file that failed to load.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Image decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// A decode request the decoder cannot satisfy.
    #[error("Decode error: {0}")]
    Decode(String),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;
