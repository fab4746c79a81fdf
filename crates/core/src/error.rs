//! Error types shared across the renderer.

use thiserror::Error;

/// Main error type for the renderer's utility layer.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// A blob store key that cannot be mapped to a file name
    #[error("Invalid store key: {0:?}")]
    InvalidKey(String),

    /// An arena handle whose slot was already released or reused
    #[error("Stale handle: slot {index} generation {generation}")]
    StaleHandle { index: u32, generation: u32 },
}

/// Result type alias using the renderer's Error type.
pub type Result<T> = std::result::Result<T, Error>;
