//! Core utilities for the lumen renderer.
//!
//! This crate provides foundational types shared by every other crate:
//! - Error types and result aliases
//! - Logging initialization
//! - Runtime configuration
//! - A generation-checked, reference-counted arena
//! - The on-disk key to blob store used for small preferences
//! - Frame timing

pub mod arena;
mod clock;
pub mod config;
mod error;
mod logging;
pub mod store;

pub use arena::{Arena, Handle};
pub use clock::FrameClock;
pub use config::RendererConfig;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use store::BlobStore;
