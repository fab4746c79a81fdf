//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate wraps `ash` and `gpu-allocator` with just enough structure for
//! the frame loop and the resource containers:
//! - Instance, physical device selection and the device context
//! - The [`GpuDevice`] seam, with a Vulkan and a host-memory backend
//! - Buffers, images with tracked layouts and staging transfers
//! - Command and descriptor pools
//! - Surface and swapchain, with staleness folded into one error

mod error;

pub mod backend;
pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod host;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod surface;
pub mod swapchain;
pub mod transfer;

pub use backend::{BufferBinding, BufferHandle, DeviceLimits, GpuDevice, Submission, align_up};
pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
