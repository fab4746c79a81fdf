//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
///
/// Everything except [`RhiError::SurfaceOutOfDate`] is fatal for the current
/// session and is expected to propagate to the driver's outermost loop.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// The swap surface no longer matches the window and must be rebuilt.
    ///
    /// Raised for both acquisition and presentation, for out-of-date and
    /// suboptimal results alike.
    #[error("Swap surface is out of date")]
    SurfaceOutOfDate,

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A fixed-capacity container was asked to grow past its capacity
    #[error("Capacity exceeded: container holds at most {capacity} records")]
    CapacityExceeded { capacity: u32 },

    /// A partial update reached past the end of a container
    #[error("Range out of bounds: {offset} + {len} > capacity {capacity}")]
    RangeOutOfBounds { offset: u32, len: u32, capacity: u32 },

    /// An image layout transition with no known stage/access mapping
    #[error("Unsupported layout transition: {from:?} -> {to:?}")]
    InvalidLayoutTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
}

impl RhiError {
    /// Whether this is the recoverable surface staleness condition.
    #[inline]
    pub fn is_surface_out_of_date(&self) -> bool {
        matches!(self, RhiError::SurfaceOutOfDate)
    }

    /// Maps a swapchain result code, folding staleness into [`RhiError::SurfaceOutOfDate`].
    pub fn from_surface_result(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
                RhiError::SurfaceOutOfDate
            }
            other => RhiError::VulkanError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
