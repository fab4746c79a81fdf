//! Depth target of the swap surface.
//!
//! The depth image is sized to the swap chain, lives in GPU-only memory and
//! is moved to `DEPTH_ATTACHMENT_OPTIMAL` right after creation, so passes can
//! attach it without a barrier of their own.

use ash::vk;
use tracing::info;

use lumen_rhi::context::DeviceContext;
use lumen_rhi::image::Image;
use lumen_rhi::transfer;
use lumen_rhi::{RhiError, RhiResult};

/// Default depth buffer format (32-bit floating point).
pub const DEFAULT_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Depth image and view for depth testing.
pub struct DepthBuffer {
    image: Image,
}

impl DepthBuffer {
    /// Creates a depth buffer and transitions it for attachment use.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero extent, or if image creation or the layout
    /// transition fails.
    pub fn new(context: &DeviceContext, extent: vk::Extent2D, format: vk::Format) -> RhiResult<Self> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::InvalidHandle(
                "Depth buffer dimensions must be greater than 0".to_string(),
            ));
        }

        let mut image = Image::new(
            context.device().clone(),
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            "depth_buffer",
        )?;

        transfer::one_shot(context, |cmd| {
            image.transition_layout(
                &context.recorder(cmd),
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            )
        })?;

        info!(
            "Created depth buffer: {}x{} ({:?})",
            extent.width, extent.height, format
        );
        Ok(Self { image })
    }

    /// Creates a depth buffer with [`DEFAULT_DEPTH_FORMAT`].
    ///
    /// # Errors
    ///
    /// Returns an error if depth buffer creation fails.
    pub fn with_default_format(context: &DeviceContext, extent: vk::Extent2D) -> RhiResult<Self> {
        Self::new(context, extent, DEFAULT_DEPTH_FORMAT)
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image.handle()
    }

    #[inline]
    pub fn image_view(&self) -> vk::ImageView {
        self.image.view()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.image.format()
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    #[inline]
    pub fn layout(&self) -> vk::ImageLayout {
        self.image.layout()
    }
}
