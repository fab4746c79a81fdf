//! Presentable image chain plus depth target.

use std::sync::Arc;

use ash::vk;
use tracing::info;

use lumen_rhi::context::DeviceContext;
use lumen_rhi::instance::Instance;
use lumen_rhi::surface::Surface;
use lumen_rhi::swapchain::Swapchain;
use lumen_rhi::{GpuDevice, RhiResult};

use crate::depth_buffer::DepthBuffer;
use crate::frame::PresentTarget;
use crate::present_pass::PresentAttachments;

/// Window surface, its swap chain and a matching depth buffer.
///
/// A chain that no longer fits the window surfaces as
/// [`RhiError::SurfaceOutOfDate`](lumen_rhi::RhiError::SurfaceOutOfDate) from
/// acquire or present; the driver then calls [`SwapSurface::rebuild`].
pub struct SwapSurface {
    context: Arc<DeviceContext>,
    // Field order is drop order: chain and depth before the surface.
    depth: DepthBuffer,
    swapchain: Swapchain,
    surface: Surface,
    frames_in_flight: usize,
}

impl SwapSurface {
    /// Creates the chain and depth buffer for a `width` x `height` window.
    ///
    /// # Errors
    ///
    /// Returns an error if swap chain or depth buffer creation fails.
    pub fn new(
        instance: &Instance,
        context: Arc<DeviceContext>,
        surface: Surface,
        width: u32,
        height: u32,
        frames_in_flight: usize,
    ) -> RhiResult<Self> {
        let swapchain = Swapchain::new(instance, context.device().clone(), &surface, width, height)?;
        let depth = DepthBuffer::with_default_format(&context, swapchain.extent())?;

        info!(
            "Swap surface ready: {} image(s), {} frame(s) in flight",
            swapchain.image_count(),
            frames_in_flight
        );

        Ok(Self {
            context,
            depth,
            swapchain,
            surface,
            frames_in_flight,
        })
    }

    /// Waits for the device to go idle, then recreates the chain and the
    /// depth buffer for the new window size.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait or either recreation fails.
    pub fn rebuild(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.context.wait_idle()?;
        self.swapchain.recreate(&self.surface, width, height)?;
        self.depth = DepthBuffer::with_default_format(&self.context, self.swapchain.extent())?;

        let extent = self.swapchain.extent();
        info!("Swap surface rebuilt at {}x{}", extent.width, extent.height);
        Ok(())
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    #[inline]
    pub fn image(&self, index: u32) -> vk::Image {
        self.swapchain.image(index as usize)
    }

    #[inline]
    pub fn image_view(&self, index: u32) -> vk::ImageView {
        self.swapchain.image_view(index as usize)
    }

    /// Attachments for drawing into chain image `index`.
    pub fn attachments(&self, index: u32) -> PresentAttachments {
        PresentAttachments {
            color_image: self.image(index),
            color_view: self.image_view(index),
            depth_view: self.depth.image_view(),
            extent: self.extent(),
        }
    }

    /// Attachments for every chain image, indexed by image index.
    pub fn all_attachments(&self) -> Vec<PresentAttachments> {
        (0..self.image_count()).map(|i| self.attachments(i)).collect()
    }

    #[inline]
    pub fn depth(&self) -> &DepthBuffer {
        &self.depth
    }

    /// Number of frames the ring presenting to this surface keeps in flight.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }
}

impl PresentTarget for SwapSurface {
    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> RhiResult<u32> {
        self.swapchain.acquire_next_image(image_available)
    }

    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> RhiResult<()> {
        self.swapchain
            .present(self.context.queue(), image_index, render_finished)
    }
}
