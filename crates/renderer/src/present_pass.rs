//! Recording of the pass that draws into a swap chain image.
//!
//! The pass takes the acquired image from `UNDEFINED` to color attachment,
//! clears it together with the depth buffer, lets the caller draw scene
//! geometry, gives an [`OverlayRecorder`] the chance to draw on top, and
//! finally moves the image to `PRESENT_SRC_KHR`.

use ash::vk;

use lumen_rhi::RhiResult;
use lumen_rhi::command::CommandBuffer;
use lumen_rhi::image::record_layout_transition;

/// Handles of everything one present pass draws into.
#[derive(Debug, Clone, Copy)]
pub struct PresentAttachments {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth_view: vk::ImageView,
    pub extent: vk::Extent2D,
}

/// Default clear color (dark blue-gray).
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.15, 1.0];

/// Something drawn after scene geometry inside the same rendering scope,
/// such as a debug UI.
pub trait OverlayRecorder {
    /// Records overlay draws. Dynamic rendering is active on `cmd`.
    fn record_overlay(&mut self, cmd: &CommandBuffer<'_>, extent: vk::Extent2D) -> RhiResult<()>;
}

/// Clear values and attachment setup for the present pass.
#[derive(Debug, Clone, Copy)]
pub struct PresentPass {
    clear_color: [f32; 4],
    clear_depth: f32,
}

impl Default for PresentPass {
    fn default() -> Self {
        Self {
            clear_color: DEFAULT_CLEAR_COLOR,
            clear_depth: 1.0,
        }
    }
}

impl PresentPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    #[inline]
    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    /// Records the whole pass into the open `cmd`.
    ///
    /// `geometry` runs right after viewport and scissor are set; the overlay,
    /// if any, runs after it.
    ///
    /// # Errors
    ///
    /// Returns the first error from `geometry` or the overlay.
    pub fn record<G>(
        &self,
        cmd: &CommandBuffer<'_>,
        target: &PresentAttachments,
        geometry: G,
        overlay: Option<&mut dyn OverlayRecorder>,
    ) -> RhiResult<()>
    where
        G: FnOnce(&CommandBuffer<'_>) -> RhiResult<()>,
    {
        let extent = target.extent;
        let color_image = target.color_image;

        record_layout_transition(
            cmd,
            color_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )?;

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            });

        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.depth_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.clear_depth,
                    stencil: 0,
                },
            });

        let rendering_info = vk::RenderingInfo::default()
            .render_area(full_rect(extent))
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment);

        cmd.begin_rendering(&rendering_info);
        cmd.set_viewport(&full_viewport(extent));
        cmd.set_scissor(&full_rect(extent));

        let drawn = geometry(cmd).and_then(|()| match overlay {
            Some(overlay) => overlay.record_overlay(cmd, extent),
            None => Ok(()),
        });

        // Close the rendering scope even on failure so the buffer stays valid
        // for reset.
        cmd.end_rendering();
        drawn?;

        record_layout_transition(
            cmd,
            color_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
    }
}

fn full_rect(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_covers_extent() {
        let viewport = full_viewport(vk::Extent2D {
            width: 1280,
            height: 720,
        });
        assert_eq!(viewport.width, 1280.0);
        assert_eq!(viewport.height, 720.0);
        assert_eq!(viewport.max_depth, 1.0);
    }

    #[test]
    fn test_scissor_starts_at_origin() {
        let rect = full_rect(vk::Extent2D {
            width: 64,
            height: 32,
        });
        assert_eq!(rect.offset.x, 0);
        assert_eq!(rect.offset.y, 0);
        assert_eq!(rect.extent.width, 64);
    }

    #[test]
    fn test_clear_color_override() {
        let pass = PresentPass::new().with_clear_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(pass.clear_color(), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(PresentPass::default().clear_color(), DEFAULT_CLEAR_COLOR);
    }
}
