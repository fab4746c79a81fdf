//! GPU images with tracked layouts.
//!
//! Every [`Image`] remembers the layout its last recorded transition left it
//! in. Transitions are looked up in a fixed table of (old, new) pairs; an
//! unlisted pair is an error rather than a guessed barrier.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Access masks and pipeline stages of one layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Looks up the barrier parameters for `old -> new`.
///
/// # Errors
///
/// Returns [`RhiError::InvalidLayoutTransition`] for pairs outside the table.
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> RhiResult<TransitionMasks> {
    use vk::ImageLayout as L;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        },
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => TransitionMasks {
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        },
        (L::UNDEFINED, L::DEPTH_ATTACHMENT_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        },
        (from, to) => return Err(RhiError::InvalidLayoutTransition { from, to }),
    };

    Ok(masks)
}

/// Records a layout transition for any image, owned or not.
///
/// # Errors
///
/// Returns [`RhiError::InvalidLayoutTransition`] for unsupported pairs;
/// nothing is recorded in that case.
pub fn record_layout_transition(
    cmd: &CommandBuffer<'_>,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> RhiResult<()> {
    let masks = transition_masks(old, new)?;

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .level_count(1)
                .layer_count(1),
        );

    cmd.pipeline_barrier(masks.src_stage, masks.dst_stage, &[barrier]);
    Ok(())
}

/// 2D device image with one mip level, its view and its allocation.
pub struct Image {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
}

impl Image {
    /// Creates a device-local image in `UNDEFINED` layout.
    ///
    /// # Errors
    ///
    /// Returns an error if image creation, allocation or view creation fails.
    pub fn new(
        device: Arc<Device>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        name: &str,
    ) -> RhiResult<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = {
            let mut allocator = device.allocator().lock().unwrap();
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e.into());
            }
        };

        // SAFETY: `memory` is only used to bind this image below; the allocation outlives the image.
        let (memory, memory_offset) = (unsafe { allocation.memory() }, allocation.offset());
        let mut this = Self {
            device,
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            extent,
            format,
            aspect,
            layout: vk::ImageLayout::UNDEFINED,
        };

        // From here on Drop cleans up whatever was created.
        unsafe {
            this.device
                .handle()
                .bind_image_memory(this.image, memory, memory_offset)?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(this.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .level_count(1)
                    .layer_count(1),
            );
        this.view = unsafe { this.device.handle().create_image_view(&view_info, None)? };

        debug!(
            "Created image '{}': {}x{} {:?}",
            name, extent.width, extent.height, format
        );

        Ok(this)
    }

    /// Records a transition to `new_layout` and updates the tracked layout.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidLayoutTransition`] for unsupported pairs.
    pub fn transition_layout(
        &mut self,
        cmd: &CommandBuffer<'_>,
        new_layout: vk::ImageLayout,
    ) -> RhiResult<()> {
        record_layout_transition(cmd, self.image, self.aspect, self.layout, new_layout)?;
        self.layout = new_layout;
        Ok(())
    }

    /// Records a full-extent copy from a staging buffer at `offset`.
    ///
    /// # Panics
    ///
    /// Panics unless the tracked layout is `TRANSFER_DST_OPTIMAL` or `GENERAL`.
    pub fn copy_from_staging(
        &self,
        cmd: &CommandBuffer<'_>,
        staging: &Buffer,
        offset: vk::DeviceSize,
    ) {
        assert!(
            matches!(
                self.layout,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::GENERAL
            ),
            "image must be in TRANSFER_DST_OPTIMAL or GENERAL to receive a copy, found {:?}",
            self.layout
        );

        let region = vk::BufferImageCopy::default()
            .buffer_offset(offset)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(self.aspect)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            });

        cmd.copy_buffer_to_image(staging.handle(), self.image, self.layout, &[region]);
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Layout left by the last recorded transition.
    #[inline]
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.handle().destroy_image_view(self.view, None);
            }
        }

        if let Some(allocation) = self.allocation.take() {
            let mut allocator = self.device.allocator().lock().unwrap();
            if let Err(e) = allocator.free(allocation) {
                tracing::error!("Failed to free image allocation: {:?}", e);
            }
        }

        unsafe {
            self.device.handle().destroy_image(self.image, None);
        }

        debug!(
            "Destroyed image {}x{}",
            self.extent.width, self.extent.height
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_transitions() {
        let to_dst = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn test_attachment_transitions() {
        assert!(
            transition_masks(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            )
            .is_ok()
        );
        assert!(
            transition_masks(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR
            )
            .is_ok()
        );
        let depth = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn test_unsupported_transition_is_rejected() {
        let err = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RhiError::InvalidLayoutTransition {
                from: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                to: vk::ImageLayout::PRESENT_SRC_KHR,
            }
        ));
    }

    #[test]
    fn test_image_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Image>();
    }
}
