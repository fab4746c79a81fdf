//! Device abstraction used by the frame loop and the resource containers.
//!
//! [`GpuDevice`] is the narrow set of operations the frame state machine, the
//! staging transfer functions and the resource containers need from a device.
//! [`DeviceContext`](crate::context::DeviceContext) implements it on top of
//! Vulkan; [`HostDevice`](crate::host::HostDevice) implements it in host
//! memory so that synchronization order and buffer contents can be checked
//! without a GPU.
//!
//! Fences, semaphores and command buffers are passed around as raw `vk`
//! handles. They are plain integers, so the host backend can issue its own.

use ash::vk;

use crate::buffer::BufferUsage;
use crate::error::RhiResult;

/// Device limits the containers lay their buffers out against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Alignment of dynamic uniform buffer offsets.
    pub min_uniform_buffer_offset_alignment: u64,
    /// Alignment of storage buffer descriptor offsets.
    pub min_storage_buffer_offset_alignment: u64,
    /// Largest 2D image dimension.
    pub max_image_dimension_2d: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 16,
            max_image_dimension_2d: 16384,
        }
    }
}

impl DeviceLimits {
    /// Reads the limits that matter here from Vulkan device properties.
    pub fn from_vk(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            max_image_dimension_2d: limits.max_image_dimension2_d,
        }
    }
}

/// Rounds `size` up to a multiple of `alignment`.
///
/// An alignment of zero leaves `size` unchanged.
#[inline]
pub fn align_up(size: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return size;
    }
    size.div_ceil(alignment) * alignment
}

/// Access to a buffer's raw handle and size.
pub trait BufferHandle {
    /// Raw Vulkan handle.
    fn raw(&self) -> vk::Buffer;

    /// Size in bytes.
    fn size(&self) -> vk::DeviceSize;
}

/// One buffer descriptor write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// A single queue submission.
///
/// `wait_semaphores` and `wait_stages` are parallel lists.
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

impl<'a> Submission<'a> {
    /// A submission with no waits, no signals and no fence.
    pub fn commands_only(command_buffer: vk::CommandBuffer) -> Self {
        Self {
            command_buffer,
            wait_semaphores: &[],
            wait_stages: &[],
            signal_semaphores: &[],
            fence: vk::Fence::null(),
        }
    }
}

/// Device operations shared by the Vulkan context and the host backend.
///
/// All methods take `&self`; implementations synchronize internally where
/// they hold mutable state (the allocator, the host bookkeeping).
pub trait GpuDevice: Send + Sync {
    /// Device-local buffer used as a copy destination.
    type Buffer: BufferHandle + Send + Sync;
    /// Host-visible buffer used as a copy source.
    type Staging: BufferHandle + Send + Sync;

    /// Alignment and size limits.
    fn limits(&self) -> DeviceLimits;

    // =========================================================================
    // Memory
    // =========================================================================

    /// Creates a device-local buffer that can receive transfers.
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: BufferUsage,
        name: &str,
    ) -> RhiResult<Self::Buffer>;

    /// Creates a host-visible staging buffer.
    fn create_staging(&self, size: vk::DeviceSize, name: &str) -> RhiResult<Self::Staging>;

    /// Copies `bytes` into a staging buffer at `offset`.
    ///
    /// Safe to call from the decode worker thread.
    fn write_staging(
        &self,
        staging: &Self::Staging,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> RhiResult<()>;

    // =========================================================================
    // Command Recording
    // =========================================================================

    /// Allocates a primary command buffer from the shared pool.
    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer>;

    /// Returns a command buffer to the shared pool.
    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer);

    /// Begins recording.
    fn begin_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()>;

    /// Ends recording.
    fn end_commands(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    /// Resets a command buffer to the initial state.
    fn reset_commands(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    /// Records staging-to-buffer copies.
    fn record_buffer_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        src: &Self::Staging,
        dst: &Self::Buffer,
        regions: &[vk::BufferCopy],
    );

    // =========================================================================
    // Synchronization and Submission
    // =========================================================================

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Blocks until every fence is signaled.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> RhiResult<()>;

    /// Returns fences to the unsignaled state.
    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;

    /// Submits one batch on the shared queue.
    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()>;

    /// Blocks until the shared queue is idle.
    fn queue_wait_idle(&self) -> RhiResult<()>;

    /// Blocks until the whole device is idle.
    fn wait_idle(&self) -> RhiResult<()>;

    // =========================================================================
    // Descriptors
    // =========================================================================

    /// Creates a layout from `bindings` and allocates one set with it.
    fn create_descriptor_set(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSet>;

    /// Points buffer bindings of `set` at buffer ranges.
    fn write_buffer_bindings(&self, set: vk::DescriptorSet, bindings: &[BufferBinding]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up_exact_multiple() {
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(0, 64), 0);
    }

    #[test]
    fn test_align_up_rounds_up() {
        assert_eq!(align_up(4, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    fn test_align_up_zero_alignment() {
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn test_from_vk_limits() {
        let vk_limits = vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: 64,
            min_storage_buffer_offset_alignment: 32,
            max_image_dimension2_d: 8192,
            ..Default::default()
        };
        let limits = DeviceLimits::from_vk(&vk_limits);
        assert_eq!(limits.min_uniform_buffer_offset_alignment, 64);
        assert_eq!(limits.min_storage_buffer_offset_alignment, 32);
        assert_eq!(limits.max_image_dimension_2d, 8192);
    }

    #[test]
    fn test_commands_only_submission_is_empty() {
        let submission = Submission::commands_only(vk::CommandBuffer::null());
        assert!(submission.wait_semaphores.is_empty());
        assert!(submission.wait_stages.is_empty());
        assert!(submission.signal_semaphores.is_empty());
        assert_eq!(submission.fence, vk::Fence::null());
    }
}
