//! Vulkan device context.
//!
//! [`DeviceContext`] bundles the logical device (and through it the allocator
//! and the single queue) with the shared command and descriptor pools. It is
//! created once, wrapped in an `Arc` and handed to every subsystem that
//! touches the GPU.

use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::{debug, info};

use crate::backend::{BufferBinding, DeviceLimits, GpuDevice, Submission};
use crate::buffer::{Buffer, BufferUsage};
use crate::command::{CommandBuffer, CommandPool};
use crate::descriptor::{self, DescriptorPool};
use crate::device::Device;
use crate::error::RhiResult;
use crate::instance::Instance;
use crate::physical_device::PhysicalDeviceInfo;

/// Logical device plus the pools every subsystem shares.
pub struct DeviceContext {
    device: Arc<Device>,
    command_pool: Mutex<CommandPool>,
    descriptor_pool: Mutex<DescriptorPool>,
    /// Layouts of every set handed out; destroyed at teardown.
    set_layouts: Mutex<Vec<vk::DescriptorSetLayout>>,
}

impl DeviceContext {
    /// Creates the logical device and the shared pools.
    ///
    /// # Errors
    ///
    /// Returns an error if device, allocator or pool creation fails.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> RhiResult<Arc<Self>> {
        let device = Device::new(instance, physical_device_info)?;
        let command_pool = CommandPool::new(device.clone())?;
        let descriptor_pool = DescriptorPool::new(device.clone())?;

        info!(
            "Device context ready on '{}'",
            physical_device_info.device_name()
        );

        Ok(Arc::new(Self {
            device,
            command_pool: Mutex::new(command_pool),
            descriptor_pool: Mutex::new(descriptor_pool),
            set_layouts: Mutex::new(Vec::new()),
        }))
    }

    /// Returns the logical device.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns the shared queue.
    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.device.queue()
    }

    /// Wraps a raw command buffer for recording.
    #[inline]
    pub fn recorder(&self, command_buffer: vk::CommandBuffer) -> CommandBuffer<'_> {
        CommandBuffer::from_handle(&self.device, command_buffer)
    }
}

impl GpuDevice for DeviceContext {
    type Buffer = Buffer;
    type Staging = Buffer;

    fn limits(&self) -> DeviceLimits {
        self.device.limits()
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: BufferUsage,
        name: &str,
    ) -> RhiResult<Buffer> {
        Buffer::new(self.device.clone(), usage, size, name)
    }

    fn create_staging(&self, size: vk::DeviceSize, name: &str) -> RhiResult<Buffer> {
        Buffer::new(self.device.clone(), BufferUsage::Staging, size, name)
    }

    fn write_staging(
        &self,
        staging: &Buffer,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> RhiResult<()> {
        staging.write_data(offset, bytes)
    }

    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        self.command_pool.lock().unwrap().allocate()
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.command_pool.lock().unwrap().free(command_buffer);
    }

    fn begin_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        self.recorder(command_buffer).begin(flags)
    }

    fn end_commands(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.recorder(command_buffer).end()
    }

    fn reset_commands(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.recorder(command_buffer).reset()
    }

    fn record_buffer_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        src: &Buffer,
        dst: &Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.recorder(command_buffer)
            .copy_buffer(src.handle(), dst.handle(), regions);
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.handle().create_fence(&create_info, None)? };
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.handle().destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.handle().create_semaphore(&create_info, None)? };
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.handle().destroy_semaphore(semaphore, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> RhiResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe {
            self.device
                .handle()
                .wait_for_fences(fences, true, timeout_ns)?;
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe { self.device.handle().reset_fences(fences)? };
        Ok(())
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let command_buffers = [submission.command_buffer];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(submission.signal_semaphores);

        unsafe { self.device.submit(&[submit_info], submission.fence) }
    }

    fn queue_wait_idle(&self) -> RhiResult<()> {
        self.device.queue_wait_idle()
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }

    fn create_descriptor_set(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSet> {
        let layout = descriptor::create_set_layout(&self.device, bindings)?;

        let set = match self.descriptor_pool.lock().unwrap().allocate(layout) {
            Ok(set) => set,
            Err(e) => {
                unsafe {
                    self.device
                        .handle()
                        .destroy_descriptor_set_layout(layout, None);
                }
                return Err(e);
            }
        };

        self.set_layouts.lock().unwrap().push(layout);
        Ok(set)
    }

    fn write_buffer_bindings(&self, set: vk::DescriptorSet, bindings: &[BufferBinding]) {
        descriptor::write_buffer_bindings(&self.device, set, bindings);
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle during drop: {:?}", e);
        }

        let layouts = std::mem::take(&mut *self.set_layouts.lock().unwrap());
        for layout in &layouts {
            unsafe {
                self.device
                    .handle()
                    .destroy_descriptor_set_layout(*layout, None);
            }
        }
        debug!("Destroyed {} descriptor set layout(s)", layouts.len());
    }
}
