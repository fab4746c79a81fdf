//! Host-memory device backend.
//!
//! [`HostDevice`] implements [`GpuDevice`] without a GPU. Buffers are byte
//! vectors, recorded copies are applied when their command buffer is
//! submitted, and submission signals the fence immediately. Every
//! synchronization call is appended to a call log so tests can assert on
//! ordering, and [`HostDevice::mark`] lets test callbacks interleave their own
//! entries.
//!
//! Waiting on an unsignaled fence returns `VK_TIMEOUT` instead of blocking:
//! nothing else could ever signal it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use ash::vk::Handle;

use crate::backend::{BufferBinding, BufferHandle, DeviceLimits, GpuDevice, Submission};
use crate::buffer::BufferUsage;
use crate::error::{RhiError, RhiResult};

/// A buffer backed by host memory.
pub struct HostBuffer {
    handle: vk::Buffer,
    usage: BufferUsage,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Snapshot of the current contents.
    pub fn read(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl BufferHandle for HostBuffer {
    fn raw(&self) -> vk::Buffer {
        self.handle
    }

    fn size(&self) -> vk::DeviceSize {
        self.bytes.lock().unwrap().len() as vk::DeviceSize
    }
}

/// One logged device call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCall {
    WaitFences(Vec<vk::Fence>),
    ResetFences(Vec<vk::Fence>),
    BeginCommands(vk::CommandBuffer),
    EndCommands(vk::CommandBuffer),
    ResetCommands(vk::CommandBuffer),
    Submit {
        command_buffer: vk::CommandBuffer,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_stages: Vec<vk::PipelineStageFlags>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    QueueWaitIdle,
    WaitIdle,
    /// Entry added by [`HostDevice::mark`].
    Marker(&'static str),
}

struct PendingCopy {
    src: Arc<Mutex<Vec<u8>>>,
    dst: Arc<Mutex<Vec<u8>>>,
    region: vk::BufferCopy,
}

#[derive(Default)]
struct HostState {
    next_handle: u64,
    fences: HashMap<vk::Fence, bool>,
    semaphores: usize,
    command_buffers: HashMap<vk::CommandBuffer, Vec<PendingCopy>>,
    descriptor_sets: HashMap<vk::DescriptorSet, DescriptorRecord>,
    calls: Vec<HostCall>,
    fail_next_submit: bool,
}

impl HostState {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[derive(Default)]
struct DescriptorRecord {
    layout: Vec<(u32, vk::DescriptorType)>,
    writes: Vec<BufferBinding>,
}

/// Host-memory implementation of [`GpuDevice`].
pub struct HostDevice {
    limits: DeviceLimits,
    state: Mutex<HostState>,
}

impl HostDevice {
    /// Creates a backend with default limits.
    pub fn new() -> Arc<Self> {
        Self::with_limits(DeviceLimits::default())
    }

    /// Creates a backend reporting `limits`.
    pub fn with_limits(limits: DeviceLimits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            state: Mutex::new(HostState::default()),
        })
    }

    /// Appends a marker to the call log.
    pub fn mark(&self, label: &'static str) {
        self.state.lock().unwrap().calls.push(HostCall::Marker(label));
    }

    /// Copy of the call log.
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Makes the next submit fail with `VK_ERROR_DEVICE_LOST`, leaving its
    /// fence untouched.
    pub fn fail_next_submit(&self) {
        self.state.lock().unwrap().fail_next_submit = true;
    }

    /// Whether `fence` exists and is signaled.
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .unwrap()
            .fences
            .get(&fence)
            .copied()
            .unwrap_or(false)
    }

    /// Number of live fences.
    pub fn fence_count(&self) -> usize {
        self.state.lock().unwrap().fences.len()
    }

    /// Number of live semaphores.
    pub fn semaphore_count(&self) -> usize {
        self.state.lock().unwrap().semaphores
    }

    /// Number of allocated command buffers.
    pub fn command_buffer_count(&self) -> usize {
        self.state.lock().unwrap().command_buffers.len()
    }

    /// Layout bindings `set` was created with.
    pub fn descriptor_layout(&self, set: vk::DescriptorSet) -> Vec<(u32, vk::DescriptorType)> {
        self.state
            .lock()
            .unwrap()
            .descriptor_sets
            .get(&set)
            .map(|record| record.layout.clone())
            .unwrap_or_default()
    }

    /// Every buffer write made to `set`, in order.
    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<BufferBinding> {
        self.state
            .lock()
            .unwrap()
            .descriptor_sets
            .get(&set)
            .map(|record| record.writes.clone())
            .unwrap_or_default()
    }

    fn new_buffer(&self, size: vk::DeviceSize, usage: BufferUsage) -> RhiResult<HostBuffer> {
        if size == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }
        let raw = self.state.lock().unwrap().next_raw();
        Ok(HostBuffer {
            handle: vk::Buffer::from_raw(raw),
            usage,
            bytes: Arc::new(Mutex::new(vec![0u8; size as usize])),
        })
    }
}

impl GpuDevice for HostDevice {
    type Buffer = HostBuffer;
    type Staging = HostBuffer;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: BufferUsage,
        _name: &str,
    ) -> RhiResult<HostBuffer> {
        self.new_buffer(size, usage)
    }

    fn create_staging(&self, size: vk::DeviceSize, _name: &str) -> RhiResult<HostBuffer> {
        self.new_buffer(size, BufferUsage::Staging)
    }

    fn write_staging(
        &self,
        staging: &HostBuffer,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> RhiResult<()> {
        let mut dst = staging.bytes.lock().unwrap();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > dst.len() {
            return Err(RhiError::InvalidHandle(format!(
                "Write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                bytes.len(),
                dst.len()
            )));
        }
        dst[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.state.lock().unwrap();
        let command_buffer = vk::CommandBuffer::from_raw(state.next_raw());
        state.command_buffers.insert(command_buffer, Vec::new());
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.state
            .lock()
            .unwrap()
            .command_buffers
            .remove(&command_buffer);
    }

    fn begin_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(HostCall::BeginCommands(command_buffer));
        Ok(())
    }

    fn end_commands(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(HostCall::EndCommands(command_buffer));
        Ok(())
    }

    fn reset_commands(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = state.command_buffers.get_mut(&command_buffer) {
            pending.clear();
        }
        state.calls.push(HostCall::ResetCommands(command_buffer));
        Ok(())
    }

    fn record_buffer_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        src: &HostBuffer,
        dst: &HostBuffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock().unwrap();
        let pending = state.command_buffers.entry(command_buffer).or_default();
        pending.extend(regions.iter().map(|&region| PendingCopy {
            src: src.bytes.clone(),
            dst: dst.bytes.clone(),
            region,
        }));
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state.lock().unwrap();
        let fence = vk::Fence::from_raw(state.next_raw());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().unwrap().fences.remove(&fence);
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.state.lock().unwrap();
        state.semaphores += 1;
        Ok(vk::Semaphore::from_raw(state.next_raw()))
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        let mut state = self.state.lock().unwrap();
        state.semaphores = state.semaphores.saturating_sub(1);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> RhiResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(HostCall::WaitFences(fences.to_vec()));
        let all_signaled = fences
            .iter()
            .all(|fence| state.fences.get(fence).copied().unwrap_or(false));
        if all_signaled {
            Ok(())
        } else {
            Err(RhiError::VulkanError(vk::Result::TIMEOUT))
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.state.lock().unwrap();
        for fence in fences {
            if let Some(signaled) = state.fences.get_mut(fence) {
                *signaled = false;
            }
        }
        state.calls.push(HostCall::ResetFences(fences.to_vec()));
        Ok(())
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST));
        }

        let pending = state
            .command_buffers
            .get_mut(&submission.command_buffer)
            .map(std::mem::take)
            .unwrap_or_default();

        for copy in pending {
            let size = copy.region.size as usize;
            let src_start = copy.region.src_offset as usize;
            let dst_start = copy.region.dst_offset as usize;
            // Copied out first so src and dst may share storage.
            let bytes = copy.src.lock().unwrap()[src_start..src_start + size].to_vec();
            copy.dst.lock().unwrap()[dst_start..dst_start + size].copy_from_slice(&bytes);
        }

        if submission.fence != vk::Fence::null() {
            state.fences.insert(submission.fence, true);
        }

        state.calls.push(HostCall::Submit {
            command_buffer: submission.command_buffer,
            wait_semaphores: submission.wait_semaphores.to_vec(),
            wait_stages: submission.wait_stages.to_vec(),
            signal_semaphores: submission.signal_semaphores.to_vec(),
            fence: submission.fence,
        });
        Ok(())
    }

    fn queue_wait_idle(&self) -> RhiResult<()> {
        self.state.lock().unwrap().calls.push(HostCall::QueueWaitIdle);
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.state.lock().unwrap().calls.push(HostCall::WaitIdle);
        Ok(())
    }

    fn create_descriptor_set(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSet> {
        let mut state = self.state.lock().unwrap();
        let set = vk::DescriptorSet::from_raw(state.next_raw());
        let layout = bindings
            .iter()
            .map(|b| (b.binding, b.descriptor_type))
            .collect();
        state.descriptor_sets.insert(
            set,
            DescriptorRecord {
                layout,
                writes: Vec::new(),
            },
        );
        Ok(set)
    }

    fn write_buffer_bindings(&self, set: vk::DescriptorSet, bindings: &[BufferBinding]) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.descriptor_sets.get_mut(&set) {
            record.writes.extend_from_slice(bindings);
        }
    }
}
