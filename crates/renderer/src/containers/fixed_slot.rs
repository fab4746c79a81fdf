//! Append-only table of fixed-size records addressed by dynamic offset.

use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::{debug, trace};

use lumen_rhi::buffer::BufferUsage;
use lumen_rhi::descriptor::DescriptorBindingBuilder;
use lumen_rhi::transfer;
use lumen_rhi::{BufferBinding, BufferHandle, GpuDevice, RhiError, RhiResult, align_up};

/// `capacity` records of `T`, each at a multiple of the padded stride.
///
/// Records are appended in order and never removed. Each record lands at
/// `index * padded_stride`, where the stride is `size_of::<T>()` rounded up
/// to the device's dynamic uniform offset alignment, so any stored index can
/// be bound as a dynamic offset.
///
/// Appends go through a persistent staging buffer of one stride and block
/// until the copy has completed.
pub struct FixedSlotResource<T: Pod, D: GpuDevice> {
    device: Arc<D>,
    buffer: D::Buffer,
    staging: D::Staging,
    usage: BufferUsage,
    capacity: u32,
    stored: u32,
    padded_stride: u64,
    _marker: PhantomData<T>,
}

impl<T: Pod, D: GpuDevice> FixedSlotResource<T, D> {
    /// Creates an empty table.
    ///
    /// `usage` must be [`BufferUsage::Uniform`] or [`BufferUsage::Storage`]
    /// and decides the descriptor type of [`Self::descriptor_binding`].
    ///
    /// # Errors
    ///
    /// Returns an error if either buffer cannot be created, including for a
    /// zero capacity, or [`RhiError::CapacityExceeded`] if the last slot
    /// could not be reached by a `u32` dynamic offset.
    pub fn new(device: Arc<D>, capacity: u32, usage: BufferUsage, name: &str) -> RhiResult<Self> {
        debug_assert!(usage != BufferUsage::Staging, "staging is not a table usage");

        let padded_stride = Self::stride_for(&*device);
        let addressable = max_capacity(padded_stride);
        if capacity > addressable {
            return Err(RhiError::CapacityExceeded {
                capacity: addressable,
            });
        }
        let buffer = device.create_buffer(padded_stride * capacity as u64, usage, name)?;
        let staging = device.create_staging(padded_stride, name)?;

        debug!(
            "Created fixed-slot table '{}': {} x {} bytes (record {} bytes)",
            name,
            capacity,
            padded_stride,
            std::mem::size_of::<T>()
        );

        Ok(Self {
            device,
            buffer,
            staging,
            usage,
            capacity,
            stored: 0,
            padded_stride,
            _marker: PhantomData,
        })
    }

    /// Stride `device` would give records of `T`.
    pub fn stride_for(device: &D) -> u64 {
        align_up(
            std::mem::size_of::<T>() as u64,
            device.limits().min_uniform_buffer_offset_alignment,
        )
    }

    /// Writes `record` into the next free slot and returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::CapacityExceeded`] when the table is full, or the
    /// transfer error if the copy fails. The stored count only advances on
    /// success.
    pub fn append(&mut self, record: &T) -> RhiResult<u32> {
        if self.stored >= self.capacity {
            return Err(RhiError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let index = self.stored;
        let bytes = bytemuck::bytes_of(record);
        self.device.write_staging(&self.staging, 0, bytes)?;
        transfer::submit_copies_immediate(
            &*self.device,
            &self.staging,
            &self.buffer,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: self.offset_of(index),
                size: bytes.len() as u64,
            }],
        )?;

        self.stored += 1;
        trace!("Appended record {} of {}", index, self.capacity);
        Ok(index)
    }

    /// Byte offset of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= capacity`.
    #[inline]
    pub fn offset_of(&self, index: u32) -> u64 {
        assert!(
            index < self.capacity,
            "slot {} out of range for capacity {}",
            index,
            self.capacity
        );
        index as u64 * self.padded_stride
    }

    /// [`Self::offset_of`] in the form `vkCmdBindDescriptorSets` takes.
    ///
    /// # Panics
    ///
    /// Panics if `index >= capacity`.
    #[inline]
    pub fn dynamic_offset(&self, index: u32) -> u32 {
        let offset = self.offset_of(index);
        u32::try_from(offset).unwrap_or_else(|_| {
            panic!("slot {} offset {} does not fit a dynamic offset", index, offset)
        })
    }

    #[inline]
    pub fn padded_stride(&self) -> u64 {
        self.padded_stride
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of records appended so far.
    #[inline]
    pub fn len(&self) -> u32 {
        self.stored
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stored == 0
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    fn descriptor_type(&self) -> vk::DescriptorType {
        match self.usage {
            BufferUsage::Uniform => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            _ => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        }
    }

    /// Layout binding for one record addressed by a dynamic offset.
    pub fn descriptor_binding(
        &self,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        match self.usage {
            BufferUsage::Uniform => DescriptorBindingBuilder::uniform_buffer_dynamic(binding, stages),
            _ => DescriptorBindingBuilder::storage_buffer_dynamic(binding, stages),
        }
    }

    /// Descriptor write covering one record at offset zero.
    pub fn buffer_binding(&self, binding: u32) -> BufferBinding {
        BufferBinding {
            binding,
            descriptor_type: self.descriptor_type(),
            buffer: self.buffer.raw(),
            offset: 0,
            range: std::mem::size_of::<T>() as u64,
        }
    }
}

/// Largest capacity whose last slot offset still fits in a `u32`.
fn max_capacity(padded_stride: u64) -> u32 {
    let slots = u32::MAX as u64 / padded_stride.max(1) + 1;
    u32::try_from(slots).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use lumen_rhi::DeviceLimits;
    use lumen_rhi::host::{HostCall, HostDevice};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    struct Record {
        value: u32,
    }

    fn device_with_alignment(alignment: u64) -> Arc<HostDevice> {
        HostDevice::with_limits(DeviceLimits {
            min_uniform_buffer_offset_alignment: alignment,
            ..Default::default()
        })
    }

    #[test]
    fn test_padded_stride_rounds_up_to_alignment() {
        let device = device_with_alignment(256);
        let table: FixedSlotResource<Record, _> =
            FixedSlotResource::new(device, 4, BufferUsage::Uniform, "records").unwrap();

        assert_eq!(table.padded_stride(), 256);
        for i in 0..4 {
            assert_eq!(table.offset_of(i), i as u64 * 256);
            assert_eq!(table.offset_of(i) % 256, 0);
        }
        assert_eq!(table.buffer().size(), 1024);
    }

    #[test]
    fn test_dynamic_offsets_stay_within_u32() {
        assert_eq!(max_capacity(256), 16_777_216);
        assert_eq!(max_capacity(1), u32::MAX);
        assert_eq!(max_capacity(0), u32::MAX);
        assert!((max_capacity(64) as u64 - 1) * 64 <= u32::MAX as u64);
        assert!(max_capacity(64) as u64 * 64 > u32::MAX as u64);

        let device = device_with_alignment(256);
        let result: RhiResult<FixedSlotResource<Record, _>> =
            FixedSlotResource::new(device.clone(), u32::MAX, BufferUsage::Uniform, "huge");
        assert!(matches!(
            result,
            Err(RhiError::CapacityExceeded {
                capacity: 16_777_216
            })
        ));

        let table: FixedSlotResource<Record, _> =
            FixedSlotResource::new(device, 3, BufferUsage::Uniform, "records").unwrap();
        assert_eq!(table.dynamic_offset(2), 512);
    }

    #[test]
    fn test_appends_land_at_their_slot_offsets() {
        let device = device_with_alignment(256);
        let mut table =
            FixedSlotResource::new(device.clone(), 4, BufferUsage::Uniform, "records").unwrap();

        for value in [0xA, 0xB, 0xC] {
            table.append(&Record { value }).unwrap();
        }
        assert_eq!(table.len(), 3);

        let bytes = table.buffer().read();
        for (i, value) in [0xAu32, 0xB, 0xC].into_iter().enumerate() {
            let at = i * 256;
            assert_eq!(&bytes[at..at + 4], &value.to_le_bytes());
            assert!(bytes[at + 4..at + 256].iter().all(|&b| b == 0));
        }
        assert!(bytes[768..].iter().all(|&b| b == 0));

        // Each append waits for its own copy.
        let idle_waits = device
            .calls()
            .iter()
            .filter(|c| **c == HostCall::QueueWaitIdle)
            .count();
        assert_eq!(idle_waits, 3);
    }

    #[test]
    fn test_fifth_append_into_four_slots_fails() {
        let device = device_with_alignment(64);
        let mut table: FixedSlotResource<u32, _> =
            FixedSlotResource::new(device, 4, BufferUsage::Storage, "u32s").unwrap();

        for value in 0..4u32 {
            assert_eq!(table.append(&value).unwrap(), value);
        }
        assert_eq!(table.offset_of(3), 3 * table.padded_stride());

        let err = table.append(&4).unwrap_err();
        assert!(matches!(err, RhiError::CapacityExceeded { capacity: 4 }));
        assert_eq!(table.len(), 4);

        // Slot 0 still holds the first record.
        assert_eq!(&table.buffer().read()[..4], &0u32.to_le_bytes());
        assert_eq!(&table.buffer().read()[64..68], &1u32.to_le_bytes());
    }

    #[test]
    fn test_offset_is_valid_before_append() {
        let device = device_with_alignment(64);
        let table: FixedSlotResource<Record, _> =
            FixedSlotResource::new(device, 3, BufferUsage::Uniform, "records").unwrap();
        assert!(table.is_empty());
        assert_eq!(table.offset_of(2), 128);
        assert_eq!(table.dynamic_offset(2), 128);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_offset_past_capacity_panics() {
        let device = device_with_alignment(64);
        let table: FixedSlotResource<Record, _> =
            FixedSlotResource::new(device, 3, BufferUsage::Uniform, "records").unwrap();
        table.offset_of(3);
    }

    #[test]
    fn test_descriptor_type_follows_usage() {
        let device = device_with_alignment(64);
        let uniform: FixedSlotResource<Record, _> =
            FixedSlotResource::new(device.clone(), 1, BufferUsage::Uniform, "u").unwrap();
        let storage: FixedSlotResource<Record, _> =
            FixedSlotResource::new(device, 1, BufferUsage::Storage, "s").unwrap();

        let binding = uniform.descriptor_binding(2, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(binding.binding, 2);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(
            storage.buffer_binding(0).descriptor_type,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        );
        assert_eq!(uniform.buffer_binding(2).range, 4);
    }
}
