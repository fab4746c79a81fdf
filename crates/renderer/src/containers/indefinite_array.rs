//! A base record followed by a fixed-capacity array, in one storage buffer.

use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::{debug, trace};

use lumen_rhi::buffer::BufferUsage;
use lumen_rhi::descriptor::DescriptorBindingBuilder;
use lumen_rhi::transfer;
use lumen_rhi::{BufferBinding, BufferHandle, GpuDevice, RhiError, RhiResult, align_up};

/// One storage buffer laid out as `Base`, padding, then `capacity` items.
///
/// The array starts at `size_of::<Base>()` rounded up to the storage offset
/// alignment, so both halves can be bound as separate storage buffers. With
/// `Base = ()` the buffer holds only the array and it is bound at binding 0.
///
/// Updates run through the staging primitive and have completed on the GPU
/// when they return. Slots outside an updated range are never written.
pub struct IndefiniteArrayResource<Base: Pod, Item: Pod, D: GpuDevice> {
    device: Arc<D>,
    buffer: D::Buffer,
    capacity: u32,
    array_offset: u64,
    _marker: PhantomData<(Base, Item)>,
}

impl<Base: Pod, Item: Pod, D: GpuDevice> IndefiniteArrayResource<Base, Item, D> {
    const BASE_SIZE: u64 = std::mem::size_of::<Base>() as u64;
    const ITEM_SIZE: u64 = std::mem::size_of::<Item>() as u64;

    /// Creates a zero-filled container for `capacity` items.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be created.
    pub fn new(device: Arc<D>, capacity: u32, name: &str) -> RhiResult<Self> {
        let array_offset = align_up(
            Self::BASE_SIZE,
            device.limits().min_storage_buffer_offset_alignment,
        );
        let size = array_offset + Self::ITEM_SIZE * capacity as u64;
        let buffer = device.create_buffer(size, BufferUsage::Storage, name)?;

        debug!(
            "Created array '{}': base {} bytes, {} x {} bytes at offset {}",
            name,
            Self::BASE_SIZE,
            capacity,
            Self::ITEM_SIZE,
            array_offset
        );

        Ok(Self {
            device,
            buffer,
            capacity,
            array_offset,
            _marker: PhantomData,
        })
    }

    /// Writes the base record. A no-op for array-only containers.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails.
    pub fn update_base(&mut self, base: &Base) -> RhiResult<()> {
        if !self.has_base() {
            return Ok(());
        }
        transfer::copy_immediate(&*self.device, bytemuck::bytes_of(base), &self.buffer, 0)
    }

    /// Writes `items` into slots `dest_index..dest_index + items.len()`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RangeOutOfBounds`] if the range reaches past the
    /// capacity, or the transfer error if the copy fails.
    pub fn update_range(&mut self, items: &[Item], dest_index: u32) -> RhiResult<()> {
        self.check_range(items.len(), dest_index)?;
        if items.is_empty() {
            return Ok(());
        }

        transfer::copy_immediate(
            &*self.device,
            bytemuck::cast_slice(items),
            &self.buffer,
            self.item_offset(dest_index),
        )?;
        trace!("Updated slots {}..{}", dest_index, dest_index as usize + items.len());
        Ok(())
    }

    /// Writes the base and a range of items with one staging buffer and one
    /// submission.
    ///
    /// # Errors
    ///
    /// Same as [`Self::update_range`].
    pub fn update_whole(&mut self, base: &Base, items: &[Item], dest_index: u32) -> RhiResult<()> {
        self.check_range(items.len(), dest_index)?;

        let base_bytes = bytemuck::bytes_of(base);
        let item_bytes: &[u8] = bytemuck::cast_slice(items);
        let total = (base_bytes.len() + item_bytes.len()) as u64;
        if total == 0 {
            return Ok(());
        }

        let staging = self.device.create_staging(total, "array update staging")?;
        let mut regions = Vec::with_capacity(2);
        if !base_bytes.is_empty() {
            self.device.write_staging(&staging, 0, base_bytes)?;
            regions.push(vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: Self::BASE_SIZE,
            });
        }
        if !item_bytes.is_empty() {
            self.device
                .write_staging(&staging, Self::BASE_SIZE, item_bytes)?;
            regions.push(vk::BufferCopy {
                src_offset: Self::BASE_SIZE,
                dst_offset: self.item_offset(dest_index),
                size: item_bytes.len() as u64,
            });
        }

        transfer::submit_copies_immediate(&*self.device, &staging, &self.buffer, &regions)
    }

    fn check_range(&self, len: usize, dest_index: u32) -> RhiResult<()> {
        let out_of_bounds = RhiError::RangeOutOfBounds {
            offset: dest_index,
            len: u32::try_from(len).unwrap_or(u32::MAX),
            capacity: self.capacity,
        };
        let Ok(len) = u32::try_from(len) else {
            return Err(out_of_bounds);
        };
        if dest_index as u64 + len as u64 > self.capacity as u64 {
            return Err(out_of_bounds);
        }
        Ok(())
    }

    #[inline]
    fn item_offset(&self, index: u32) -> u64 {
        self.array_offset + index as u64 * Self::ITEM_SIZE
    }

    /// Whether the container has a non-empty base record.
    #[inline]
    pub fn has_base(&self) -> bool {
        Self::BASE_SIZE > 0
    }

    /// Byte offset of the first item.
    #[inline]
    pub fn array_offset(&self) -> u64 {
        self.array_offset
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    /// Descriptor writes for the base and the array, in binding order.
    ///
    /// The base is binding 0 and the array binding 1; an array-only
    /// container has just the array, at binding 0.
    pub fn create_descriptor_bindings(&self) -> Vec<BufferBinding> {
        let mut bindings = Vec::with_capacity(2);
        if self.has_base() {
            bindings.push(BufferBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                buffer: self.buffer.raw(),
                offset: 0,
                range: Self::BASE_SIZE,
            });
        }
        bindings.push(BufferBinding {
            binding: bindings.len() as u32,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            buffer: self.buffer.raw(),
            offset: self.array_offset,
            range: Self::ITEM_SIZE * self.capacity as u64,
        });
        bindings
    }

    /// Layout bindings matching [`Self::create_descriptor_bindings`].
    pub fn layout_bindings(
        &self,
        stages: vk::ShaderStageFlags,
    ) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.create_descriptor_bindings()
            .iter()
            .map(|b| DescriptorBindingBuilder::storage_buffer(b.binding, stages))
            .collect()
    }

    /// Allocates a descriptor set with both bindings written.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation or set allocation fails.
    pub fn create_descriptor_set(
        &self,
        stages: vk::ShaderStageFlags,
    ) -> RhiResult<vk::DescriptorSet> {
        let set = self.device.create_descriptor_set(&self.layout_bindings(stages))?;
        self.device
            .write_buffer_bindings(set, &self.create_descriptor_bindings());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_rhi::DeviceLimits;
    use lumen_rhi::host::{HostCall, HostDevice};

    type Words = IndefiniteArrayResource<u32, u32, HostDevice>;

    fn device_with_storage_alignment(alignment: u64) -> Arc<HostDevice> {
        HostDevice::with_limits(DeviceLimits {
            min_storage_buffer_offset_alignment: alignment,
            ..Default::default()
        })
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_range_then_base_reads_back() {
        let device = device_with_storage_alignment(4);
        let mut array = Words::new(device, 10, "words").unwrap();
        assert_eq!(array.array_offset(), 4);

        array.update_range(&[10, 20, 30], 2).unwrap();
        array.update_base(&42).unwrap();

        let contents = words(&array.buffer().read());
        assert_eq!(contents[0], 42);
        assert_eq!(&contents[1..], &[0, 0, 10, 20, 30, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_disjoint_ranges_leave_other_slots_untouched() {
        let device = device_with_storage_alignment(16);
        let mut array = Words::new(device, 16, "words").unwrap();
        let fill: Vec<u32> = (100..116).collect();
        array.update_range(&fill, 0).unwrap();
        let before = array.buffer().read();

        array.update_range(&[1, 2, 3], 2).unwrap();
        array.update_range(&[7, 8], 9).unwrap();

        let after = array.buffer().read();
        let offset = array.array_offset() as usize;
        for slot in 0..16usize {
            let at = offset + slot * 4;
            if (2..5).contains(&slot) || (9..11).contains(&slot) {
                continue;
            }
            assert_eq!(after[at..at + 4], before[at..at + 4], "slot {} changed", slot);
        }
        let items = words(&after[offset..]);
        assert_eq!(&items[2..5], &[1, 2, 3]);
        assert_eq!(&items[9..11], &[7, 8]);
        // The base sits before the alignment padding and is untouched too.
        assert_eq!(after[..offset], before[..offset]);
    }

    #[test]
    fn test_range_past_capacity_is_rejected() {
        let device = HostDevice::new();
        let mut array = Words::new(device.clone(), 4, "words").unwrap();

        let err = array.update_range(&[1, 2], 3).unwrap_err();
        assert!(matches!(
            err,
            RhiError::RangeOutOfBounds {
                offset: 3,
                len: 2,
                capacity: 4
            }
        ));
        assert!(device.calls().is_empty());

        // A range ending exactly at capacity is fine.
        array.update_range(&[1], 3).unwrap();
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_range_longer_than_u32_is_rejected() {
        let device = HostDevice::new();
        let mut markers: IndefiniteArrayResource<u32, (), HostDevice> =
            IndefiniteArrayResource::new(device.clone(), 4, "markers").unwrap();
        let items = vec![(); u32::MAX as usize + 1];

        let err = markers.update_range(&items, 0).unwrap_err();
        assert!(matches!(
            err,
            RhiError::RangeOutOfBounds {
                offset: 0,
                len: u32::MAX,
                capacity: 4
            }
        ));
        let err = markers.update_whole(&7, &items, 0).unwrap_err();
        assert!(matches!(err, RhiError::RangeOutOfBounds { len: u32::MAX, .. }));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_update_whole_uses_one_submission() {
        let device = device_with_storage_alignment(16);
        let mut array = Words::new(device.clone(), 4, "words").unwrap();

        array.update_whole(&2, &[5, 6], 1).unwrap();

        let submits = device
            .calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Submit { .. }))
            .count();
        assert_eq!(submits, 1);
        let contents = words(&array.buffer().read());
        assert_eq!(contents[0], 2);
        assert_eq!(&contents[4..], &[0, 5, 6, 0]);
    }

    #[test]
    fn test_update_whole_with_no_items_writes_base_only() {
        let device = device_with_storage_alignment(4);
        let mut array = Words::new(device, 2, "words").unwrap();
        array.update_whole(&9, &[], 0).unwrap();
        assert_eq!(words(&array.buffer().read()), vec![9, 0, 0]);
    }

    #[test]
    fn test_descriptor_bindings_split_base_and_array() {
        let device = device_with_storage_alignment(16);
        let array = Words::new(device.clone(), 10, "words").unwrap();

        let bindings = array.create_descriptor_bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!((bindings[0].binding, bindings[0].offset, bindings[0].range), (0, 0, 4));
        assert_eq!((bindings[1].binding, bindings[1].offset, bindings[1].range), (1, 16, 40));

        let set = array
            .create_descriptor_set(vk::ShaderStageFlags::FRAGMENT)
            .unwrap();
        assert_eq!(
            device.descriptor_layout(set),
            vec![
                (0, vk::DescriptorType::STORAGE_BUFFER),
                (1, vk::DescriptorType::STORAGE_BUFFER)
            ]
        );
        assert_eq!(device.descriptor_writes(set), bindings);
    }

    #[test]
    fn test_array_only_container_binds_array_at_zero() {
        let device = device_with_storage_alignment(16);
        let mut array: IndefiniteArrayResource<(), u32, _> =
            IndefiniteArrayResource::new(device, 3, "array only").unwrap();
        assert!(!array.has_base());
        assert_eq!(array.array_offset(), 0);

        array.update_base(&()).unwrap();
        array.update_range(&[4, 5, 6], 0).unwrap();
        assert_eq!(words(&array.buffer().read()), vec![4, 5, 6]);

        let bindings = array.create_descriptor_bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!((bindings[0].binding, bindings[0].offset, bindings[0].range), (0, 0, 12));
    }
}
