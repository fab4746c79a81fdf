//! Descriptor pool, layouts and buffer writes.
//!
//! The device context owns one [`DescriptorPool`] sized for the handful of
//! per-frame sets the resource containers need. Layouts are created alongside
//! each set and kept by the context until teardown.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::backend::BufferBinding;
use crate::device::Device;
use crate::error::RhiResult;

/// Maximum number of sets the shared pool hands out.
pub const MAX_SETS: u32 = 16;

/// Descriptor counts of the shared pool, per type.
pub const POOL_SIZES: [(vk::DescriptorType, u32); 5] = [
    (vk::DescriptorType::UNIFORM_BUFFER, 10),
    (vk::DescriptorType::STORAGE_BUFFER, 10),
    (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 10),
    (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 10),
    (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 16),
];

/// Vulkan descriptor pool wrapper.
///
/// Created with `FREE_DESCRIPTOR_SET` and `UPDATE_AFTER_BIND`.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates the shared pool with [`MAX_SETS`] and [`POOL_SIZES`].
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = POOL_SIZES
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(MAX_SETS)
            .pool_sizes(&pool_sizes)
            .flags(
                vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
                    | vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
            );

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created descriptor pool: max_sets={}, pool_sizes={}",
            MAX_SETS,
            pool_sizes.len()
        );

        Ok(Self {
            device,
            pool,
            max_sets: MAX_SETS,
        })
    }

    /// Allocates one set with `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails (e.g., pool exhausted).
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };
        Ok(sets[0])
    }

    /// Returns the Vulkan descriptor pool handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Returns the maximum number of sets.
    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
        debug!("Destroyed descriptor pool");
    }
}

/// Creates a raw set layout; the caller owns and destroys it.
///
/// # Errors
///
/// Returns an error if layout creation fails.
pub fn create_set_layout(
    device: &Device,
    bindings: &[vk::DescriptorSetLayoutBinding<'_>],
) -> RhiResult<vk::DescriptorSetLayout> {
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
    let layout = unsafe {
        device
            .handle()
            .create_descriptor_set_layout(&create_info, None)?
    };
    debug!(
        "Created descriptor set layout with {} binding(s)",
        bindings.len()
    );
    Ok(layout)
}

/// Converts a [`BufferBinding`] into the Vulkan buffer info it writes.
pub fn buffer_info(binding: &BufferBinding) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(binding.buffer)
        .offset(binding.offset)
        .range(binding.range)
}

/// Writes buffer bindings into `set`.
pub fn write_buffer_bindings(device: &Device, set: vk::DescriptorSet, bindings: &[BufferBinding]) {
    if bindings.is_empty() {
        return;
    }

    let infos: Vec<[vk::DescriptorBufferInfo; 1]> =
        bindings.iter().map(|b| [buffer_info(b)]).collect();

    let writes: Vec<vk::WriteDescriptorSet<'_>> = bindings
        .iter()
        .zip(&infos)
        .map(|(binding, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding.binding)
                .dst_array_element(0)
                .descriptor_type(binding.descriptor_type)
                .buffer_info(info)
        })
        .collect();

    unsafe {
        device.handle().update_descriptor_sets(&writes, &[]);
    }
}

/// Helpers for building layout bindings.
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    fn single(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(descriptor_type)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }

    /// Storage buffer binding.
    pub fn storage_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::single(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    /// Uniform buffer binding addressed with a dynamic offset.
    pub fn uniform_buffer_dynamic(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::single(
            binding,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            stage_flags,
        )
    }

    /// Storage buffer binding addressed with a dynamic offset.
    pub fn storage_buffer_dynamic(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::single(
            binding,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            stage_flags,
        )
    }

    /// Combined image sampler binding.
    pub fn combined_image_sampler(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::single(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stage_flags,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_buffer_binding() {
        let binding = DescriptorBindingBuilder::storage_buffer(1, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(binding.binding, 1);
        assert_eq!(binding.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn test_dynamic_uniform_binding() {
        let binding = DescriptorBindingBuilder::uniform_buffer_dynamic(
            0,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert!(binding.stage_flags.contains(vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn test_dynamic_storage_binding() {
        let binding =
            DescriptorBindingBuilder::storage_buffer_dynamic(3, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(binding.binding, 3);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        );
    }

    #[test]
    fn test_buffer_info_from_binding() {
        let binding = BufferBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            buffer: vk::Buffer::null(),
            offset: 64,
            range: 128,
        };
        let info = buffer_info(&binding);
        assert_eq!(info.offset, 64);
        assert_eq!(info.range, 128);
    }

    #[test]
    fn test_pool_covers_container_descriptor_types() {
        let types: Vec<_> = POOL_SIZES.iter().map(|(ty, _)| *ty).collect();
        assert!(types.contains(&vk::DescriptorType::STORAGE_BUFFER));
        assert!(types.contains(&vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC));
        assert!(POOL_SIZES.iter().all(|(_, count)| *count > 0));
    }
}
