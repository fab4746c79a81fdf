//! Material table.

use std::sync::Arc;

use ash::vk;
use tracing::info;

use lumen_resources::MaterialDesc;
use lumen_rhi::buffer::BufferUsage;
use lumen_rhi::{BufferBinding, GpuDevice, RhiResult};

use crate::containers::FixedSlotResource;
use crate::gpu_types::MaterialInfo;

/// One [`MaterialInfo`] per scene material, bound by dynamic offset.
pub struct MaterialTable<D: GpuDevice> {
    records: FixedSlotResource<MaterialInfo, D>,
}

impl<D: GpuDevice> MaterialTable<D> {
    /// Creates an empty table with room for `capacity` materials.
    ///
    /// # Errors
    ///
    /// Returns an error if the table buffers cannot be created.
    pub fn new(device: Arc<D>, capacity: u32) -> RhiResult<Self> {
        Ok(Self {
            records: FixedSlotResource::new(device, capacity, BufferUsage::Uniform, "materials")?,
        })
    }

    /// Appends one material and returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::CapacityExceeded`](lumen_rhi::RhiError::CapacityExceeded)
    /// when the table is full.
    pub fn push(&mut self, info: &MaterialInfo) -> RhiResult<u32> {
        self.records.append(info)
    }

    /// Appends every scene material, resolving texture ids with `texture_id`.
    ///
    /// `texture_id` is called with each material's base color,
    /// metallic-roughness and normal texture paths in turn.
    ///
    /// # Errors
    ///
    /// Stops at the first append that fails.
    pub fn extend_from_scene<F>(&mut self, materials: &[MaterialDesc], mut texture_id: F) -> RhiResult<()>
    where
        F: FnMut(Option<&std::path::Path>) -> Option<u32>,
    {
        for desc in materials {
            let textures = [
                texture_id(desc.base_color_texture.as_deref()),
                texture_id(desc.metallic_roughness_texture.as_deref()),
                texture_id(desc.normal_texture.as_deref()),
            ];
            self.push(&MaterialInfo::from_desc(desc, textures))?;
        }
        info!("Material table holds {} material(s)", self.records.len());
        Ok(())
    }

    /// Dynamic offset that selects material `index`.
    #[inline]
    pub fn dynamic_offset(&self, index: u32) -> u32 {
        self.records.dynamic_offset(index)
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn layout_binding(
        &self,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        self.records.descriptor_binding(binding, stages)
    }

    pub fn buffer_binding(&self, binding: u32) -> BufferBinding {
        self.records.buffer_binding(binding)
    }
}
