//! Point light storage buffer.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use lumen_resources::PointLight;
use lumen_rhi::{GpuDevice, RhiResult};

use crate::containers::IndefiniteArrayResource;
use crate::gpu_types::{LightCount, PointLightInfo};

/// Light count header followed by the point lights added so far.
pub struct PointLightBuffer<D: GpuDevice> {
    lights: IndefiniteArrayResource<LightCount, PointLightInfo, D>,
    count: u32,
}

impl<D: GpuDevice> PointLightBuffer<D> {
    /// Creates an empty buffer with room for `capacity` lights.
    ///
    /// The count header is written immediately so shaders never read garbage.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be created or the header write
    /// fails.
    pub fn new(device: Arc<D>, capacity: u32) -> RhiResult<Self> {
        let mut lights = IndefiniteArrayResource::new(device, capacity, "point lights")?;
        lights.update_base(&LightCount::new(0))?;
        Ok(Self { lights, count: 0 })
    }

    /// Appends `lights` after the existing ones and updates the header.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RangeOutOfBounds`](lumen_rhi::RhiError::RangeOutOfBounds)
    /// if they do not fit; nothing is written in that case.
    pub fn add_lights(&mut self, lights: &[PointLight]) -> RhiResult<()> {
        let infos: Vec<PointLightInfo> = lights.iter().map(PointLightInfo::from).collect();
        let count = self.count + infos.len() as u32;

        self.lights
            .update_whole(&LightCount::new(count), &infos, self.count)?;
        self.count = count;

        debug!("Point light buffer holds {} light(s)", count);
        Ok(())
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Allocates a set with the header at binding 0 and the lights at 1.
    ///
    /// # Errors
    ///
    /// Returns an error if set allocation fails.
    pub fn create_descriptor_set(&self, stages: vk::ShaderStageFlags) -> RhiResult<vk::DescriptorSet> {
        self.lights.create_descriptor_set(stages)
    }

    pub fn resource(&self) -> &IndefiniteArrayResource<LightCount, PointLightInfo, D> {
        &self.lights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use lumen_rhi::RhiError;
    use lumen_rhi::host::HostDevice;

    fn light(x: f32) -> PointLight {
        PointLight {
            position: Vec3::new(x, 0.0, 0.0),
            color: Vec3::ONE,
            intensity: 1.0,
            radius: 5.0,
        }
    }

    fn read_count(buffer: &PointLightBuffer<HostDevice>) -> u32 {
        let bytes = buffer.resource().buffer().read();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_add_lights_appends_after_existing() {
        let device = HostDevice::new();
        let mut buffer = PointLightBuffer::new(device, 4).unwrap();

        buffer.add_lights(&[light(1.0)]).unwrap();
        buffer.add_lights(&[light(2.0), light(3.0)]).unwrap();

        assert_eq!(buffer.count(), 3);
        assert_eq!(read_count(&buffer), 3);

        let bytes = buffer.resource().buffer().read();
        let offset = buffer.resource().array_offset() as usize;
        let xs: Vec<f32> = bytes[offset..]
            .chunks_exact(std::mem::size_of::<PointLightInfo>())
            .take(3)
            .map(|chunk| bytemuck::pod_read_unaligned::<PointLightInfo>(chunk).position.x)
            .collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_overflowing_lights_keep_previous_count() {
        let device = HostDevice::new();
        let mut buffer = PointLightBuffer::new(device, 2).unwrap();
        buffer.add_lights(&[light(1.0)]).unwrap();

        let err = buffer.add_lights(&[light(2.0), light(3.0)]).unwrap_err();
        assert!(matches!(err, RhiError::RangeOutOfBounds { .. }));
        assert_eq!(buffer.count(), 1);
        assert_eq!(read_count(&buffer), 1);
    }
}
