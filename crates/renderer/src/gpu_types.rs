//! GPU-side record layouts.
//!
//! These structures are copied byte for byte into uniform and storage
//! buffers, so they use `#[repr(C)]`, carry no implicit padding and derive
//! `Pod`/`Zeroable` for safe byte casting.

use bytemuck::{Pod, Zeroable};
use glam::{UVec4, Vec3, Vec4};

use lumen_resources::{DirectionalLight, MaterialDesc, PointLight};

/// Texture slot value meaning "no texture, use the factor".
pub const NO_TEXTURE: u32 = u32::MAX;

/// One material record in the material table.
///
/// # Memory Layout
///
/// - Offset 0: base color factor (16 bytes)
/// - Offset 16: metallic, roughness, unused, unused (16 bytes)
/// - Offset 32: emissive rgb, unused (16 bytes)
/// - Offset 48: base color, metallic-roughness, normal texture ids, unused (16 bytes)
/// - Total size: 64 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialInfo {
    pub base_color: Vec4,
    pub metallic_roughness: Vec4,
    pub emissive: Vec4,
    pub textures: UVec4,
}

impl MaterialInfo {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Builds a record from a scene material and its texture ids.
    ///
    /// Texture ids that are `None` become [`NO_TEXTURE`].
    pub fn from_desc(desc: &MaterialDesc, textures: [Option<u32>; 3]) -> Self {
        let [base_color, metallic_roughness, normal] = textures.map(|t| t.unwrap_or(NO_TEXTURE));
        Self {
            base_color: desc.base_color,
            metallic_roughness: Vec4::new(desc.metallic, desc.roughness, 0.0, 0.0),
            emissive: desc.emissive.extend(0.0),
            textures: UVec4::new(base_color, metallic_roughness, normal, NO_TEXTURE),
        }
    }
}

/// One point light in the light array.
///
/// # Memory Layout
///
/// - Offset 0: color (12 bytes), intensity (4 bytes)
/// - Offset 16: position (12 bytes), radius (4 bytes)
/// - Total size: 32 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightInfo {
    pub color: Vec3,
    pub intensity: f32,
    pub position: Vec3,
    pub radius: f32,
}

impl From<&PointLight> for PointLightInfo {
    fn from(light: &PointLight) -> Self {
        Self {
            color: light.color,
            intensity: light.intensity,
            position: light.position,
            radius: light.radius,
        }
    }
}

/// Header in front of the light array.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LightCount {
    pub count: u32,
    pub _padding: [u32; 3],
}

impl LightCount {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            _padding: [0; 3],
        }
    }
}

/// The scene's single directional light.
///
/// # Memory Layout
///
/// - Offset 0: direction (12 bytes), intensity (4 bytes)
/// - Offset 16: color (12 bytes), padding (4 bytes)
/// - Total size: 32 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DirectionalLightInfo {
    pub direction: Vec3,
    pub intensity: f32,
    pub color: Vec3,
    pub _padding: f32,
}

impl From<&DirectionalLight> for DirectionalLightInfo {
    fn from(light: &DirectionalLight) -> Self {
        Self {
            direction: light.direction,
            intensity: light.intensity,
            color: light.color,
            _padding: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_info_size() {
        // 4 x 16-byte vectors
        assert_eq!(MaterialInfo::SIZE, 64);
    }

    #[test]
    fn test_light_record_sizes() {
        assert_eq!(std::mem::size_of::<PointLightInfo>(), 32);
        assert_eq!(std::mem::size_of::<LightCount>(), 16);
        assert_eq!(std::mem::size_of::<DirectionalLightInfo>(), 32);
    }

    #[test]
    fn test_material_from_desc_marks_missing_textures() {
        let desc = MaterialDesc {
            metallic: 0.25,
            roughness: 0.75,
            ..Default::default()
        };
        let info = MaterialInfo::from_desc(&desc, [Some(3), None, None]);

        assert_eq!(info.base_color, Vec4::ONE);
        assert_eq!(info.metallic_roughness.x, 0.25);
        assert_eq!(info.metallic_roughness.y, 0.75);
        assert_eq!(info.textures, UVec4::new(3, NO_TEXTURE, NO_TEXTURE, NO_TEXTURE));
    }

    #[test]
    fn test_point_light_bytes_follow_field_order() {
        let info = PointLightInfo {
            color: Vec3::new(1.0, 2.0, 3.0),
            intensity: 4.0,
            position: Vec3::new(5.0, 6.0, 7.0),
            radius: 8.0,
        };
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&info));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }
}
