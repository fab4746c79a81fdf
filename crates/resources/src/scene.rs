//! glTF scene import.
//!
//! [`load_scene`] flattens the default scene of a `.gltf`/`.glb` file into
//! meshes (one per primitive, with their world transform), materials with
//! resolved texture paths, point lights and at most one directional light
//! from `KHR_lights_punctual`. Textures are only located here; decoding
//! happens later on the decode worker.

use std::path::{Path, PathBuf};

use glam::{Mat4, Vec3, Vec4};
use gltf::khr_lights_punctual::Kind;
use tracing::{debug, info, warn};

use crate::error::{ResourceError, ResourceResult};

/// Radius given to point lights that declare no range.
pub const DEFAULT_LIGHT_RADIUS: f32 = 10.0;

/// Geometry of one primitive.
#[derive(Debug, Default, Clone)]
pub struct MeshData {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tex_coords: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    /// Index into [`SceneDescription::materials`].
    pub material: Option<usize>,
    /// Node-to-world transform.
    pub transform: Mat4,
}

/// Metallic-roughness material.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDesc {
    pub name: String,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub emissive: Vec3,
    pub base_color_texture: Option<PathBuf>,
    pub metallic_roughness_texture: Option<PathBuf>,
    pub normal_texture: Option<PathBuf>,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: Vec4::ONE,
            metallic: 1.0,
            roughness: 1.0,
            emissive: Vec3::ZERO,
            base_color_texture: None,
            metallic_roughness_texture: None,
            normal_texture: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels in, normalized.
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

/// Everything the renderer needs from a scene file.
#[derive(Debug, Default, Clone)]
pub struct SceneDescription {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<MaterialDesc>,
    pub point_lights: Vec<PointLight>,
    pub directional_light: Option<DirectionalLight>,
}

impl SceneDescription {
    /// Total vertex count over all meshes.
    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(|m| m.positions.len()).sum()
    }
}

/// Imports the default scene (or the first one) of a glTF file.
///
/// # Errors
///
/// Returns [`ResourceError::FileNotFound`] when `path` does not exist and
/// [`ResourceError::SceneLoad`] when parsing, buffer loading or geometry
/// extraction fails.
pub fn load_scene(path: &Path) -> ResourceResult<SceneDescription> {
    if !path.exists() {
        return Err(ResourceError::FileNotFound(path.to_path_buf()));
    }

    let gltf = gltf::Gltf::open(path).map_err(|e| scene_error(path, e))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let buffers = gltf::import_buffers(&gltf.document, Some(base), gltf.blob.clone())
        .map_err(|e| scene_error(path, e))?;

    let document = &gltf.document;
    let materials = document
        .materials()
        .map(|m| read_material(&m, base))
        .collect();

    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| scene_error(path, "file contains no scene"))?;

    let mut description = SceneDescription {
        materials,
        ..Default::default()
    };

    let mut stack: Vec<(gltf::Node<'_>, Mat4)> =
        scene.nodes().map(|node| (node, Mat4::IDENTITY)).collect();

    while let Some((node, parent)) = stack.pop() {
        let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

        if let Some(mesh) = node.mesh() {
            for primitive in mesh.primitives() {
                let data = read_primitive(&primitive, &buffers, mesh.name(), world)
                    .map_err(|message| scene_error(path, message))?;
                description.meshes.push(data);
            }
        }

        if let Some(light) = node.light() {
            read_light(&light, world, &mut description);
        }

        stack.extend(node.children().map(|child| (child, world)));
    }

    info!(
        "Loaded scene '{}': {} mesh(es), {} material(s), {} point light(s), sun {}",
        path.display(),
        description.meshes.len(),
        description.materials.len(),
        description.point_lights.len(),
        if description.directional_light.is_some() { "yes" } else { "no" }
    );

    Ok(description)
}

fn scene_error(path: &Path, message: impl ToString) -> ResourceError {
    ResourceError::SceneLoad {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn read_material(material: &gltf::Material<'_>, base: &Path) -> MaterialDesc {
    let pbr = material.pbr_metallic_roughness();

    MaterialDesc {
        name: material.name().unwrap_or_default().to_string(),
        base_color: Vec4::from_array(pbr.base_color_factor()),
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        emissive: Vec3::from_array(material.emissive_factor()),
        base_color_texture: pbr
            .base_color_texture()
            .and_then(|info| texture_path(&info.texture(), base)),
        metallic_roughness_texture: pbr
            .metallic_roughness_texture()
            .and_then(|info| texture_path(&info.texture(), base)),
        normal_texture: material
            .normal_texture()
            .and_then(|info| texture_path(&info.texture(), base)),
    }
}

/// External image files only; embedded images are not streamed.
fn texture_path(texture: &gltf::Texture<'_>, base: &Path) -> Option<PathBuf> {
    match texture.source().source() {
        gltf::image::Source::Uri { uri, .. } if !uri.starts_with("data:") => Some(base.join(uri)),
        _ => {
            debug!("Skipping embedded texture {}", texture.index());
            None
        }
    }
}

fn read_primitive(
    primitive: &gltf::Primitive<'_>,
    buffers: &[gltf::buffer::Data],
    name: Option<&str>,
    transform: Mat4,
) -> Result<MeshData, String> {
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data[..]));

    let positions: Vec<Vec3> = reader
        .read_positions()
        .ok_or_else(|| format!("primitive {} has no positions", primitive.index()))?
        .map(Vec3::from_array)
        .collect();

    let normals = reader
        .read_normals()
        .map(|iter| iter.map(Vec3::from_array).collect())
        .unwrap_or_default();

    let tex_coords = reader
        .read_tex_coords(0)
        .map(|coords| coords.into_f32().collect())
        .unwrap_or_default();

    let indices = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..positions.len() as u32).collect(),
    };

    Ok(MeshData {
        name: name.unwrap_or_default().to_string(),
        positions,
        normals,
        tex_coords,
        indices,
        material: primitive.material().index(),
        transform,
    })
}

fn read_light(
    light: &gltf::khr_lights_punctual::Light<'_>,
    world: Mat4,
    description: &mut SceneDescription,
) {
    let color = Vec3::from_array(light.color());

    match light.kind() {
        Kind::Point => description.point_lights.push(PointLight {
            position: world.w_axis.truncate(),
            color,
            intensity: light.intensity(),
            radius: light.range().unwrap_or(DEFAULT_LIGHT_RADIUS),
        }),
        Kind::Directional => {
            if description.directional_light.is_some() {
                warn!("Scene has more than one directional light; keeping the first");
                return;
            }
            // Punctual lights shine down their node's -Z axis.
            let direction = world.transform_vector3(Vec3::NEG_Z).normalize_or_zero();
            description.directional_light = Some(DirectionalLight {
                direction,
                color,
                intensity: light.intensity(),
            });
        }
        Kind::Spot { .. } => {
            debug!("Ignoring spot light {}", light.index());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_scene_file() {
        let err = load_scene(Path::new("no/such/scene.gltf")).unwrap_err();
        assert!(matches!(err, ResourceError::FileNotFound(_)));
    }

    #[test]
    fn test_default_material_is_white() {
        let material = MaterialDesc::default();
        assert_eq!(material.base_color, Vec4::ONE);
        assert!(material.base_color_texture.is_none());
    }
}
