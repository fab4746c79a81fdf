//! Scene import and image decoding.
//!
//! This crate is the renderer's view of external assets:
//! - glTF scene import: meshes, materials, punctual lights
//! - Image decoding and sRGB-aware resizing behind [`ImageDecoder`]

mod error;

pub mod image_data;
pub mod scene;

pub use error::{ResourceError, ResourceResult};
pub use image_data::{DecodedImage, ImageCrateDecoder, ImageDecoder, Texels, decode_image};
pub use scene::{
    DirectionalLight, MaterialDesc, MeshData, PointLight, SceneDescription, load_scene,
};
