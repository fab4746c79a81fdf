//! Frame lifecycle and GPU resource synchronization.
//!
//! This crate drives what happens between the CPU and the GPU every frame:
//! - The per-frame state machine and the ring of frames in flight
//! - The swap surface, its depth target and the present pass
//! - Uniform and storage containers kept in sync with host data
//! - Background image decoding into staging buffers, then texture upload

pub mod containers;
pub mod decode;
pub mod depth_buffer;
mod error;
pub mod frame;
pub mod frame_ring;
pub mod gpu_types;
pub mod lights;
pub mod materials;
pub mod present_pass;
pub mod swap_surface;
pub mod textures;

pub use containers::{FixedSlotResource, IndefiniteArrayResource};
pub use decode::{
    AsyncDecodeWorker, DecodeCompletion, DecodeFailure, DecodeRequest, DecodeTarget, DrainReport,
    TextureKind,
};
pub use depth_buffer::DepthBuffer;
pub use error::{RenderError, RenderResult};
pub use frame::{Frame, FrameDependencies, FrameState, PresentTarget};
pub use frame_ring::FrameRing;
pub use lights::PointLightBuffer;
pub use materials::MaterialTable;
pub use present_pass::{OverlayRecorder, PresentAttachments, PresentPass};
pub use swap_surface::SwapSurface;
pub use textures::TextureRegistry;
