//! Runtime configuration for the renderer.
//!
//! Every field has a working default. [`RendererConfig::from_env`] layers
//! `LUMEN_*` environment overrides on top of the defaults so a run can be
//! reconfigured without a rebuild.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};

/// Largest ring the shared descriptor pool has storage bindings for.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// Tunables read once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct RendererConfig {
    /// Number of frames in the ring; commonly 2 or 3.
    pub frames_in_flight: usize,
    /// Number of staging buffers owned by the async decode worker.
    pub staging_slots: usize,
    /// Largest decoded image, in texels, a staging slot can hold.
    pub max_decode_extent: (u32, u32),
    /// Largest channel count a staging slot can hold.
    pub max_decode_channels: u32,
    /// Directory for the key to blob preference store.
    pub store_dir: PathBuf,
    /// Scene to load at startup, if any.
    pub scene_path: Option<PathBuf>,
    /// Enables the Khronos validation layer when available.
    pub enable_validation: bool,
    /// Initial window width.
    pub window_width: u32,
    /// Initial window height.
    pub window_height: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            staging_slots: 4,
            max_decode_extent: (2048, 2048),
            max_decode_channels: 4,
            store_dir: PathBuf::from("ObjectStore"),
            scene_path: None,
            enable_validation: cfg!(debug_assertions),
            window_width: 1280,
            window_height: 720,
        }
    }
}

impl RendererConfig {
    /// Defaults with `LUMEN_*` environment overrides applied, then validated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a variable is present but malformed or
    /// when the resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(frames) = parse_var("LUMEN_FRAMES_IN_FLIGHT")? {
            config.frames_in_flight = frames;
        }
        if let Some(slots) = parse_var("LUMEN_STAGING_SLOTS")? {
            config.staging_slots = slots;
        }
        if let Some(extent) = parse_var::<u32>("LUMEN_MAX_DECODE_EXTENT")? {
            config.max_decode_extent = (extent, extent);
        }
        if let Some(validation) = parse_var("LUMEN_VALIDATION")? {
            config.enable_validation = validation;
        }
        if let Ok(dir) = env::var("LUMEN_STORE_DIR") {
            config.store_dir = PathBuf::from(dir);
        }
        if let Ok(scene) = env::var("LUMEN_SCENE") {
            config.scene_path = Some(PathBuf::from(scene));
        }

        config.validate()?;
        debug!("Renderer configuration: {:?}", config);
        Ok(config)
    }

    /// Rejects configurations the frame ring or decode worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".into()));
        }
        if self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be at most {}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }
        if self.staging_slots == 0 {
            return Err(Error::Config("staging_slots must be at least 1".into()));
        }
        let (width, height) = self.max_decode_extent;
        if width == 0 || height == 0 || self.max_decode_channels == 0 {
            return Err(Error::Config(format!(
                "decode staging extent {}x{}x{} is empty",
                width, height, self.max_decode_channels
            )));
        }
        if !(1..=4).contains(&self.max_decode_channels) {
            return Err(Error::Config(format!(
                "max_decode_channels must be 1..=4, got {}",
                self.max_decode_channels
            )));
        }
        Ok(())
    }

    /// Bytes one decode staging slot must hold.
    ///
    /// Sized for float texels so HDR requests fit as well as 8-bit ones.
    pub fn staging_slot_size(&self) -> u64 {
        let (width, height) = self.max_decode_extent;
        width as u64
            * height as u64
            * self.max_decode_channels as u64
            * std::mem::size_of::<f32>() as u64
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has malformed value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}
