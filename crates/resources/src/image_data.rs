//! Image decoding and resizing.
//!
//! Decoding is requested with a channel count (1 to 4), an sRGB flag and a
//! float flag. Eight-bit images marked sRGB are resized in linear light and
//! re-encoded, so downscaled textures keep their brightness; alpha is always
//! treated as linear. Float images are resized as they are.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Rgba};
use tracing::debug;

use crate::error::{ResourceError, ResourceResult};

/// Texel storage of a decoded image.
#[derive(Clone, Debug, PartialEq)]
pub enum Texels {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

/// A decoded image with tightly packed rows.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub srgb: bool,
    pub texels: Texels,
}

impl DecodedImage {
    /// Whether texels are 32-bit floats.
    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self.texels, Texels::F32(_))
    }

    /// The texel data as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.texels {
            Texels::U8(data) => data,
            Texels::F32(data) => bytemuck::cast_slice(data),
        }
    }

    /// Size of [`DecodedImage::as_bytes`].
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Resamples to `width` x `height`, keeping channel count, sRGB mode and
    /// texel type.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Decode`] for a zero target extent.
    pub fn resize(&self, width: u32, height: u32) -> ResourceResult<DecodedImage> {
        if width == 0 || height == 0 {
            return Err(ResourceError::Decode(format!(
                "Cannot resize to {}x{}",
                width, height
            )));
        }
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }

        let channels = self.channels as usize;
        let alpha = alpha_index(self.channels);
        let to_linear = self.srgb && !self.is_float();

        let mut expanded = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        let mut push_texel = |texel: &mut dyn Iterator<Item = f32>| {
            let mut rgba = [0.0f32, 0.0, 0.0, 1.0];
            for (c, value) in texel.enumerate() {
                rgba[c] = if to_linear && Some(c) != alpha {
                    srgb_to_linear(value)
                } else {
                    value
                };
            }
            expanded.extend_from_slice(&rgba);
        };

        match &self.texels {
            Texels::U8(data) => {
                for texel in data.chunks_exact(channels) {
                    push_texel(&mut texel.iter().map(|&v| v as f32 / 255.0));
                }
            }
            Texels::F32(data) => {
                for texel in data.chunks_exact(channels) {
                    push_texel(&mut texel.iter().copied());
                }
            }
        }

        let source: ImageBuffer<Rgba<f32>, Vec<f32>> =
            ImageBuffer::from_raw(self.width, self.height, expanded).ok_or_else(|| {
                ResourceError::Decode(format!(
                    "Texel count does not match {}x{}x{}",
                    self.width, self.height, self.channels
                ))
            })?;
        let resized = imageops::resize(&source, width, height, FilterType::Triangle);

        let texels = match &self.texels {
            Texels::U8(_) => {
                let mut out = Vec::with_capacity(width as usize * height as usize * channels);
                for pixel in resized.pixels() {
                    for (c, &value) in pixel.0[..channels].iter().enumerate() {
                        let value = if to_linear && Some(c) != alpha {
                            linear_to_srgb(value)
                        } else {
                            value
                        };
                        out.push((value * 255.0).round().clamp(0.0, 255.0) as u8);
                    }
                }
                Texels::U8(out)
            }
            Texels::F32(_) => Texels::F32(
                resized
                    .pixels()
                    .flat_map(|pixel| pixel.0[..channels].to_vec())
                    .collect(),
            ),
        };

        debug!(
            "Resized {}x{} -> {}x{} ({} channel(s), srgb {})",
            self.width, self.height, width, height, self.channels, self.srgb
        );

        Ok(DecodedImage {
            width,
            height,
            channels: self.channels,
            srgb: self.srgb,
            texels,
        })
    }
}

/// Image decoding and resizing used by the decode worker.
pub trait ImageDecoder: Send + Sync {
    /// Decodes `path` into `channels` channels.
    fn decode(
        &self,
        path: &Path,
        channels: u8,
        srgb: bool,
        is_float: bool,
    ) -> ResourceResult<DecodedImage>;

    /// Resamples `image`, keeping its color mode.
    fn resize(&self, image: &DecodedImage, width: u32, height: u32) -> ResourceResult<DecodedImage> {
        image.resize(width, height)
    }
}

/// [`ImageDecoder`] backed by the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(
        &self,
        path: &Path,
        channels: u8,
        srgb: bool,
        is_float: bool,
    ) -> ResourceResult<DecodedImage> {
        decode_image(path, channels, srgb, is_float)
    }
}

/// Decodes an image file.
///
/// # Errors
///
/// Returns [`ResourceError::FileNotFound`] for a missing file,
/// [`ResourceError::Decode`] for a channel count outside 1 to 4 and
/// [`ResourceError::Image`] when the codec fails.
pub fn decode_image(
    path: &Path,
    channels: u8,
    srgb: bool,
    is_float: bool,
) -> ResourceResult<DecodedImage> {
    if !(1..=4).contains(&channels) {
        return Err(ResourceError::Decode(format!(
            "Unsupported channel count {} for '{}'",
            channels,
            path.display()
        )));
    }
    if !path.exists() {
        return Err(ResourceError::FileNotFound(path.to_path_buf()));
    }

    let image = image::open(path)?;
    let (width, height) = (image.width(), image.height());
    let texels = if is_float {
        Texels::F32(float_texels(&image, channels))
    } else {
        Texels::U8(byte_texels(&image, channels))
    };

    debug!(
        "Decoded '{}': {}x{}, {} channel(s), {}",
        path.display(),
        width,
        height,
        channels,
        if is_float { "float" } else { "8-bit" }
    );

    Ok(DecodedImage {
        width,
        height,
        channels,
        srgb,
        texels,
    })
}

fn byte_texels(image: &DynamicImage, channels: u8) -> Vec<u8> {
    match channels {
        1 => image.to_luma8().into_raw(),
        2 => image.to_luma_alpha8().into_raw(),
        3 => image.to_rgb8().into_raw(),
        _ => image.to_rgba8().into_raw(),
    }
}

fn float_texels(image: &DynamicImage, channels: u8) -> Vec<f32> {
    match channels {
        1 => image.to_luma32f().into_raw(),
        2 => image.to_luma_alpha32f().into_raw(),
        3 => image.to_rgb32f().into_raw(),
        _ => image.to_rgba32f().into_raw(),
    }
}

fn alpha_index(channels: u8) -> Option<usize> {
    match channels {
        2 => Some(1),
        4 => Some(3),
        _ => None,
    }
}

fn srgb_to_linear(value: f32) -> f32 {
    if value <= 0.04045 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f32) -> f32 {
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}
