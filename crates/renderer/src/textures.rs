//! Sampled textures fed by the decode worker.
//!
//! Every texture index handed out by [`TextureRegistry::reserve`] is usable
//! immediately: it points at a 1x1 white fallback until the decode for it
//! completes and [`TextureRegistry::upload_from_staging`] swaps in the real
//! image.
//!
//! A replaced image may still be sampled by frames in flight, so it is kept
//! until every ring slot has waited on its fence again, counted through
//! [`TextureRegistry::end_frame`].

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use lumen_core::{Arena, Handle};
use lumen_rhi::buffer::Buffer;
use lumen_rhi::context::DeviceContext;
use lumen_rhi::image::Image;
use lumen_rhi::{RhiError, RhiResult, transfer};

use crate::decode::{DecodeCompletion, DecodeTarget};

/// Vulkan format for decoded texels.
///
/// # Errors
///
/// Returns [`RhiError::InvalidHandle`] for a channel count outside 1 to 4.
pub fn texture_format(channels: u8, srgb: bool, is_float: bool) -> RhiResult<vk::Format> {
    use vk::Format as F;

    let format = match (channels, is_float, srgb) {
        (1, true, _) => F::R32_SFLOAT,
        (2, true, _) => F::R32G32_SFLOAT,
        (3, true, _) => F::R32G32B32_SFLOAT,
        (4, true, _) => F::R32G32B32A32_SFLOAT,
        (1, false, true) => F::R8_SRGB,
        (1, false, false) => F::R8_UNORM,
        (2, false, true) => F::R8G8_SRGB,
        (2, false, false) => F::R8G8_UNORM,
        (3, false, true) => F::R8G8B8_SRGB,
        (3, false, false) => F::R8G8B8_UNORM,
        (4, false, true) => F::R8G8B8A8_SRGB,
        (4, false, false) => F::R8G8B8A8_UNORM,
        _ => {
            return Err(RhiError::InvalidHandle(format!(
                "No texture format for {} channel(s)",
                channels
            )));
        }
    };
    Ok(format)
}

/// Texture index bookkeeping, independent of any GPU objects.
#[derive(Debug, Default)]
struct TextureSlots {
    by_path: HashMap<PathBuf, u32>,
    by_target: HashMap<DecodeTarget, u32>,
    count: u32,
}

impl TextureSlots {
    /// Returns the index for `path` and whether it was newly assigned.
    fn reserve(&mut self, path: &Path, target: DecodeTarget) -> (u32, bool) {
        if let Some(&index) = self.by_path.get(path) {
            self.by_target.insert(target, index);
            return (index, false);
        }
        let index = self.count;
        self.count += 1;
        self.by_path.insert(path.to_path_buf(), index);
        self.by_target.insert(target, index);
        (index, true)
    }

    fn index_of(&self, target: &DecodeTarget) -> Option<u32> {
        self.by_target.get(target).copied()
    }
}

/// Items waiting out the frames that may still use them.
#[derive(Debug)]
struct RetiredQueue<T> {
    entries: VecDeque<(u64, T)>,
    frame: u64,
    delay: u64,
}

impl<T> RetiredQueue<T> {
    fn new(delay: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            frame: 0,
            delay: delay.max(1) as u64,
        }
    }

    fn retire(&mut self, item: T) {
        self.entries.push_back((self.frame + self.delay, item));
    }

    /// Counts one completed frame and returns the items no frame can use
    /// any more, oldest first.
    fn end_frame(&mut self) -> Vec<T> {
        self.frame += 1;
        let mut expired = Vec::new();
        while let Some((due, _)) = self.entries.front() {
            if *due > self.frame {
                break;
            }
            if let Some((_, item)) = self.entries.pop_front() {
                expired.push(item);
            }
        }
        expired
    }

    fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Owns every sampled image and maps texture indices onto them.
pub struct TextureRegistry {
    context: Arc<DeviceContext>,
    images: Arena<Image>,
    fallback: Handle<Image>,
    bound: Vec<Handle<Image>>,
    slots: TextureSlots,
    retired: RetiredQueue<Handle<Image>>,
}

impl TextureRegistry {
    /// Creates the registry and uploads the fallback texture.
    ///
    /// Replaced images are kept for `frames_in_flight` completed frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the fallback image cannot be created or uploaded.
    pub fn new(context: Arc<DeviceContext>, frames_in_flight: usize) -> RhiResult<Self> {
        let mut fallback = Self::create_image(
            &context,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
            vk::Format::R8G8B8A8_UNORM,
            "fallback texture",
        )?;
        transfer::copy_to_image_immediate(&context, &[255, 255, 255, 255], &mut fallback)?;

        let mut images = Arena::new();
        let fallback = images.insert(fallback);

        info!("Texture registry ready");
        Ok(Self {
            context,
            images,
            fallback,
            bound: Vec::new(),
            slots: TextureSlots::default(),
            retired: RetiredQueue::new(frames_in_flight),
        })
    }

    /// Returns the texture index for `path`, assigning one the first time
    /// the path is seen. The bool is `true` when the caller should schedule
    /// a decode for it.
    pub fn reserve(&mut self, path: &Path, target: DecodeTarget) -> (u32, bool) {
        let (index, fresh) = self.slots.reserve(path, target);
        if fresh {
            self.bound.push(self.fallback);
        }
        (index, fresh)
    }

    /// Uploads a finished decode from its staging slot and binds it to the
    /// completion's texture index.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidHandle`] if the target was never reserved,
    /// or an error from image creation or the upload.
    pub fn upload_from_staging(
        &mut self,
        completion: &DecodeCompletion,
        staging: &Buffer,
    ) -> RhiResult<u32> {
        let index = self.slots.index_of(&completion.target).ok_or_else(|| {
            RhiError::InvalidHandle(format!(
                "No texture reserved for {:?}",
                completion.target
            ))
        })?;

        let format = texture_format(completion.channels, completion.srgb, completion.is_float)?;
        let name = completion.path.display().to_string();
        let mut image = Self::create_image(
            &self.context,
            vk::Extent2D {
                width: completion.width,
                height: completion.height,
            },
            format,
            &name,
        )?;
        transfer::upload_image_from_staging(&self.context, staging, 0, &mut image)?;

        let handle = self.images.insert(image);
        let previous = std::mem::replace(&mut self.bound[index as usize], handle);
        if previous != self.fallback {
            self.retired.retire(previous);
        }

        debug!(
            "Texture {} <- '{}' ({}x{} {:?})",
            index, name, completion.width, completion.height, format
        );
        Ok(index)
    }

    /// Counts one successfully submitted frame and frees replaced images
    /// that no frame in flight can still sample.
    pub fn end_frame(&mut self) {
        let expired = self.retired.end_frame();
        if !expired.is_empty() {
            debug!("Freeing {} replaced texture(s)", expired.len());
        }
        self.release_all(expired);
    }

    /// Frees every replaced image at once. Only valid after all frames in
    /// flight have been waited on.
    pub fn release_retired(&mut self) {
        let retired = self.retired.drain();
        self.release_all(retired);
    }

    /// Replaced images not yet freed.
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    fn release_all(&mut self, handles: Vec<Handle<Image>>) {
        for handle in handles {
            if let Err(e) = self.images.release(handle) {
                warn!("Failed to release replaced texture: {}", e);
            }
        }
    }

    /// Image view bound to texture `index`, or the fallback's view for an
    /// index that was never reserved.
    pub fn view(&self, index: u32) -> vk::ImageView {
        let handle = self
            .bound
            .get(index as usize)
            .copied()
            .unwrap_or(self.fallback);
        self.images
            .get(handle)
            .or_else(|| self.images.get(self.fallback))
            .map_or(vk::ImageView::null(), Image::view)
    }

    /// Whether texture `index` still shows the fallback.
    pub fn is_fallback(&self, index: u32) -> bool {
        self.bound
            .get(index as usize)
            .is_none_or(|&handle| handle == self.fallback)
    }

    /// Number of reserved texture indices.
    #[inline]
    pub fn len(&self) -> u32 {
        self.slots.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.count == 0
    }

    fn create_image(
        context: &DeviceContext,
        extent: vk::Extent2D,
        format: vk::Format,
        name: &str,
    ) -> RhiResult<Image> {
        Image::new(
            context.device().clone(),
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::TextureKind;

    #[test]
    fn test_texture_format_selection() {
        assert_eq!(texture_format(4, true, false).unwrap(), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(texture_format(4, false, false).unwrap(), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(texture_format(4, false, true).unwrap(), vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(texture_format(1, false, false).unwrap(), vk::Format::R8_UNORM);
        assert_eq!(texture_format(2, true, true).unwrap(), vk::Format::R32G32_SFLOAT);
    }

    #[test]
    fn test_texture_format_rejects_bad_channels() {
        assert!(texture_format(0, false, false).is_err());
        assert!(texture_format(5, true, false).is_err());
    }

    #[test]
    fn test_slots_share_index_per_path() {
        let mut slots = TextureSlots::default();
        let base = DecodeTarget::Material {
            material: 0,
            kind: TextureKind::BaseColor,
        };
        let reused = DecodeTarget::Material {
            material: 1,
            kind: TextureKind::BaseColor,
        };
        let normal = DecodeTarget::Material {
            material: 0,
            kind: TextureKind::Normal,
        };

        assert_eq!(slots.reserve(Path::new("albedo.png"), base), (0, true));
        assert_eq!(slots.reserve(Path::new("normal.png"), normal), (1, true));
        assert_eq!(slots.reserve(Path::new("albedo.png"), reused), (0, false));

        assert_eq!(slots.index_of(&base), Some(0));
        assert_eq!(slots.index_of(&reused), Some(0));
        assert_eq!(slots.index_of(&normal), Some(1));
        assert_eq!(slots.index_of(&DecodeTarget::Environment), None);
        assert_eq!(slots.count, 2);
    }

    #[test]
    fn test_retired_items_outlive_frames_in_flight() {
        let mut queue = RetiredQueue::new(2);
        queue.retire("first");
        assert!(queue.end_frame().is_empty());
        queue.retire("second");
        // Two frames after retirement every slot has waited once more.
        assert_eq!(queue.end_frame(), vec!["first"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.end_frame(), vec!["second"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_retired_queue_releases_in_order() {
        let mut queue = RetiredQueue::new(3);
        queue.retire(1);
        queue.retire(2);
        assert!(queue.end_frame().is_empty());
        queue.retire(3);
        assert!(queue.end_frame().is_empty());
        assert_eq!(queue.end_frame(), vec![1, 2]);
        assert_eq!(queue.end_frame(), vec![3]);
        assert!(queue.end_frame().is_empty());
    }

    #[test]
    fn test_retired_queue_drain_and_zero_delay() {
        let mut queue = RetiredQueue::new(0);
        queue.retire('a');
        // A zero delay still waits one frame.
        assert_eq!(queue.end_frame(), vec!['a']);

        let mut queue = RetiredQueue::new(4);
        queue.retire('b');
        queue.retire('c');
        assert_eq!(queue.drain(), vec!['b', 'c']);
        assert_eq!(queue.len(), 0);
        assert!(queue.end_frame().is_empty());
    }
}
