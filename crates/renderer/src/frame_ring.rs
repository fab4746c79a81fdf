//! Ring of frames in flight.
//!
//! While the GPU works on frame N, the CPU records frame N+1 into the next
//! slot. A slot is only reused after its fence has signaled, which the frame
//! itself waits for at the start of its cycle.

use std::sync::Arc;

use ash::vk;
use tracing::info;

use lumen_rhi::{GpuDevice, RhiResult};

use crate::frame::{Frame, FrameDependencies, PresentTarget};

/// `N` frames used round-robin.
pub struct FrameRing<D: GpuDevice, T> {
    frames: Vec<Frame<D, T>>,
    current: usize,
}

impl<D: GpuDevice, T> FrameRing<D, T> {
    /// Creates `count` frames, building slot `i`'s payload with `init(i, device)`.
    ///
    /// # Errors
    ///
    /// Returns an error if `count` is zero or any frame fails to build.
    pub fn new<F>(device: Arc<D>, count: usize, mut init: F) -> RhiResult<Self>
    where
        F: FnMut(usize, &Arc<D>) -> RhiResult<T>,
    {
        if count == 0 {
            return Err(lumen_rhi::RhiError::InvalidHandle(
                "A frame ring needs at least one frame".to_string(),
            ));
        }

        let frames = (0..count)
            .map(|i| Frame::new(device.clone(), |d| init(i, d)))
            .collect::<RhiResult<Vec<_>>>()?;

        info!("Frame ring created with {} frames in flight", count);
        Ok(Self { frames, current: 0 })
    }

    /// Runs the current frame and advances to the next slot on success.
    ///
    /// On error the ring stays on the same slot, so after a surface rebuild
    /// the same frame runs again.
    ///
    /// # Errors
    ///
    /// Same as [`Frame::perform_frame`].
    pub fn perform_frame<P, X, R>(&mut self, target: &mut P, transfer: X, render: R) -> RhiResult<()>
    where
        P: PresentTarget + ?Sized,
        X: FnOnce(&mut T) -> RhiResult<()>,
        R: FnOnce(&mut T, vk::CommandBuffer, u32, &mut FrameDependencies) -> RhiResult<()>,
    {
        self.frames[self.current].perform_frame(target, transfer, render)?;
        self.advance();
        Ok(())
    }

    /// Moves to the next slot.
    #[inline]
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
    }

    #[inline]
    pub fn current(&self) -> &Frame<D, T> {
        &self.frames[self.current]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut Frame<D, T> {
        &mut self.frames[self.current]
    }

    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame<D, T>> {
        self.frames.iter()
    }

    /// Blocks until every frame's last submission has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if a wait fails.
    pub fn wait_all(&self) -> RhiResult<()> {
        for frame in &self.frames {
            frame.wait()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::IndefiniteArrayResource;
    use crate::gpu_types::LightCount;
    use lumen_rhi::host::HostDevice;
    use lumen_rhi::{BufferHandle, RhiError};

    struct Surface {
        stale_next: bool,
    }

    impl PresentTarget for Surface {
        fn acquire_next_image(&mut self, _: vk::Semaphore) -> RhiResult<u32> {
            if std::mem::take(&mut self.stale_next) {
                return Err(RhiError::SurfaceOutOfDate);
            }
            Ok(0)
        }

        fn present(&mut self, _: u32, _: vk::Semaphore) -> RhiResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ring_wraps_around() {
        let device = HostDevice::new();
        let mut ring = FrameRing::new(device, 3, |i, _| Ok(i)).unwrap();
        let mut surface = Surface { stale_next: false };

        let mut seen = Vec::new();
        for _ in 0..4 {
            ring.perform_frame(
                &mut surface,
                |slot| {
                    seen.push(*slot);
                    Ok(())
                },
                |_, _, _, _| Ok(()),
            )
            .unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 0]);
        assert_eq!(ring.current_index(), 1);
    }

    #[test]
    fn test_stale_frame_is_retried_in_same_slot() {
        let device = HostDevice::new();
        let mut ring = FrameRing::new(device, 2, |i, _| Ok(i)).unwrap();
        let mut surface = Surface { stale_next: true };

        let err = ring
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap_err();
        assert!(err.is_surface_out_of_date());
        assert_eq!(ring.current_index(), 0);

        ring.perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap();
        assert_eq!(ring.current_index(), 1);
        ring.wait_all().unwrap();
    }

    #[test]
    fn test_wait_all_returns_after_render_error() {
        let device = HostDevice::new();
        let mut ring = FrameRing::new(device, 2, |i, _| Ok(i)).unwrap();
        let mut surface = Surface { stale_next: false };

        ring.perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap();
        let err = ring
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| {
                Err(RhiError::InvalidHandle("lost pipeline".into()))
            })
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidHandle(_)));
        assert_eq!(ring.current_index(), 1);

        // HostDevice fails waits on unsignaled fences, where Vulkan would hang.
        ring.wait_all().unwrap();
    }

    #[test]
    fn test_per_frame_arrays_updated_in_transfer() {
        type LightIndices = IndefiniteArrayResource<LightCount, u32, HostDevice>;

        let device = HostDevice::new();
        let mut ring = FrameRing::new(device.clone(), 2, |slot, device| {
            let indices = LightIndices::new(device.clone(), 8, &format!("light indices {}", slot))?;
            let set = indices.create_descriptor_set(vk::ShaderStageFlags::FRAGMENT)?;
            Ok((indices, set))
        })
        .unwrap();
        let mut surface = Surface { stale_next: false };

        for tick in 0..3u32 {
            let visible: Vec<u32> = (0..=tick).collect();
            ring.perform_frame(
                &mut surface,
                |(indices, _)| {
                    indices.update_whole(&LightCount::new(visible.len() as u32), &visible, 0)
                },
                |_, _, _, _| Ok(()),
            )
            .unwrap();
        }

        let published = |slot: usize| -> Vec<u32> {
            let (indices, _) = ring.iter().nth(slot).unwrap().data();
            let bytes = indices.buffer().read();
            let header: LightCount = bytemuck::pod_read_unaligned(&bytes[..16]);
            let offset = indices.array_offset() as usize;
            (0..header.count as usize)
                .map(|i| bytemuck::pod_read_unaligned(&bytes[offset + i * 4..offset + i * 4 + 4]))
                .collect()
        };
        // Slot 0 ran ticks 0 and 2, slot 1 only tick 1.
        assert_eq!(published(0), vec![0, 1, 2]);
        assert_eq!(published(1), vec![0, 1]);

        let sets: Vec<vk::DescriptorSet> = ring.iter().map(|f| f.data().1).collect();
        assert_ne!(sets[0], sets[1]);
        for (frame, set) in ring.iter().zip(&sets) {
            let writes = device.descriptor_writes(*set);
            assert_eq!(writes.len(), 2);
            assert!(
                writes
                    .iter()
                    .all(|w| w.buffer == frame.data().0.buffer().raw())
            );
        }
    }

    #[test]
    fn test_empty_ring_is_rejected() {
        let device = HostDevice::new();
        assert!(FrameRing::<HostDevice, ()>::new(device, 0, |_, _| Ok(())).is_err());
    }
}
