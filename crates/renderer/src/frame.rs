//! One frame in flight and its acquire → record → submit → present cycle.
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on in_flight (plus carried and extra fences), then run the
//!    data-transfer callback: the GPU is done with this frame's payload
//! 2. Acquire a swap image (signals image_available)
//! 3. Reset the carried fences and the command buffer, record via the
//!    render callback
//! 4. Reset in_flight and submit:
//!    - wait on extra semaphores and image_available
//!    - signal render_finished
//!    - signal in_flight
//! 5. Present (waits on render_finished)
//! ```
//!
//! A stale swap surface at step 2 returns before anything is reset, so the
//! fence stays signaled and the same frame can run again once the surface
//! has been rebuilt. A failure while recording also leaves in_flight
//! signaled. A stale result at step 5 comes after the submission, which will
//! signal the fence on its own.
//!
//! Carried fences belong to work the render callback submits itself, so they
//! are reset before it runs again. Fences passed by the caller are only
//! waited on.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, trace};

use lumen_rhi::{GpuDevice, RhiResult, Submission};

/// Swap surface operations the frame needs.
///
/// Both methods report a surface that no longer matches its window as
/// [`RhiError::SurfaceOutOfDate`](lumen_rhi::RhiError::SurfaceOutOfDate).
pub trait PresentTarget {
    /// Acquires the next image, signaling `image_available` when it is ready.
    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> RhiResult<u32>;

    /// Queues `image_index` for presentation after `render_finished`.
    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> RhiResult<()>;
}

/// Where a frame is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// Extra synchronization the render callback asks for.
///
/// Semaphores and their wait stages are added in pairs, so the two lists
/// always have the same length.
#[derive(Debug, Default)]
pub struct FrameDependencies {
    wait_fences: Vec<vk::Fence>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
}

impl FrameDependencies {
    /// Makes this frame's next cycle wait on `fence` before its transfer step.
    pub fn wait_fence_next_cycle(&mut self, fence: vk::Fence) {
        self.wait_fences.push(fence);
    }

    /// Makes this submission wait on `semaphore` at `stage`.
    pub fn wait_semaphore(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
    }

    pub fn wait_semaphores(&self) -> &[vk::Semaphore] {
        &self.wait_semaphores
    }

    fn clear(&mut self) {
        self.wait_fences.clear();
        self.wait_semaphores.clear();
        self.wait_stages.clear();
    }
}

/// Command buffer and sync primitives of one frame.
///
/// Handles are filled in one by one; dropping a partly built set releases
/// what was created.
struct FrameSync<D: GpuDevice> {
    device: Arc<D>,
    command_buffer: vk::CommandBuffer,
    in_flight: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

impl<D: GpuDevice> FrameSync<D> {
    fn new(device: Arc<D>) -> RhiResult<Self> {
        let mut sync = Self {
            device,
            command_buffer: vk::CommandBuffer::null(),
            in_flight: vk::Fence::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
        };

        sync.command_buffer = sync.device.allocate_command_buffer()?;
        // Signaled so the first wait returns immediately.
        sync.in_flight = sync.device.create_fence(true)?;
        sync.image_available = sync.device.create_semaphore()?;
        sync.render_finished = sync.device.create_semaphore()?;
        Ok(sync)
    }
}

impl<D: GpuDevice> Drop for FrameSync<D> {
    fn drop(&mut self) {
        if self.render_finished != vk::Semaphore::null() {
            self.device.destroy_semaphore(self.render_finished);
        }
        if self.image_available != vk::Semaphore::null() {
            self.device.destroy_semaphore(self.image_available);
        }
        if self.in_flight != vk::Fence::null() {
            self.device.destroy_fence(self.in_flight);
        }
        if self.command_buffer != vk::CommandBuffer::null() {
            self.device.free_command_buffer(self.command_buffer);
        }
    }
}

/// A frame in flight with a caller-defined payload `T`.
pub struct Frame<D: GpuDevice, T> {
    // Field order is drop order: the payload goes before the primitives.
    data: T,
    sync: FrameSync<D>,
    image_index: Option<u32>,
    state: FrameState,
    /// Fences the previous cycle's render callback asked this cycle to wait on.
    carried_fences: Vec<vk::Fence>,
    dependencies: FrameDependencies,
    /// Set while in_flight is reset but its submission has not been accepted.
    awaiting_submit: bool,
}

impl<D: GpuDevice, T> Frame<D, T> {
    /// Creates the frame's primitives, then its payload with `init`.
    ///
    /// # Errors
    ///
    /// Returns an error if a primitive cannot be created or `init` fails.
    /// Anything already created is released.
    pub fn new<F>(device: Arc<D>, init: F) -> RhiResult<Self>
    where
        F: FnOnce(&Arc<D>) -> RhiResult<T>,
    {
        let sync = FrameSync::new(device)?;
        let data = init(&sync.device)?;

        Ok(Self {
            data,
            sync,
            image_index: None,
            state: FrameState::Idle,
            carried_fences: Vec::new(),
            dependencies: FrameDependencies::default(),
            awaiting_submit: false,
        })
    }

    /// Runs one full cycle against `target`.
    ///
    /// `transfer` runs once the GPU is done with the previous use of this
    /// frame. `render` records into the open command buffer and receives the
    /// acquired image index.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceOutOfDate`](lumen_rhi::RhiError::SurfaceOutOfDate)
    /// when the surface must be rebuilt; the frame can be run again
    /// afterwards. Any other error is fatal.
    pub fn perform_frame<P, X, R>(&mut self, target: &mut P, transfer: X, render: R) -> RhiResult<()>
    where
        P: PresentTarget + ?Sized,
        X: FnOnce(&mut T) -> RhiResult<()>,
        R: FnOnce(&mut T, vk::CommandBuffer, u32, &mut FrameDependencies) -> RhiResult<()>,
    {
        self.perform_frame_with_fences(target, &[], transfer, render)
    }

    /// [`Self::perform_frame`] that also waits on `extra_fences` before the
    /// transfer step.
    pub fn perform_frame_with_fences<P, X, R>(
        &mut self,
        target: &mut P,
        extra_fences: &[vk::Fence],
        transfer: X,
        render: R,
    ) -> RhiResult<()>
    where
        P: PresentTarget + ?Sized,
        X: FnOnce(&mut T) -> RhiResult<()>,
        R: FnOnce(&mut T, vk::CommandBuffer, u32, &mut FrameDependencies) -> RhiResult<()>,
    {
        let device = self.sync.device.clone();
        let command_buffer = self.sync.command_buffer;
        let in_flight = self.sync.in_flight;
        self.image_index = None;

        // Wait
        let carried = std::mem::take(&mut self.carried_fences);
        let mut fences = Vec::with_capacity(carried.len() + extra_fences.len() + 1);
        fences.extend_from_slice(&carried);
        fences.extend_from_slice(extra_fences);
        fences.push(in_flight);
        device.wait_for_fences(&fences, u64::MAX)?;
        transfer(&mut self.data)?;

        // Acquire
        self.state = FrameState::Acquiring;
        let image_index = match target.acquire_next_image(self.sync.image_available) {
            Ok(index) => index,
            Err(e) => {
                self.state = FrameState::Idle;
                if e.is_surface_out_of_date() {
                    debug!("Swap surface out of date during acquire");
                }
                return Err(e);
            }
        };
        self.image_index = Some(image_index);

        // Record
        self.state = FrameState::Recording;
        if !carried.is_empty() {
            device.reset_fences(&carried)?;
        }
        device.reset_commands(command_buffer)?;
        device.begin_commands(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.dependencies.clear();
        render(
            &mut self.data,
            command_buffer,
            image_index,
            &mut self.dependencies,
        )?;
        device.end_commands(command_buffer)?;

        // Submit
        let deps = &mut self.dependencies;
        deps.wait_semaphore(
            self.sync.image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        );
        let signal_semaphores = [self.sync.render_finished];
        self.awaiting_submit = true;
        device.reset_fences(&[in_flight])?;
        device.submit(&Submission {
            command_buffer,
            wait_semaphores: &deps.wait_semaphores,
            wait_stages: &deps.wait_stages,
            signal_semaphores: &signal_semaphores,
            fence: in_flight,
        })?;
        self.awaiting_submit = false;
        self.state = FrameState::Submitted;
        self.carried_fences = std::mem::take(&mut deps.wait_fences);

        // Present
        self.state = FrameState::Presenting;
        let presented = target.present(image_index, self.sync.render_finished);
        self.state = FrameState::Idle;

        match &presented {
            Ok(()) => trace!("Presented image {}", image_index),
            Err(e) if e.is_surface_out_of_date() => {
                debug!("Swap surface out of date during present")
            }
            Err(_) => {}
        }
        presented
    }

    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Image acquired by the current or last cycle; `None` while waiting or
    /// after a failed acquire.
    #[inline]
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.sync.command_buffer
    }

    #[inline]
    pub fn in_flight_fence(&self) -> vk::Fence {
        self.sync.in_flight
    }

    #[inline]
    pub fn image_available_semaphore(&self) -> vk::Semaphore {
        self.sync.image_available
    }

    #[inline]
    pub fn render_finished_semaphore(&self) -> vk::Semaphore {
        self.sync.render_finished
    }

    /// Blocks until this frame's last submission has completed.
    ///
    /// Returns at once if the last cycle reset the fence but its submission
    /// failed, since nothing will signal it.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails.
    pub fn wait(&self) -> RhiResult<()> {
        if self.awaiting_submit {
            debug!("Frame fence has no pending submission, skipping wait");
            return Ok(());
        }
        self.sync
            .device
            .wait_for_fences(&[self.sync.in_flight], u64::MAX)
    }
}

impl<D: GpuDevice, T> Drop for Frame<D, T> {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            error!("Failed to wait for frame before teardown: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use lumen_rhi::RhiError;
    use lumen_rhi::host::{HostCall, HostDevice};

    /// Swap surface double that can go stale on the next acquire or present.
    #[derive(Default)]
    struct StubSurface {
        next_image: u32,
        stale_acquires: usize,
        stale_presents: usize,
        acquired: Vec<vk::Semaphore>,
        presented: Vec<(u32, vk::Semaphore)>,
    }

    impl PresentTarget for StubSurface {
        fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> RhiResult<u32> {
            if self.stale_acquires > 0 {
                self.stale_acquires -= 1;
                return Err(RhiError::SurfaceOutOfDate);
            }
            self.acquired.push(image_available);
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok(index)
        }

        fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> RhiResult<()> {
            self.presented.push((image_index, render_finished));
            if self.stale_presents > 0 {
                self.stale_presents -= 1;
                return Err(RhiError::SurfaceOutOfDate);
            }
            Ok(())
        }
    }

    fn frame(device: &Arc<HostDevice>) -> Frame<HostDevice, u32> {
        Frame::new(device.clone(), |_| Ok(0)).unwrap()
    }

    fn position(calls: &[HostCall], wanted: &HostCall) -> usize {
        calls
            .iter()
            .position(|c| c == wanted)
            .unwrap_or_else(|| panic!("{:?} not in {:?}", wanted, calls))
    }

    #[test]
    fn test_cycle_submits_with_expected_sync() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface::default();

        frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap();

        let calls = device.calls();
        let fence = frame.in_flight_fence();
        let cmd = frame.command_buffer();
        assert_eq!(
            calls,
            vec![
                HostCall::WaitFences(vec![fence]),
                HostCall::ResetCommands(cmd),
                HostCall::BeginCommands(cmd),
                HostCall::EndCommands(cmd),
                HostCall::ResetFences(vec![fence]),
                HostCall::Submit {
                    command_buffer: cmd,
                    wait_semaphores: vec![frame.image_available_semaphore()],
                    wait_stages: vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                    signal_semaphores: vec![frame.render_finished_semaphore()],
                    fence,
                },
            ]
        );
        assert_eq!(
            surface.presented,
            vec![(0, frame.render_finished_semaphore())]
        );
        assert_eq!(frame.image_index(), Some(0));
        assert_eq!(frame.state(), FrameState::Idle);
    }

    #[test]
    fn test_transfer_runs_only_after_fence_wait() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface::default();

        for tick in 0..2 {
            let marker_device = device.clone();
            frame
                .perform_frame(
                    &mut surface,
                    |value| {
                        marker_device.mark("transfer");
                        *value += 1;
                        Ok(())
                    },
                    |_, _, _, _| Ok(()),
                )
                .unwrap();
            assert_eq!(*frame.data(), tick + 1);
        }

        let calls = device.calls();
        let fence = frame.in_flight_fence();
        let transfers: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == HostCall::Marker("transfer"))
            .map(|(i, _)| i)
            .collect();
        let waits: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == HostCall::WaitFences(vec![fence]))
            .map(|(i, _)| i)
            .collect();
        let first_submit = calls
            .iter()
            .position(|c| matches!(c, HostCall::Submit { .. }))
            .unwrap();

        assert_eq!(transfers.len(), 2);
        assert_eq!(waits.len(), 2);
        assert!(waits[0] < transfers[0]);
        // The second payload mutation waits for the first submission's fence.
        assert!(first_submit < waits[1] && waits[1] < transfers[1]);
    }

    #[test]
    fn test_stale_acquire_leaves_fence_signaled_and_retry_succeeds() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface {
            stale_acquires: 1,
            ..Default::default()
        };

        let err = frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap_err();
        assert!(err.is_surface_out_of_date());
        assert!(device.is_fence_signaled(frame.in_flight_fence()));
        assert_eq!(frame.image_index(), None);
        assert_eq!(frame.state(), FrameState::Idle);
        assert!(
            !device
                .calls()
                .iter()
                .any(|c| matches!(c, HostCall::ResetFences(_) | HostCall::Submit { .. }))
        );

        // The host backend fails a wait on an unsignaled fence instead of
        // hanging, so success here means the retry did not block.
        frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap();
        assert_eq!(surface.presented.len(), 1);
    }

    #[test]
    fn test_stale_present_still_submits() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface {
            stale_presents: 1,
            ..Default::default()
        };

        let err = frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, RhiError::SurfaceOutOfDate));
        assert!(device.is_fence_signaled(frame.in_flight_fence()));

        frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap();
    }

    #[test]
    fn test_dependencies_extend_submit_and_next_wait() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface::default();
        let upload_done = device.create_semaphore().unwrap();
        let other_fence = device.create_fence(true).unwrap();

        frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, deps| {
                deps.wait_semaphore(upload_done, vk::PipelineStageFlags::VERTEX_INPUT);
                deps.wait_fence_next_cycle(other_fence);
                Ok(())
            })
            .unwrap();

        let calls = device.calls();
        let submit = calls
            .iter()
            .find(|c| matches!(c, HostCall::Submit { .. }))
            .unwrap();
        match submit {
            HostCall::Submit {
                wait_semaphores,
                wait_stages,
                ..
            } => {
                assert_eq!(
                    wait_semaphores,
                    &vec![upload_done, frame.image_available_semaphore()]
                );
                assert_eq!(
                    wait_stages,
                    &vec![
                        vk::PipelineStageFlags::VERTEX_INPUT,
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    ]
                );
            }
            _ => unreachable!(),
        }

        device.clear_calls();
        let extra = device.create_fence(true).unwrap();
        let marker_device = device.clone();
        frame
            .perform_frame_with_fences(&mut surface, &[extra], |_| Ok(()), |_, _, _, _| {
                marker_device.mark("render");
                Ok(())
            })
            .unwrap();
        let calls = device.calls();
        let fence = frame.in_flight_fence();
        let wait = position(&calls, &HostCall::WaitFences(vec![other_fence, extra, fence]));
        // The carried fence is unsignaled again before the callback that
        // would resubmit its work.
        let carried_reset = position(&calls, &HostCall::ResetFences(vec![other_fence]));
        let render = position(&calls, &HostCall::Marker("render"));
        let own_reset = position(&calls, &HostCall::ResetFences(vec![fence]));
        let submit = calls
            .iter()
            .position(|c| matches!(c, HostCall::Submit { .. }))
            .unwrap();
        assert!(wait < carried_reset && carried_reset < render);
        assert!(render < own_reset && own_reset + 1 == submit);
        assert!(!device.is_fence_signaled(other_fence));
        // Caller fences are waited on, never reset.
        assert!(device.is_fence_signaled(extra));
        assert!(
            !calls
                .iter()
                .any(|c| matches!(c, HostCall::ResetFences(f) if f.contains(&extra)))
        );
    }

    #[test]
    fn test_carried_fences_dropped_after_stale_acquire() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface::default();
        let compute_fence = device.create_fence(true).unwrap();

        frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, deps| {
                deps.wait_fence_next_cycle(compute_fence);
                Ok(())
            })
            .unwrap();

        surface.stale_acquires = 1;
        assert!(
            frame
                .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
                .unwrap_err()
                .is_surface_out_of_date()
        );
        assert!(device.is_fence_signaled(compute_fence));

        device.clear_calls();
        frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap();
        let fence = frame.in_flight_fence();
        assert_eq!(device.calls()[0], HostCall::WaitFences(vec![fence]));
    }

    #[test]
    fn test_render_error_leaves_fence_signaled() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface::default();

        let err = frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| {
                Err(RhiError::InvalidHandle("pipeline missing".into()))
            })
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidHandle(_)));
        assert!(device.is_fence_signaled(frame.in_flight_fence()));
        assert!(
            !device
                .calls()
                .iter()
                .any(|c| matches!(c, HostCall::ResetFences(_) | HostCall::Submit { .. }))
        );
        assert!(surface.presented.is_empty());

        // Teardown waits on the fence; the host backend fails instead of
        // hanging if it was left unsignaled.
        frame.wait().unwrap();
        frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap();
        assert_eq!(surface.presented.len(), 1);
    }

    #[test]
    fn test_failed_submit_does_not_block_wait() {
        let device = HostDevice::new();
        let mut frame = frame(&device);
        let mut surface = StubSurface::default();

        device.fail_next_submit();
        let err = frame
            .perform_frame(&mut surface, |_| Ok(()), |_, _, _, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST)));
        assert!(!device.is_fence_signaled(frame.in_flight_fence()));

        device.clear_calls();
        frame.wait().unwrap();
        assert!(device.calls().is_empty());
        drop(frame);
        assert_eq!(device.fence_count(), 0);
    }

    #[test]
    fn test_payload_dropped_before_primitives() {
        struct Payload(Rc<RefCell<Vec<usize>>>, Arc<HostDevice>);
        impl Drop for Payload {
            fn drop(&mut self) {
                self.0.borrow_mut().push(self.1.fence_count());
            }
        }

        let device = HostDevice::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let frame = Frame::new(device.clone(), |d| Ok(Payload(log.clone(), d.clone()))).unwrap();
        assert_eq!(device.fence_count(), 1);

        drop(frame);
        // The fence still existed while the payload was dropped.
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(device.fence_count(), 0);
        assert_eq!(device.semaphore_count(), 0);
        assert_eq!(device.command_buffer_count(), 0);
    }

    #[test]
    fn test_failed_init_releases_primitives() {
        let device = HostDevice::new();
        let result: RhiResult<Frame<HostDevice, ()>> =
            Frame::new(device.clone(), |_| Err(RhiError::NoSuitableGpu));
        assert!(result.is_err());
        assert_eq!(device.fence_count(), 0);
        assert_eq!(device.semaphore_count(), 0);
        assert_eq!(device.command_buffer_count(), 0);
    }
}
