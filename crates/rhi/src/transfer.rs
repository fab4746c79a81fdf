//! Staging transfers from host bytes into device buffers and images.
//!
//! Two flavors exist for every destination:
//!
//! - *immediate*: creates a throwaway staging buffer, records the copy into a
//!   single-time command buffer, submits on the shared queue and blocks until
//!   the queue is idle before freeing both
//! - *in command context*: records the copy into a command buffer the caller
//!   has open; the caller submits and keeps the source alive until then
//!
//! Regions are checked against both buffers before anything is recorded. A
//! region that does not fit is a bug in the caller and panics.

use ash::vk;
use tracing::trace;

use crate::backend::{BufferHandle, GpuDevice, Submission};
use crate::buffer::Buffer;
use crate::context::DeviceContext;
use crate::error::RhiResult;
use crate::image::Image;

/// Copies `bytes` into `dst` at `dst_offset` and waits for completion.
///
/// # Errors
///
/// Returns an error if the staging buffer cannot be created or submission
/// fails.
///
/// # Panics
///
/// Panics if the bytes do not fit in `dst` at `dst_offset`.
pub fn copy_immediate<D: GpuDevice>(
    device: &D,
    bytes: &[u8],
    dst: &D::Buffer,
    dst_offset: vk::DeviceSize,
) -> RhiResult<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    let size = bytes.len() as vk::DeviceSize;
    let staging = device.create_staging(size, "copy_immediate staging")?;
    device.write_staging(&staging, 0, bytes)?;

    submit_copies_immediate(
        device,
        &staging,
        dst,
        &[vk::BufferCopy {
            src_offset: 0,
            dst_offset,
            size,
        }],
    )
}

/// Records `regions` from an already filled staging buffer in a single-time
/// command buffer and waits for completion.
///
/// # Errors
///
/// Returns an error if command buffer allocation or submission fails.
///
/// # Panics
///
/// Panics if any region falls outside `src` or `dst`.
pub fn submit_copies_immediate<D: GpuDevice>(
    device: &D,
    src: &D::Staging,
    dst: &D::Buffer,
    regions: &[vk::BufferCopy],
) -> RhiResult<()> {
    check_regions(src.size(), dst.size(), regions);

    one_shot(device, |cmd| {
        device.record_buffer_copy(cmd, src, dst, regions);
        Ok(())
    })
}

/// Records `regions` into the open command buffer `cmd`.
///
/// # Panics
///
/// Panics if any region falls outside `src` or `dst`.
pub fn copy_in_command_context<D: GpuDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    src: &D::Staging,
    dst: &D::Buffer,
    regions: &[vk::BufferCopy],
) {
    check_regions(src.size(), dst.size(), regions);
    device.record_buffer_copy(cmd, src, dst, regions);
}

/// Runs `record` inside a single-time command buffer, submits it and blocks
/// until the queue is idle.
///
/// The command buffer is freed whether or not recording succeeds.
///
/// # Errors
///
/// Returns the first error from allocation, recording or submission.
pub fn one_shot<D, F>(device: &D, record: F) -> RhiResult<()>
where
    D: GpuDevice,
    F: FnOnce(vk::CommandBuffer) -> RhiResult<()>,
{
    let cmd = device.allocate_command_buffer()?;

    let result = (|| {
        device.begin_commands(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record(cmd)?;
        device.end_commands(cmd)?;
        device.submit(&Submission::commands_only(cmd))?;
        device.queue_wait_idle()
    })();

    device.free_command_buffer(cmd);
    trace!("One-shot command buffer completed: {}", result.is_ok());
    result
}

/// Uploads `bytes` into `image`, leaving it `SHADER_READ_ONLY_OPTIMAL`.
///
/// # Errors
///
/// Returns an error if staging creation, a layout transition or submission
/// fails.
pub fn copy_to_image_immediate(
    context: &DeviceContext,
    bytes: &[u8],
    image: &mut Image,
) -> RhiResult<()> {
    let staging = context.create_staging(bytes.len() as vk::DeviceSize, "image staging")?;
    staging.write_data(0, bytes)?;
    upload_image_from_staging(context, &staging, 0, image)
}

/// Uploads the texels at `offset` in `staging` into `image` with a
/// transition → copy → transition sequence in one single-time command buffer.
///
/// # Errors
///
/// Returns an error if a layout transition or submission fails.
pub fn upload_image_from_staging(
    context: &DeviceContext,
    staging: &Buffer,
    offset: vk::DeviceSize,
    image: &mut Image,
) -> RhiResult<()> {
    one_shot(context, |cmd| {
        copy_to_image_in_command_context(context, cmd, staging, offset, image)?;
        image.transition_layout(
            &context.recorder(cmd),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    })
}

/// Records a transition to `TRANSFER_DST_OPTIMAL` (unless the image is
/// already there or `GENERAL`) followed by the copy into the open `cmd`.
///
/// # Errors
///
/// Returns an error if the transition from the image's current layout is
/// unsupported.
pub fn copy_to_image_in_command_context(
    context: &DeviceContext,
    cmd: vk::CommandBuffer,
    staging: &Buffer,
    offset: vk::DeviceSize,
    image: &mut Image,
) -> RhiResult<()> {
    let recorder = context.recorder(cmd);
    if !matches!(
        image.layout(),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::GENERAL
    ) {
        image.transition_layout(&recorder, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
    }
    image.copy_from_staging(&recorder, staging, offset);
    Ok(())
}

fn check_regions(src_size: vk::DeviceSize, dst_size: vk::DeviceSize, regions: &[vk::BufferCopy]) {
    for region in regions {
        assert!(
            region.src_offset + region.size <= src_size,
            "copy region reads past the source: {} + {} > {}",
            region.src_offset,
            region.size,
            src_size
        );
        assert!(
            region.dst_offset + region.size <= dst_size,
            "copy region writes past the destination: {} + {} > {}",
            region.dst_offset,
            region.size,
            dst_size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferUsage;
    use crate::host::{HostCall, HostDevice};

    #[test]
    fn test_copy_immediate_writes_at_offset() {
        let device = HostDevice::new();
        let dst = device
            .create_buffer(8, BufferUsage::Storage, "dst")
            .unwrap();

        copy_immediate(&*device, &[7, 8], &dst, 3).unwrap();

        assert_eq!(dst.read(), vec![0, 0, 0, 7, 8, 0, 0, 0]);
    }

    #[test]
    fn test_copy_immediate_waits_and_frees() {
        let device = HostDevice::new();
        let dst = device
            .create_buffer(4, BufferUsage::Uniform, "dst")
            .unwrap();

        copy_immediate(&*device, &[1, 2, 3, 4], &dst, 0).unwrap();

        let calls = device.calls();
        let submit = calls
            .iter()
            .position(|c| matches!(c, HostCall::Submit { .. }))
            .unwrap();
        let idle = calls
            .iter()
            .position(|c| *c == HostCall::QueueWaitIdle)
            .unwrap();
        assert!(submit < idle);
        assert_eq!(device.command_buffer_count(), 0);
    }

    #[test]
    fn test_copy_in_command_context_only_records() {
        let device = HostDevice::new();
        let src = device.create_staging(4, "src").unwrap();
        let dst = device
            .create_buffer(4, BufferUsage::Storage, "dst")
            .unwrap();
        device.write_staging(&src, 0, &[9, 9, 9, 9]).unwrap();
        let cmd = device.allocate_command_buffer().unwrap();

        copy_in_command_context(
            &*device,
            cmd,
            &src,
            &dst,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4,
            }],
        );

        assert!(device.calls().is_empty());
        assert_eq!(dst.read(), vec![0; 4]);

        device.submit(&Submission::commands_only(cmd)).unwrap();
        assert_eq!(dst.read(), vec![9; 4]);
    }

    #[test]
    #[should_panic(expected = "writes past the destination")]
    fn test_out_of_bounds_region_panics() {
        let device = HostDevice::new();
        let dst = device
            .create_buffer(4, BufferUsage::Storage, "dst")
            .unwrap();
        let _ = copy_immediate(&*device, &[1, 2, 3], &dst, 2);
    }

    #[test]
    fn test_one_shot_frees_on_record_error() {
        let device = HostDevice::new();
        let result = one_shot(&*device, |_| Err(crate::RhiError::NoSuitableGpu));
        assert!(result.is_err());
        assert_eq!(device.command_buffer_count(), 0);
    }
}
