//! Per-slot command buffers and queue submission.

use crate::error::Result;
use ash::vk;

/// A resettable command pool holding exactly one primary command buffer.
///
/// Each frame slot owns two of these: one for setup work submitted ahead of
/// the frame and one for the frame's main work.
#[derive(Debug, Clone, Copy)]
pub struct SlotCommands {
    pub pool: vk::CommandPool,
    pub cmd: vk::CommandBuffer,
}

impl SlotCommands {
    /// Create the pool on `queue_family` and allocate its buffer.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = device.create_command_pool(&create_info, None)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        match device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => Ok(Self {
                pool,
                cmd: buffers[0],
            }),
            Err(e) => {
                device.destroy_command_pool(pool, None);
                Err(e.into())
            }
        }
    }

    /// Destroy the pool and its buffer.
    ///
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin one-time-submit recording. Implicitly resets `cmd`.
///
/// # Safety
/// `cmd` must come from a pool created with `RESET_COMMAND_BUFFER` and must
/// not be pending execution.
pub unsafe fn begin_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// # Safety
/// `cmd` must be in the recording state.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit `command_buffers` in order with `vkQueueSubmit2`.
///
/// `wait` blocks every stage of the batch, so layout transitions out of
/// `UNDEFINED` on an acquired image are ordered after the acquire. `signal`
/// fires once all commands complete. A null `fence` submits without one.
///
/// # Safety
/// All handles must be valid and access to `queue` must be externally
/// synchronized.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait: Option<vk::Semaphore>,
    signal: Option<vk::Semaphore>,
    fence: vk::Fence,
) -> Result<()> {
    let buffers: Vec<_> = command_buffers
        .iter()
        .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
        .collect();
    let waits: Vec<_> = wait
        .into_iter()
        .map(|semaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        })
        .collect();
    let signals: Vec<_> = signal
        .into_iter()
        .map(|semaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        })
        .collect();

    let submit_info = vk::SubmitInfo2::default()
        .command_buffer_infos(&buffers)
        .wait_semaphore_infos(&waits)
        .signal_semaphore_infos(&signals);
    device.queue_submit2(queue, &[submit_info], fence)?;
    Ok(())
}
