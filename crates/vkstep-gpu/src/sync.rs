//! Frame slot synchronization.

use crate::error::{GpuError, Result};
use ash::vk;

/// Synchronization handles owned by one frame slot.
///
/// The fence starts signaled so the first wait on a fresh slot returns
/// immediately.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready to be rendered to.
    pub image_available: vk::Semaphore,
    /// Signaled when the slot's main command buffer has finished.
    pub render_finished: vk::Semaphore,
    /// Signaled when all of the slot's submitted work has retired.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = device.create_semaphore(&semaphore_info, None)?;
        let render_finished = match device.create_semaphore(&semaphore_info, None) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                return Err(e.into());
            }
        };
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = match device.create_fence(&fence_info, None) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                device.destroy_semaphore(render_finished, None);
                return Err(e.into());
            }
        };
        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// # Safety
    /// None of the handles may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// Block until `fence` is signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    match device.wait_for_fences(&[fence], true, timeout_ns) {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::FenceTimeout { timeout_ns }),
        Err(e) => Err(e.into()),
    }
}

/// # Safety
/// The fence must not be associated with a pending submission.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}
