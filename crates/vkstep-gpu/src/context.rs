//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::deferred::DeferredDeletionQueue;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default number of frames the CPU may record ahead of the GPU.
pub const DEFAULT_INFLIGHT_FRAMES: usize = 2;
/// Upper bound on frames in flight.
pub const MAX_INFLIGHT_FRAMES: usize = 3;

/// Main GPU context holding Vulkan resources.
///
/// Besides the device it tracks the frame index that the render manager
/// cycles its frame slots by, and the per-slot deferred deletion lists.
pub struct GpuContext {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,

    pub(crate) inflight_frames: usize,
    pub(crate) current_frame: AtomicUsize,
    pub(crate) deletions: Mutex<DeferredDeletionQueue>,
}

impl GpuContext {
    /// Loaded Vulkan library.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// The single queue all frames are submitted and presented on.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Preferred depth-stencil attachment format.
    pub fn depth_stencil_format(&self) -> Result<vk::Format> {
        self.capabilities
            .depth_stencil_format
            .ok_or(GpuError::NoDepthStencilFormat)
    }

    /// Number of frame slots in flight.
    pub fn inflight_frames(&self) -> usize {
        self.inflight_frames
    }

    /// Index of the frame slot currently being recorded.
    pub fn current_frame(&self) -> usize {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Run the deferred deletions queued against the current frame slot.
    ///
    /// Call only after the slot's fence has been waited on.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&self) -> Result<()> {
        let slot = self.current_frame();
        let list = self.deletions.lock().take_slot(slot);
        if list.is_empty() {
            return Ok(());
        }
        tracing::trace!(slot, count = list.len(), "Performing deferred deletions");
        let mut allocator = self.allocator.lock();
        unsafe { list.perform(&self.device, &mut allocator) }
    }

    /// Advance to the next frame slot.
    pub fn end_frame(&self) {
        let next = (self.current_frame() + 1) % self.inflight_frames;
        self.current_frame.store(next, Ordering::Release);
    }

    /// Destroy `view` once the current frame slot retires.
    pub fn queue_delete_image_view(&self, view: vk::ImageView) {
        let slot = self.current_frame();
        self.deletions.lock().queue_image_view(slot, view);
    }

    /// Free `image` once the current frame slot retires.
    pub fn queue_delete_image(&self, image: GpuImage) {
        let slot = self.current_frame();
        self.deletions.lock().queue_image(slot, image);
    }

    /// Free `buffer` once the current frame slot retires.
    pub fn queue_delete_buffer(&self, buffer: GpuBuffer) {
        let slot = self.current_frame();
        self.deletions.lock().queue_buffer(slot, buffer);
    }

    /// Number of resources waiting for deferred deletion.
    pub fn pending_deletions(&self) -> usize {
        self.deletions.lock().pending_count()
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let pending = self.deletions.get_mut().take_all();
            if let Err(e) = pending.perform(&self.device, self.allocator.get_mut()) {
                tracing::error!("Failed to flush deferred deletions: {e}");
            }

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.get_mut().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    inflight_frames: usize,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "vkstep".to_string(),
            enable_validation: cfg!(debug_assertions),
            inflight_frames: DEFAULT_INFLIGHT_FRAMES,
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Request `VK_LAYER_KHRONOS_validation`. Defaults to on in debug builds.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Set the number of frames in flight, clamped to `1..=3`.
    pub fn inflight_frames(mut self, count: usize) -> Self {
        self.inflight_frames = clamp_inflight_frames(count);
        self
    }

    /// Load Vulkan, pick a device and open it with one graphics queue.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }?;
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;
        let opened = match unsafe { open_device(&instance) } {
            Ok(opened) => opened,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        tracing::info!(
            gpu = %opened.capabilities.summary(),
            inflight_frames = self.inflight_frames,
            "GPU context ready"
        );

        Ok(GpuContext {
            entry,
            instance,
            physical_device: opened.physical_device,
            device: opened.device,
            capabilities: opened.capabilities,
            allocator: Mutex::new(opened.allocator),
            graphics_queue_family: opened.graphics_queue_family,
            graphics_queue: opened.graphics_queue,
            inflight_frames: self.inflight_frames,
            current_frame: AtomicUsize::new(0),
            deletions: Mutex::new(DeferredDeletionQueue::new(self.inflight_frames)),
        })
    }
}

struct OpenedDevice {
    physical_device: vk::PhysicalDevice,
    capabilities: GpuCapabilities,
    device: Arc<ash::Device>,
    allocator: GpuAllocator,
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,
}

/// # Safety
/// The instance must be valid. On error nothing created here is left alive.
unsafe fn open_device(instance: &ash::Instance) -> Result<OpenedDevice> {
    let physical_device = select_physical_device(instance)?;
    let capabilities = GpuCapabilities::query(instance, physical_device);
    if !capabilities.meets_requirements() {
        tracing::warn!("Rejected GPU: {}", capabilities.summary());
        return Err(GpuError::NoSuitableDevice);
    }

    let graphics_queue_family = find_graphics_queue_family(instance, physical_device)?;
    let (device, graphics_queue) = create_device(instance, physical_device, graphics_queue_family)?;
    let device = Arc::new(device);
    let allocator = match GpuAllocator::new(instance, device.clone(), physical_device) {
        Ok(allocator) => allocator,
        Err(e) => {
            device.destroy_device(None);
            return Err(e);
        }
    };

    Ok(OpenedDevice {
        physical_device,
        capabilities,
        device,
        allocator,
        graphics_queue_family,
        graphics_queue,
    })
}

fn clamp_inflight_frames(count: usize) -> usize {
    count.clamp(1, MAX_INFLIGHT_FRAMES)
}

/// Find the first queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

const DEVICE_EXTENSIONS: [&CStr; 1] = [ash::khr::swapchain::NAME];

/// Create the logical device and retrieve the graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names = DEVICE_EXTENSIONS.map(CStr::as_ptr);

    // Dynamic rendering replaces render pass objects; synchronization2 backs every barrier
    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let mut features2 =
        vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance.create_device(physical_device, &device_create_info, None)?;
    let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

    Ok((device, graphics_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_frames_are_clamped() {
        assert_eq!(clamp_inflight_frames(0), 1);
        assert_eq!(clamp_inflight_frames(2), 2);
        assert_eq!(clamp_inflight_frames(8), MAX_INFLIGHT_FRAMES);
        assert_eq!(
            GpuContextBuilder::new().inflight_frames(5).inflight_frames,
            MAX_INFLIGHT_FRAMES
        );
        assert_eq!(
            GpuContextBuilder::default().inflight_frames,
            DEFAULT_INFLIGHT_FRAMES
        );
    }
}
