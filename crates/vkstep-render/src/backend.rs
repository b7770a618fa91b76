//! Device side of the backend seam.
//!
//! The render manager drives the GPU exclusively through [`RenderBackend`].
//! [`VulkanBackend`] implements it on top of a [`GpuContext`].

use crate::encoder::{full_range, CommandEncoder, VulkanEncoder};
use crate::error::{RenderError, Result};
use crate::framebuffer::{ImageDesc, RenderImage};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vkstep_gpu::command::{begin_command_buffer, end_command_buffer, submit, SlotCommands};
use vkstep_gpu::swapchain::{acquire_next_image, present_image};
use vkstep_gpu::sync::{reset_fence, wait_for_fence};
use vkstep_gpu::{FrameSync, GpuBuffer, GpuContext, PresentStatus};

/// Command and synchronization handles of one frame slot.
#[derive(Debug, Clone, Copy)]
pub struct FrameResources {
    pub setup_pool: vk::CommandPool,
    pub setup_cmd: vk::CommandBuffer,
    pub main_pool: vk::CommandPool,
    pub main_cmd: vk::CommandBuffer,
    pub sync: FrameSync,
}

/// Result of a swapchain image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    /// The surface changed; no image was acquired and nothing will be signaled.
    OutOfDate,
}

/// One queue submission.
///
/// The wait semaphore blocks every stage of the batch.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait: Option<vk::Semaphore>,
    pub signal: Option<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

/// Device services the render manager needs.
pub trait RenderBackend: Send + Sync + 'static {
    type Encoder<'a>: CommandEncoder
    where
        Self: 'a;

    /// Number of frame slots.
    fn inflight_frames(&self) -> usize;

    /// Index of the frame slot being recorded.
    fn current_frame(&self) -> usize;

    /// Run deferred deletions of the current slot. Call after its fence wait.
    fn begin_frame(&self) -> Result<()>;

    /// Advance the frame index.
    fn end_frame(&self);

    fn create_frame_resources(&self) -> Result<FrameResources>;

    /// Destroy a slot's resources. The device must be idle.
    fn destroy_frame_resources(&self, resources: &FrameResources);

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Begin one-time-submit recording.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Encoder recording into `cmd`, which must be in the recording state.
    fn encoder(&self, cmd: vk::CommandBuffer) -> Self::Encoder<'_>;

    /// Use `swapchain` for acquisition and presentation. A null handle detaches.
    fn attach_swapchain(&self, swapchain: vk::SwapchainKHR);

    fn acquire_next_image(&self, signal: vk::Semaphore, timeout_ns: u64) -> Result<AcquireOutcome>;

    fn submit(&self, submission: &Submission<'_>) -> Result<()>;

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus>;

    fn wait_idle(&self) -> Result<()>;

    fn depth_stencil_format(&self) -> Result<vk::Format>;

    /// Create a device-local image and its view in `UNDEFINED` layout.
    fn create_image(&self, desc: &ImageDesc) -> Result<RenderImage>;

    /// Destroy `image` once the current frame slot retires.
    fn queue_delete_image(&self, image: RenderImage);

    /// Host-readable transfer destination of at least `size` bytes.
    fn readback_buffer(&self, size: u64) -> Result<vk::Buffer>;

    /// First `len` bytes of the readback buffer.
    fn read_readback(&self, len: usize) -> Result<Vec<u8>>;
}

/// [`RenderBackend`] backed by a Vulkan [`GpuContext`].
pub struct VulkanBackend {
    gpu: Arc<GpuContext>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: Mutex<vk::SwapchainKHR>,
    /// Serializes access to the graphics queue.
    queue_lock: Mutex<()>,
    readback: Mutex<Option<GpuBuffer>>,
}

impl VulkanBackend {
    pub fn new(gpu: Arc<GpuContext>) -> Self {
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());
        Self {
            gpu,
            swapchain_loader,
            swapchain: Mutex::new(vk::SwapchainKHR::null()),
            queue_lock: Mutex::new(()),
            readback: Mutex::new(None),
        }
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    fn device(&self) -> &ash::Device {
        self.gpu.device()
    }

    fn create_commands(&self) -> Result<SlotCommands> {
        Ok(unsafe { SlotCommands::new(self.device(), self.gpu.graphics_queue_family()) }?)
    }
}

impl RenderBackend for VulkanBackend {
    type Encoder<'a> = VulkanEncoder<'a>;

    fn inflight_frames(&self) -> usize {
        self.gpu.inflight_frames()
    }

    fn current_frame(&self) -> usize {
        self.gpu.current_frame()
    }

    fn begin_frame(&self) -> Result<()> {
        Ok(self.gpu.begin_frame()?)
    }

    fn end_frame(&self) {
        self.gpu.end_frame();
    }

    fn create_frame_resources(&self) -> Result<FrameResources> {
        let device = self.device();
        let setup = self.create_commands()?;
        let main = match self.create_commands() {
            Ok(main) => main,
            Err(e) => {
                unsafe { setup.destroy(device) };
                return Err(e);
            }
        };
        let sync = match unsafe { FrameSync::new(device) } {
            Ok(sync) => sync,
            Err(e) => {
                unsafe {
                    setup.destroy(device);
                    main.destroy(device);
                }
                return Err(e.into());
            }
        };
        Ok(FrameResources {
            setup_pool: setup.pool,
            setup_cmd: setup.cmd,
            main_pool: main.pool,
            main_cmd: main.cmd,
            sync,
        })
    }

    fn destroy_frame_resources(&self, resources: &FrameResources) {
        let device = self.device();
        unsafe {
            resources.sync.destroy(device);
            device.destroy_command_pool(resources.setup_pool, None);
            device.destroy_command_pool(resources.main_pool, None);
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        Ok(unsafe { wait_for_fence(self.device(), fence, timeout_ns) }?)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { reset_fence(self.device(), fence) }?)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { begin_command_buffer(self.device(), cmd) }?)
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { end_command_buffer(self.device(), cmd) }?)
    }

    fn encoder(&self, cmd: vk::CommandBuffer) -> VulkanEncoder<'_> {
        VulkanEncoder::new(self.device(), cmd)
    }

    fn attach_swapchain(&self, swapchain: vk::SwapchainKHR) {
        *self.swapchain.lock() = swapchain;
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn acquire_next_image(&self, signal: vk::Semaphore, timeout_ns: u64) -> Result<AcquireOutcome> {
        let swapchain = *self.swapchain.lock();
        if swapchain == vk::SwapchainKHR::null() {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let _queue = self.queue_lock.lock();
        let acquired =
            unsafe { acquire_next_image(&self.swapchain_loader, swapchain, signal, timeout_ns) }?;
        Ok(match acquired {
            Some((index, suboptimal)) => {
                if suboptimal {
                    debug!(index, "Acquired image from suboptimal swapchain");
                }
                AcquireOutcome::Image(index)
            }
            None => AcquireOutcome::OutOfDate,
        })
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<()> {
        let _queue = self.queue_lock.lock();
        unsafe {
            submit(
                self.device(),
                self.gpu.graphics_queue(),
                submission.command_buffers,
                submission.wait,
                submission.signal,
                submission.fence.unwrap_or_default(),
            )?;
        }
        Ok(())
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus> {
        let swapchain = *self.swapchain.lock();
        let _queue = self.queue_lock.lock();
        let status = unsafe {
            present_image(
                &self.swapchain_loader,
                self.gpu.graphics_queue(),
                swapchain,
                image_index,
                &[wait],
            )
        }?;
        if status != PresentStatus::Optimal {
            warn!(?status, "Swapchain needs recreation");
        }
        Ok(status)
    }

    fn wait_idle(&self) -> Result<()> {
        let _queue = self.queue_lock.lock();
        Ok(self.gpu.wait_idle()?)
    }

    fn depth_stencil_format(&self) -> Result<vk::Format> {
        Ok(self.gpu.depth_stencil_format()?)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<RenderImage> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(desc.extent())
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let memory =
            self.gpu
                .allocator()
                .lock()
                .create_image(&create_info, MemoryLocation::GpuOnly, &desc.name)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(memory.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(full_range(desc.aspect()));
        let view = match unsafe { self.device().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                self.gpu.queue_delete_image(memory);
                return Err(e.into());
            }
        };

        debug!(
            name = %desc.name,
            width = desc.width,
            height = desc.height,
            format = ?desc.format,
            "Created render image"
        );
        Ok(RenderImage::new(memory, view, desc.aspect()))
    }

    fn queue_delete_image(&self, image: RenderImage) {
        let (memory, view) = image.into_parts();
        self.gpu.queue_delete_image_view(view);
        self.gpu.queue_delete_image(memory);
    }

    fn readback_buffer(&self, size: u64) -> Result<vk::Buffer> {
        let mut readback = self.readback.lock();
        if let Some(buffer) = readback.as_ref().filter(|b| b.size >= size) {
            return Ok(buffer.buffer);
        }

        let buffer = self.gpu.allocator().lock().create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback",
        )?;
        info!(size, "Readback buffer resized");
        let handle = buffer.buffer;
        if let Some(old) = readback.replace(buffer) {
            self.gpu.queue_delete_buffer(old);
        }
        Ok(handle)
    }

    fn read_readback(&self, len: usize) -> Result<Vec<u8>> {
        let readback = self.readback.lock();
        let buffer = readback.as_ref().ok_or(RenderError::NoReadback)?;
        Ok(buffer.read_bytes(0, len)?)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Some(buffer) = self.readback.get_mut().take() {
            self.gpu.queue_delete_buffer(buffer);
        }
    }
}
