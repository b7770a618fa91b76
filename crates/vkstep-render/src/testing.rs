//! In-memory backend for unit tests.
//!
//! Every device call is logged. Fences and pending command buffers are
//! simulated: work completes when its fence is waited on or the device is
//! idled. Submitted commands run against a color model where each image holds
//! a single packed RGBA8 value, so readbacks observe submitted clears and copies.

use crate::backend::{AcquireOutcome, FrameResources, RenderBackend, Submission};
use crate::encoder::{
    AttachmentClear, CommandEncoder, ImageBlit, ImageCopy, ImageTransition, RenderingTarget,
};
use crate::error::{RenderError, Result};
use crate::framebuffer::{Framebuffer, ImageDesc, RenderImage};
use crate::manager::SwapchainImages;
use crate::step::{RenderCommand, RenderPassAction};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use vkstep_gpu::{FrameSync, GpuImage, PresentStatus};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0x1000);

fn handle<T: Handle>() -> T {
    T::from_raw(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn fake_image(
    format: vk::Format,
    width: u32,
    height: u32,
    aspect: vk::ImageAspectFlags,
) -> RenderImage {
    let memory = GpuImage {
        image: handle(),
        allocation: None,
        format,
        extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
    };
    RenderImage::new(memory, handle(), aspect)
}

/// RGBA8 color plus D24S8 depth framebuffer with fake handles.
pub(crate) fn fake_framebuffer(width: u32, height: u32) -> Framebuffer {
    Framebuffer::new(
        width,
        height,
        fake_image(vk::Format::R8G8B8A8_UNORM, width, height, vk::ImageAspectFlags::COLOR),
        fake_image(
            vk::Format::D24_UNORM_S8_UINT,
            width,
            height,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        ),
    )
}

pub(crate) fn fake_swapchain(count: usize, width: u32, height: u32) -> SwapchainImages {
    SwapchainImages {
        swapchain: handle(),
        images: (0..count).map(|_| handle()).collect(),
        views: (0..count).map(|_| handle()).collect(),
        format: vk::Format::B8G8R8A8_UNORM,
        extent: vk::Extent2D { width, height },
    }
}

/// A command recorded through an encoder.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Transition(ImageTransition),
    BeginRendering(RenderingTarget),
    EndRendering,
    ClearAttachments(AttachmentClear),
    Execute(RenderCommand),
    CopyImage(ImageCopy),
    BlitImage(ImageBlit),
    CopyImageToBuffer {
        image: vk::Image,
        buffer: vk::Buffer,
        region: vk::BufferImageCopy,
    },
}

impl CommandEncoder for Vec<Op> {
    fn transition(&mut self, transition: &ImageTransition) {
        self.push(Op::Transition(*transition));
    }

    fn begin_rendering(&mut self, target: &RenderingTarget) {
        self.push(Op::BeginRendering(*target));
    }

    fn end_rendering(&mut self) {
        self.push(Op::EndRendering);
    }

    fn clear_attachments(&mut self, clear: &AttachmentClear) {
        self.push(Op::ClearAttachments(*clear));
    }

    fn execute(&mut self, command: &RenderCommand) {
        self.push(Op::Execute(command.clone()));
    }

    fn copy_image(&mut self, copy: &ImageCopy) {
        self.push(Op::CopyImage(*copy));
    }

    fn blit_image(&mut self, blit: &ImageBlit) {
        self.push(Op::BlitImage(*blit));
    }

    fn copy_image_to_buffer(
        &mut self,
        image: vk::Image,
        buffer: vk::Buffer,
        region: &vk::BufferImageCopy,
    ) {
        self.push(Op::CopyImageToBuffer {
            image,
            buffer,
            region: *region,
        });
    }
}

/// A device-level call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    BeginFrame(usize),
    EndFrame,
    Acquire(vk::Semaphore),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
        fence: Option<vk::Fence>,
    },
    Present(u32),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    WaitIdle,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    /// Sequence number of the submission the fence is attached to.
    submitted_at: Option<u64>,
}

#[derive(Debug, Default)]
struct MockState {
    frame: usize,
    events: Vec<Event>,
    executed: Vec<Op>,
    resources: Vec<FrameResources>,
    fences: HashMap<vk::Fence, FenceState>,
    recording: HashMap<vk::CommandBuffer, Vec<Op>>,
    ended: HashMap<vk::CommandBuffer, Vec<Op>>,
    /// Submitted command buffers with their submission sequence number.
    pending: HashMap<vk::CommandBuffer, u64>,
    next_submit: u64,
    swapchain: vk::SwapchainKHR,
    swapchain_len: u32,
    next_image: u32,
    acquire_out_of_date: bool,
    present_status: Option<PresentStatus>,
    present_error: Option<vk::Result>,
    view_images: HashMap<vk::ImageView, vk::Image>,
    colors: HashMap<vk::Image, u32>,
    readback: Option<(vk::Buffer, u64)>,
    readback_data: Vec<u8>,
    deletions: Vec<Vec<vk::Image>>,
    destroyed_images: Vec<vk::Image>,
}

impl MockState {
    /// Complete every submission up to and including `seq`.
    fn retire_through(&mut self, seq: u64) {
        self.pending.retain(|_, submitted| *submitted > seq);
        for fence in self.fences.values_mut() {
            if fence.submitted_at.is_some_and(|submitted| submitted <= seq) {
                fence.signaled = true;
                fence.submitted_at = None;
            }
        }
    }

    fn execute(&mut self, ops: &[Op]) {
        let mut target = None;
        for op in ops {
            match op {
                Op::BeginRendering(rendering) => {
                    target = self.view_images.get(&rendering.color_view).copied();
                    if let (Some(image), RenderPassAction::Clear) = (target, rendering.color_load) {
                        self.colors.insert(image, rendering.clear.color);
                    }
                }
                Op::ClearAttachments(clear) if clear.mask.contains(vk::ImageAspectFlags::COLOR) => {
                    if let Some(image) = target {
                        self.colors.insert(image, clear.values.color);
                    }
                }
                Op::EndRendering => target = None,
                Op::CopyImage(ImageCopy { src, dst, .. }) | Op::BlitImage(ImageBlit { src, dst, .. }) => {
                    let color = self.colors.get(src).copied().unwrap_or_default();
                    self.colors.insert(*dst, color);
                }
                Op::CopyImageToBuffer { image, region, .. } => {
                    let color = self.colors.get(image).copied().unwrap_or_default();
                    let texels = region.image_extent.width * region.image_extent.height;
                    self.readback_data = (0..texels).flat_map(|_| color.to_le_bytes()).collect();
                }
                _ => {}
            }
        }
    }
}

/// Test double for [`RenderBackend`].
#[derive(Debug)]
pub(crate) struct MockBackend {
    frames: usize,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            state: Mutex::new(MockState {
                deletions: vec![Vec::new(); frames],
                ..MockState::default()
            }),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Commands of every submission so far, in submission order.
    pub fn executed(&self) -> Vec<Op> {
        self.state.lock().executed.clone()
    }

    pub fn submits(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, Event::Submit { .. }))
            .collect()
    }

    pub fn frame_resources(&self) -> Vec<FrameResources> {
        self.state.lock().resources.clone()
    }

    pub fn destroyed_images(&self) -> Vec<vk::Image> {
        self.state.lock().destroyed_images.clone()
    }

    pub fn color_of(&self, image: vk::Image) -> Option<u32> {
        self.state.lock().colors.get(&image).copied()
    }

    pub fn set_acquire_out_of_date(&self, out_of_date: bool) {
        self.state.lock().acquire_out_of_date = out_of_date;
    }

    pub fn set_present_status(&self, status: PresentStatus) {
        self.state.lock().present_status = Some(status);
    }

    /// Make every following present fail with `error`.
    pub fn set_present_error(&self, error: Option<vk::Result>) {
        self.state.lock().present_error = error;
    }
}

/// Encoder appending to a command buffer of a [`MockBackend`].
pub(crate) struct MockEncoder<'a> {
    state: &'a Mutex<MockState>,
    cmd: vk::CommandBuffer,
}

impl MockEncoder<'_> {
    fn record(&mut self, op: Op) {
        let mut state = self.state.lock();
        let Some(ops) = state.recording.get_mut(&self.cmd) else {
            panic!("encoding into {:?}, which is not recording", self.cmd);
        };
        ops.push(op);
    }
}

impl CommandEncoder for MockEncoder<'_> {
    fn transition(&mut self, transition: &ImageTransition) {
        self.record(Op::Transition(*transition));
    }

    fn begin_rendering(&mut self, target: &RenderingTarget) {
        self.record(Op::BeginRendering(*target));
    }

    fn end_rendering(&mut self) {
        self.record(Op::EndRendering);
    }

    fn clear_attachments(&mut self, clear: &AttachmentClear) {
        self.record(Op::ClearAttachments(*clear));
    }

    fn execute(&mut self, command: &RenderCommand) {
        self.record(Op::Execute(command.clone()));
    }

    fn copy_image(&mut self, copy: &ImageCopy) {
        self.record(Op::CopyImage(*copy));
    }

    fn blit_image(&mut self, blit: &ImageBlit) {
        self.record(Op::BlitImage(*blit));
    }

    fn copy_image_to_buffer(
        &mut self,
        image: vk::Image,
        buffer: vk::Buffer,
        region: &vk::BufferImageCopy,
    ) {
        self.record(Op::CopyImageToBuffer {
            image,
            buffer,
            region: *region,
        });
    }
}

impl RenderBackend for MockBackend {
    type Encoder<'a> = MockEncoder<'a>;

    fn inflight_frames(&self) -> usize {
        self.frames
    }

    fn current_frame(&self) -> usize {
        self.state.lock().frame
    }

    fn begin_frame(&self) -> Result<()> {
        let mut state = self.state.lock();
        let frame = state.frame;
        state.events.push(Event::BeginFrame(frame));
        let deleted = std::mem::take(&mut state.deletions[frame]);
        state.destroyed_images.extend(deleted);
        Ok(())
    }

    fn end_frame(&self) {
        let mut state = self.state.lock();
        state.frame = (state.frame + 1) % self.frames;
        state.events.push(Event::EndFrame);
    }

    fn create_frame_resources(&self) -> Result<FrameResources> {
        let resources = FrameResources {
            setup_pool: handle(),
            setup_cmd: handle(),
            main_pool: handle(),
            main_cmd: handle(),
            sync: FrameSync {
                image_available: handle(),
                render_finished: handle(),
                in_flight: handle(),
            },
        };
        let mut state = self.state.lock();
        state.fences.insert(
            resources.sync.in_flight,
            FenceState {
                signaled: true,
                submitted_at: None,
            },
        );
        state.resources.push(resources);
        Ok(resources)
    }

    fn destroy_frame_resources(&self, resources: &FrameResources) {
        let state = self.state.lock();
        assert!(
            !state.pending.contains_key(&resources.main_cmd)
                && !state.pending.contains_key(&resources.setup_cmd),
            "frame resources destroyed while in use"
        );
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::WaitFence(fence));
        let fence_state = state.fences.get(&fence).expect("unknown fence");
        let (submitted_at, signaled) = (fence_state.submitted_at, fence_state.signaled);
        match submitted_at {
            Some(seq) => state.retire_through(seq),
            None => assert!(signaled, "waiting on a fence nothing will signal"),
        }
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::ResetFence(fence));
        let fence_state = state.fences.get_mut(&fence).expect("unknown fence");
        assert!(
            fence_state.submitted_at.is_none(),
            "fence reset while its submission is pending"
        );
        fence_state.signaled = false;
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        assert!(
            !state.pending.contains_key(&cmd),
            "command buffer {cmd:?} re-begun while its submission is pending"
        );
        assert!(
            !state.recording.contains_key(&cmd),
            "command buffer {cmd:?} begun twice"
        );
        state.ended.remove(&cmd);
        state.recording.insert(cmd, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let ops = state
            .recording
            .remove(&cmd)
            .expect("ending a command buffer that is not recording");
        state.ended.insert(cmd, ops);
        Ok(())
    }

    fn encoder(&self, cmd: vk::CommandBuffer) -> MockEncoder<'_> {
        MockEncoder {
            state: &self.state,
            cmd,
        }
    }

    fn attach_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchain = swapchain;
        state.next_image = 0;
        if state.swapchain_len == 0 {
            state.swapchain_len = 3;
        }
    }

    fn acquire_next_image(&self, signal: vk::Semaphore, _timeout_ns: u64) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        if state.swapchain == vk::SwapchainKHR::null() || state.acquire_out_of_date {
            return Ok(AcquireOutcome::OutOfDate);
        }
        state.events.push(Event::Acquire(signal));
        let index = state.next_image;
        state.next_image = (index + 1) % state.swapchain_len;
        Ok(AcquireOutcome::Image(index))
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<()> {
        let mut state = self.state.lock();
        let seq = state.next_submit;
        state.next_submit += 1;
        for cmd in submission.command_buffers {
            let ops = state
                .ended
                .remove(cmd)
                .expect("submitting a command buffer that was not ended");
            assert!(
                state.pending.insert(*cmd, seq).is_none(),
                "command buffer {cmd:?} submitted twice"
            );
            state.execute(&ops);
            state.executed.extend(ops);
        }
        if let Some(fence) = submission.fence {
            let fence_state = state.fences.get_mut(&fence).expect("unknown fence");
            assert!(
                !fence_state.signaled && fence_state.submitted_at.is_none(),
                "submitted with a fence that was not reset"
            );
            fence_state.submitted_at = Some(seq);
        }
        state.events.push(Event::Submit {
            command_buffers: submission.command_buffers.to_vec(),
            wait: submission.wait,
            signal: submission.signal,
            fence: submission.fence,
        });
        Ok(())
    }

    fn present(&self, image_index: u32, _wait: vk::Semaphore) -> Result<PresentStatus> {
        let mut state = self.state.lock();
        state.events.push(Event::Present(image_index));
        if let Some(error) = state.present_error {
            return Err(error.into());
        }
        Ok(state.present_status.unwrap_or(PresentStatus::Optimal))
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::WaitIdle);
        if let Some(last) = state.next_submit.checked_sub(1) {
            state.retire_through(last);
        }
        Ok(())
    }

    fn depth_stencil_format(&self) -> Result<vk::Format> {
        Ok(vk::Format::D24_UNORM_S8_UINT)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<RenderImage> {
        let image = fake_image(desc.format, desc.width, desc.height, desc.aspect());
        self.state
            .lock()
            .view_images
            .insert(image.view(), image.image());
        Ok(image)
    }

    fn queue_delete_image(&self, image: RenderImage) {
        let mut state = self.state.lock();
        let frame = state.frame;
        state.deletions[frame].push(image.image());
    }

    fn readback_buffer(&self, size: u64) -> Result<vk::Buffer> {
        let mut state = self.state.lock();
        match state.readback {
            Some((buffer, capacity)) if capacity >= size => Ok(buffer),
            _ => {
                let buffer = handle();
                state.readback = Some((buffer, size));
                Ok(buffer)
            }
        }
    }

    fn read_readback(&self, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        if state.readback.is_none() {
            return Err(RenderError::NoReadback);
        }
        Ok(state.readback_data[..len].to_vec())
    }
}

/// Register a swapchain's views with the color model.
pub(crate) fn register_swapchain(backend: &MockBackend, swapchain: &SwapchainImages) {
    let mut state = backend.state.lock();
    for (view, image) in swapchain.views.iter().zip(&swapchain.images) {
        state.view_images.insert(*view, *image);
    }
    state.swapchain_len = swapchain.images.len() as u32;
}
