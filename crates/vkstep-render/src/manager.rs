//! The render manager: the public face of step recording and frame pacing.

use crate::backend::{FrameResources, RenderBackend};
use crate::config::RenderManagerConfig;
use crate::encoder::{CommandEncoder, ImageTransition};
use crate::error::Result;
use crate::frame::{flush, run_frame, FrameOutcome, FrameSlot, FrameState, Shared};
use crate::framebuffer::{check_initial_layout, Framebuffer, ImageDesc, RenderImage};
use crate::queue_runner::Backbuffer;
use crate::readback::{check_conversion, DataFormat};
use crate::recorder::StepRecorder;
use crate::step::{ClearValues, DrawCommand, DrawIndexedCommand, RenderPassAction};
use crate::worker::{FrameBatch, FrameWorker};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace};
use vkstep_gpu::Swapchain;

/// The swapchain state backbuffer steps render into.
#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl From<&Swapchain> for SwapchainImages {
    fn from(swapchain: &Swapchain) -> Self {
        Self {
            swapchain: swapchain.swapchain,
            images: swapchain.images.clone(),
            views: swapchain.image_views.clone(),
            format: swapchain.format,
            extent: swapchain.extent,
        }
    }
}

/// Records frames as steps and turns them into GPU work at frame end.
///
/// A frame is `begin_frame`, any number of recording calls, then `finish`.
/// Frame slots are reused round-robin; `begin_frame` blocks until the slot's
/// previous submission has retired.
pub struct RenderManager<B: RenderBackend> {
    shared: Arc<Shared<B>>,
    recorder: Mutex<StepRecorder>,
    worker: Option<FrameWorker>,
    inside_frame: bool,
    frame_count: u64,
    /// Worst surface outcome reported by the worker since the last `finish`.
    surface_issue: Option<FrameOutcome>,
    /// Images released between frames, handed to deferred deletion at the next `begin_frame`.
    orphaned_images: Vec<RenderImage>,
}

fn note_outcome(issue: &mut Option<FrameOutcome>, outcome: FrameOutcome) {
    match outcome {
        FrameOutcome::OutOfDate => *issue = Some(outcome),
        FrameOutcome::Suboptimal if issue.is_none() => *issue = Some(outcome),
        _ => {}
    }
}

impl<B: RenderBackend> RenderManager<B> {
    /// Create one frame slot per in-flight frame and, in threaded mode, start the worker.
    pub fn new(backend: B, config: RenderManagerConfig) -> Result<Self> {
        let frames = backend.inflight_frames();
        let mut resources: Vec<FrameResources> = Vec::with_capacity(frames);
        for _ in 0..frames {
            match backend.create_frame_resources() {
                Ok(created) => resources.push(created),
                Err(e) => {
                    for created in &resources {
                        backend.destroy_frame_resources(created);
                    }
                    return Err(e);
                }
            }
        }

        let threaded = config.is_threaded();
        let worker_name = config.worker_name.clone();
        let slots = resources.into_iter().map(FrameSlot::new).collect();
        let shared = Arc::new(Shared::new(backend, slots, config));
        let worker = if threaded {
            Some(FrameWorker::spawn(shared.clone(), &worker_name)?)
        } else {
            None
        };
        info!(frames, threaded, "Render manager created");

        Ok(Self {
            shared,
            recorder: Mutex::new(StepRecorder::new()),
            worker,
            inside_frame: false,
            frame_count: 0,
            surface_issue: None,
            orphaned_images: Vec::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn config(&self) -> &RenderManagerConfig {
        &self.shared.config
    }

    /// Index of the frame slot being recorded.
    pub fn current_frame(&self) -> usize {
        self.shared.backend.current_frame()
    }

    pub fn frame_state(&self, slot: usize) -> FrameState {
        self.shared.slots[slot].lock().state
    }

    /// Whether `begin_frame` has been called without a matching `finish`.
    pub fn is_inside_frame(&self) -> bool {
        self.inside_frame
    }

    /// Size of the current render target.
    pub fn render_area(&self) -> (u32, u32) {
        self.recorder.lock().render_area()
    }

    fn release_image(&mut self, image: RenderImage) {
        if self.inside_frame {
            self.shared.backend.queue_delete_image(image);
        } else {
            self.orphaned_images.push(image);
        }
    }

    fn drain_worker(&mut self) -> Result<()> {
        if let Some(worker) = &mut self.worker {
            for outcome in worker.drain()? {
                note_outcome(&mut self.surface_issue, outcome);
            }
        }
        Ok(())
    }

    /// Wait until `slot` may be reused by the CPU.
    fn ensure_slot_retired(&mut self, slot: usize) -> Result<()> {
        if let Some(worker) = &mut self.worker {
            if let Some(outcome) = worker.wait_fence_attached(slot)? {
                note_outcome(&mut self.surface_issue, outcome);
            }
        }
        let mut frame = self.shared.slots[slot].lock();
        if frame.state == FrameState::Submitted {
            self.shared.backend.wait_for_fence(
                frame.resources.sync.in_flight,
                self.shared.config.fence_timeout_ns,
            )?;
            frame.state = FrameState::Idle;
        }
        Ok(())
    }

    /// Command buffer for resource initialization, submitted before the frame's main work.
    pub fn setup_command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        let slot = self.current_frame();
        if !self.inside_frame {
            self.ensure_slot_retired(slot)?;
        }
        let mut frame = self.shared.slots[slot].lock();
        let cmd = frame.resources.setup_cmd;
        if !frame.has_setup_commands {
            self.shared.backend.begin_command_buffer(cmd)?;
            frame.has_setup_commands = true;
        }
        Ok(cmd)
    }

    /// Attach a swapchain: transition its images to present layout and create the shared depth buffer.
    pub fn create_backbuffers(&mut self, swapchain: &SwapchainImages) -> Result<()> {
        self.drain_worker()?;
        let backend = &self.shared.backend;
        let extent = swapchain.extent;
        let depth = backend.create_image(&ImageDesc::depth_stencil(
            "backbuffer depth",
            extent.width,
            extent.height,
            backend.depth_stencil_format()?,
        ))?;

        let cmd = match self.setup_command_buffer() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.release_image(depth);
                return Err(e);
            }
        };
        let backend = &self.shared.backend;
        {
            let mut encoder = backend.encoder(cmd);
            for &image in &swapchain.images {
                encoder.transition(&ImageTransition::new(
                    image,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                ));
            }
            depth.transition_to(&mut encoder, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        }

        backend.attach_swapchain(swapchain.swapchain);
        let previous = self.shared.runner.lock().set_backbuffer(Some(Backbuffer {
            images: swapchain.images.clone(),
            views: swapchain.views.clone(),
            format: swapchain.format,
            extent,
            depth,
        }));
        if let Some(previous) = previous {
            self.release_image(previous.depth);
        }
        self.recorder
            .get_mut()
            .set_backbuffer_size(extent.width, extent.height);
        info!(
            images = swapchain.images.len(),
            width = extent.width,
            height = extent.height,
            format = ?swapchain.format,
            "Backbuffers created"
        );
        Ok(())
    }

    /// Detach the swapchain. The device is idle on return, so the swapchain may be destroyed.
    pub fn destroy_backbuffers(&mut self) -> Result<()> {
        self.drain_worker()?;
        let backend = &self.shared.backend;
        backend.wait_idle()?;
        backend.attach_swapchain(vk::SwapchainKHR::null());
        let previous = self.shared.runner.lock().set_backbuffer(None);
        if let Some(previous) = previous {
            self.release_image(previous.depth);
        }
        self.recorder.get_mut().set_backbuffer_size(0, 0);
        info!("Backbuffers destroyed");
        Ok(())
    }

    /// Create a framebuffer with a `color_format` color image and a depth-stencil image.
    ///
    /// Both images start in attachment layout.
    pub fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        color_format: vk::Format,
    ) -> Result<Arc<Framebuffer>> {
        self.create_framebuffer_with_layout(
            width,
            height,
            color_format,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
    }

    /// Like [`Self::create_framebuffer`], with an explicit initial color layout.
    ///
    /// # Panics
    /// If `color_layout` is not color attachment or transfer destination.
    pub fn create_framebuffer_with_layout(
        &mut self,
        width: u32,
        height: u32,
        color_format: vk::Format,
        color_layout: vk::ImageLayout,
    ) -> Result<Arc<Framebuffer>> {
        check_initial_layout(color_layout);
        assert_ne!(
            color_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            "color image cannot start in depth-stencil layout"
        );
        let backend = &self.shared.backend;
        let color = backend.create_image(&ImageDesc::color("framebuffer color", width, height, color_format))?;
        let depth_format = match backend.depth_stencil_format() {
            Ok(format) => format,
            Err(e) => {
                self.release_image(color);
                return Err(e);
            }
        };
        let depth = match backend.create_image(&ImageDesc::depth_stencil(
            "framebuffer depth",
            width,
            height,
            depth_format,
        )) {
            Ok(depth) => depth,
            Err(e) => {
                self.release_image(color);
                return Err(e);
            }
        };

        let cmd = match self.setup_command_buffer() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.release_image(color);
                self.release_image(depth);
                return Err(e);
            }
        };
        {
            let mut encoder = self.shared.backend.encoder(cmd);
            color.transition_to(&mut encoder, color_layout);
            depth.transition_to(&mut encoder, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        }

        let framebuffer = Framebuffer::new(width, height, color, depth);
        info!(id = framebuffer.id(), width, height, format = ?color_format, "Framebuffer created");
        Ok(Arc::new(framebuffer))
    }

    /// Release a framebuffer. Its images are deleted once the GPU is done with them.
    ///
    /// # Panics
    /// If recorded steps or other owners still reference the framebuffer.
    pub fn destroy_framebuffer(&mut self, framebuffer: Arc<Framebuffer>) -> Result<()> {
        if Arc::strong_count(&framebuffer) > 1 {
            // The worker may still hold steps referencing it.
            self.drain_worker()?;
        }
        let framebuffer = match Arc::try_unwrap(framebuffer) {
            Ok(framebuffer) => framebuffer,
            Err(framebuffer) => panic!(
                "framebuffer {} destroyed while still referenced",
                framebuffer.id()
            ),
        };
        info!(id = framebuffer.id(), "Framebuffer destroyed");
        let (color, depth) = framebuffer.into_images();
        self.release_image(color);
        self.release_image(depth);
        Ok(())
    }

    /// Start recording a frame in the current slot.
    ///
    /// Blocks until the slot's previous submission has retired, then runs the
    /// slot's deferred deletions.
    ///
    /// # Panics
    /// If the previous frame was not finished.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&mut self) -> Result<()> {
        assert!(!self.inside_frame, "begin_frame called inside a frame");
        let slot = self.current_frame();
        self.ensure_slot_retired(slot)?;
        {
            let mut frame = self.shared.slots[slot].lock();
            self.shared
                .backend
                .reset_fence(frame.resources.sync.in_flight)?;
            frame.state = FrameState::Recording;
        }
        self.shared.backend.begin_frame()?;
        self.inside_frame = true;
        for image in std::mem::take(&mut self.orphaned_images) {
            self.shared.backend.queue_delete_image(image);
        }
        self.frame_count += 1;
        debug!(slot, frame = self.frame_count, "Frame begun");
        Ok(())
    }

    /// Start rendering into `target`, or into the backbuffer when `None`.
    pub fn bind_framebuffer_as_render_target(
        &self,
        target: Option<&Arc<Framebuffer>>,
        color: RenderPassAction,
        depth_stencil: RenderPassAction,
        clear: ClearValues,
    ) {
        assert!(self.inside_frame, "render target bound outside a frame");
        self.recorder
            .lock()
            .bind_render_target(target, color, depth_stencil, clear);
    }

    /// Clear aspects of the current render target. `color` is packed RGBA8, red in the low byte.
    pub fn clear(&self, color: u32, depth: f32, stencil: u8, mask: vk::ImageAspectFlags) {
        self.recorder.lock().clear(color, depth, stencil, mask);
    }

    pub fn draw(&self, draw: DrawCommand) {
        self.recorder.lock().draw(draw);
    }

    pub fn draw_indexed(&self, draw: DrawIndexedCommand) {
        self.recorder.lock().draw_indexed(draw);
    }

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        self.recorder.lock().set_viewport(viewport);
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        self.recorder.lock().set_scissor(scissor);
    }

    pub fn set_blend_constants(&self, constants: [f32; 4]) {
        self.recorder.lock().set_blend_constants(constants);
    }

    pub fn set_stencil_params(&self, write_mask: u8, compare_mask: u8, reference: u8) {
        self.recorder
            .lock()
            .set_stencil_params(write_mask, compare_mask, reference);
    }

    pub fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.recorder
            .lock()
            .push_constants(layout, stages, offset, data);
    }

    /// Copy a region between framebuffers.
    ///
    /// # Panics
    /// If a rectangle leaves its framebuffer or `src` is `dst`.
    pub fn copy_framebuffer(
        &self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_pos: vk::Offset2D,
        aspect: vk::ImageAspectFlags,
    ) {
        assert!(self.inside_frame, "copy recorded outside a frame");
        self.recorder
            .lock()
            .copy(src, src_rect, dst, dst_pos, aspect);
    }

    /// Scaled copy of a region between framebuffers.
    ///
    /// # Panics
    /// If a rectangle leaves its framebuffer.
    pub fn blit_framebuffer(
        &self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_rect: vk::Rect2D,
        aspect: vk::ImageAspectFlags,
        filter: vk::Filter,
    ) {
        assert!(self.inside_frame, "blit recorded outside a frame");
        self.recorder
            .lock()
            .blit(src, src_rect, dst, dst_rect, aspect, filter);
    }

    /// Declare that `framebuffer` is sampled by subsequent draws and return its color view.
    ///
    /// `binding` is the descriptor binding the caller will use the view at.
    pub fn bind_framebuffer_as_texture(
        &self,
        framebuffer: &Arc<Framebuffer>,
        binding: u32,
        aspect: vk::ImageAspectFlags,
    ) -> vk::ImageView {
        trace!(id = framebuffer.id(), binding, "Framebuffer bound as texture");
        self.recorder.lock().bind_as_texture(framebuffer, aspect)
    }

    /// Read `rect` of one aspect of `framebuffer` into `out`, converted to `format`.
    ///
    /// Flushes the frame synchronously, so `out` reflects every step recorded
    /// before the call. Rows in `out` are `row_stride` pixels apart.
    ///
    /// # Panics
    /// Outside a frame, for an out-of-bounds rect, or if `out` is too small.
    pub fn copy_framebuffer_to_memory_sync(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
        aspect: vk::ImageAspectFlags,
        rect: vk::Rect2D,
        format: DataFormat,
        out: &mut [u8],
        row_stride: u32,
    ) -> Result<()> {
        assert!(self.inside_frame, "readback requested outside a frame");
        check_conversion(framebuffer.image(aspect).format(), aspect, format)?;

        self.recorder.get_mut().readback(framebuffer, aspect, rect);
        self.flush_sync()?;
        self.shared
            .runner
            .lock()
            .read_readback(&self.shared.backend, format, out, row_stride)
    }

    /// Submit everything recorded so far and block until the device is idle.
    ///
    /// The current render step is closed; rebind a target before drawing again.
    ///
    /// # Panics
    /// Outside a frame.
    pub fn flush_sync(&mut self) -> Result<()> {
        assert!(self.inside_frame, "flush_sync called outside a frame");
        self.drain_worker()?;
        let slot = self.current_frame();
        {
            let mut frame = self.shared.slots[slot].lock();
            self.recorder.get_mut().hand_off(&mut frame.steps);
        }
        flush(&self.shared, slot)
    }

    /// End the frame: translate, submit and present it, or hand it to the worker.
    ///
    /// Inline mode returns the frame's own outcome. Threaded mode returns
    /// [`FrameOutcome::Queued`], or a surface problem reported by an earlier
    /// frame.
    ///
    /// # Panics
    /// If no frame was begun.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn finish(&mut self) -> Result<FrameOutcome> {
        assert!(self.inside_frame, "finish called without begin_frame");
        let slot = self.current_frame();
        {
            let mut frame = self.shared.slots[slot].lock();
            self.recorder.get_mut().hand_off(&mut frame.steps);
        }
        self.inside_frame = false;

        let outcome = match &mut self.worker {
            None => run_frame(&self.shared, slot),
            Some(worker) => worker
                .submit(FrameBatch {
                    slot,
                    frame: self.frame_count,
                })
                .map(|()| self.surface_issue.take().unwrap_or(FrameOutcome::Queued)),
        };
        self.shared.backend.end_frame();
        outcome
    }

    /// Wait for every queued frame and return the worst surface outcome seen.
    pub fn wait_for_worker(&mut self) -> Result<Option<FrameOutcome>> {
        self.drain_worker()?;
        Ok(self.surface_issue.take())
    }
}

impl<B: RenderBackend> Drop for RenderManager<B> {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        for image in std::mem::take(&mut self.orphaned_images) {
            self.shared.backend.queue_delete_image(image);
        }
        debug!(frames = self.frame_count, "Render manager dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulingMode;
    use crate::error::RenderError;
    use crate::framebuffer::rect;
    use crate::step::RenderCommand;
    use crate::testing::{fake_swapchain, register_swapchain, Event, MockBackend, Op};
    use ash::vk::Handle;

    fn manager(frames: usize) -> RenderManager<MockBackend> {
        RenderManager::new(MockBackend::new(frames), RenderManagerConfig::default()).unwrap()
    }

    fn attach_swapchain(manager: &mut RenderManager<MockBackend>) -> SwapchainImages {
        let swapchain = fake_swapchain(3, 64, 64);
        register_swapchain(manager.backend(), &swapchain);
        manager.create_backbuffers(&swapchain).unwrap();
        swapchain
    }

    fn draw() -> DrawCommand {
        DrawCommand {
            pipeline: vk::Pipeline::from_raw(1),
            layout: vk::PipelineLayout::from_raw(2),
            descriptor_set: None,
            dynamic_offsets: Vec::new(),
            vertex_buffer: None,
            vertex_offset: 0,
            vertex_count: 3,
        }
    }

    fn clear_values(color: u32) -> ClearValues {
        ClearValues::new(color, 1.0, 0)
    }

    fn begin_renderings(ops: &[Op]) -> Vec<(usize, RenderingTargetSummary)> {
        ops.iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Op::BeginRendering(target) => Some((
                    i,
                    RenderingTargetSummary {
                        color_view: target.color_view,
                        color_load: target.color_load,
                        depth_load: target.depth_load,
                        stencil_load: target.stencil_load,
                        clear_color: target.clear.color,
                    },
                )),
                _ => None,
            })
            .collect()
    }

    #[derive(Debug, PartialEq, Eq)]
    struct RenderingTargetSummary {
        color_view: vk::ImageView,
        color_load: RenderPassAction,
        depth_load: RenderPassAction,
        stencil_load: RenderPassAction,
        clear_color: u32,
    }

    fn count_submits_with_fence(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::Submit { fence: Some(_), .. }))
            .count()
    }

    #[test]
    fn clear_clear_without_draws_is_one_rendering_with_clear_loads() {
        let mut manager = manager(2);
        let fb = manager
            .create_framebuffer(16, 16, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        manager.begin_frame().unwrap();
        manager.bind_framebuffer_as_render_target(
            Some(&fb),
            RenderPassAction::Clear,
            RenderPassAction::Clear,
            ClearValues::new(0x1122_3344, 0.5, 3),
        );
        assert_eq!(manager.finish().unwrap(), FrameOutcome::Offscreen);

        let ops = manager.backend().executed();
        let renderings = begin_renderings(&ops);
        assert_eq!(renderings.len(), 1);
        assert_eq!(
            renderings[0].1,
            RenderingTargetSummary {
                color_view: fb.color().view(),
                color_load: RenderPassAction::Clear,
                depth_load: RenderPassAction::Clear,
                stencil_load: RenderPassAction::Clear,
                clear_color: 0x1122_3344,
            }
        );
        assert!(!ops.iter().any(|op| matches!(op, Op::ClearAttachments(_))));
        assert_eq!(
            manager.backend().color_of(fb.color().image()),
            Some(0x1122_3344)
        );
    }

    #[test]
    fn stencil_clear_before_draws_keeps_depth_contents() {
        let mut manager = manager(2);
        let fb = manager
            .create_framebuffer(16, 16, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        manager.begin_frame().unwrap();
        let keep = RenderPassAction::Keep;
        manager.bind_framebuffer_as_render_target(Some(&fb), keep, keep, ClearValues::default());
        manager.clear(0, 0.0, 0x7F, vk::ImageAspectFlags::STENCIL);
        manager.draw(draw());
        manager.finish().unwrap();

        let ops = manager.backend().executed();
        let renderings = begin_renderings(&ops);
        assert_eq!(renderings.len(), 1);
        assert_eq!(
            renderings[0].1,
            RenderingTargetSummary {
                color_view: fb.color().view(),
                color_load: RenderPassAction::Keep,
                depth_load: RenderPassAction::Keep,
                stencil_load: RenderPassAction::Clear,
                clear_color: 0,
            }
        );
    }

    #[test]
    fn rebinding_and_clearing_mid_step_stays_in_one_rendering() {
        let mut manager = manager(2);
        let fb = manager
            .create_framebuffer(16, 16, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        manager.begin_frame().unwrap();
        let keep = RenderPassAction::Keep;
        manager.bind_framebuffer_as_render_target(Some(&fb), keep, keep, ClearValues::default());
        manager.draw(draw());
        manager.bind_framebuffer_as_render_target(Some(&fb), keep, keep, ClearValues::default());
        manager.clear(0xFF00_00FF, 1.0, 0, vk::ImageAspectFlags::COLOR);
        manager.draw(draw());
        manager.finish().unwrap();

        let ops = manager.backend().executed();
        assert_eq!(begin_renderings(&ops).len(), 1);
        let clears: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                Op::ClearAttachments(clear) => Some(clear.values.color),
                _ => None,
            })
            .collect();
        assert_eq!(clears, vec![0xFF00_00FF]);
        let draws = ops
            .iter()
            .filter(|op| matches!(op, Op::Execute(RenderCommand::Draw(_))))
            .count();
        assert_eq!(draws, 2);
        assert_eq!(manager.backend().color_of(fb.color().image()), Some(0xFF00_00FF));
    }

    #[test]
    fn sampled_target_transitions_before_next_rendering() {
        let mut manager = manager(2);
        let swapchain = attach_swapchain(&mut manager);
        let fb = manager
            .create_framebuffer(64, 64, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        manager.begin_frame().unwrap();
        let clear = RenderPassAction::Clear;
        manager.bind_framebuffer_as_render_target(Some(&fb), clear, clear, clear_values(0xFF));
        manager.draw(draw());
        let view = manager.bind_framebuffer_as_texture(&fb, 0, vk::ImageAspectFlags::COLOR);
        assert_eq!(view, fb.color().view());
        manager.bind_framebuffer_as_render_target(None, clear, clear, clear_values(0));
        manager.draw(draw());
        assert_eq!(manager.finish().unwrap(), FrameOutcome::Presented);

        let ops = manager.backend().executed();
        let renderings = begin_renderings(&ops);
        assert_eq!(renderings.len(), 2);
        assert_eq!(renderings[0].1.color_view, fb.color().view());
        assert_eq!(renderings[1].1.color_view, swapchain.views[0]);

        let to_shader_read: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Op::Transition(t)
                    if t.image == fb.color().image()
                        && t.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL =>
                {
                    Some(i)
                }
                _ => None,
            })
            .collect();
        assert_eq!(to_shader_read.len(), 1);
        assert!(renderings[0].0 < to_shader_read[0]);
        assert!(to_shader_read[0] < renderings[1].0);
        assert_eq!(
            fb.color().layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn setup_commands_are_submitted_before_main_commands() {
        let mut manager = manager(2);
        manager.begin_frame().unwrap();
        let fb = manager
            .create_framebuffer(8, 8, vk::Format::R8G8B8A8_UNORM)
            .unwrap();
        let clear = RenderPassAction::Clear;
        manager.bind_framebuffer_as_render_target(Some(&fb), clear, clear, clear_values(1));
        manager.finish().unwrap();

        let resources = manager.backend().frame_resources()[0];
        let submits = manager.backend().submits();
        assert_eq!(
            submits,
            vec![
                Event::Submit {
                    command_buffers: vec![resources.setup_cmd],
                    wait: None,
                    signal: None,
                    fence: None,
                },
                Event::Submit {
                    command_buffers: vec![resources.main_cmd],
                    wait: None,
                    signal: None,
                    fence: Some(resources.sync.in_flight),
                },
            ]
        );
    }

    #[test]
    fn slot_reuse_waits_for_its_fence() {
        let mut manager = manager(2);
        let fb = manager
            .create_framebuffer(8, 8, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        for frame in 0..6 {
            manager.begin_frame().unwrap();
            assert_eq!(manager.current_frame(), frame % 2);
            assert_eq!(manager.frame_state(frame % 2), FrameState::Recording);
            let clear = RenderPassAction::Clear;
            manager.bind_framebuffer_as_render_target(Some(&fb), clear, clear, clear_values(frame as u32));
            manager.draw(draw());
            manager.finish().unwrap();
            assert_eq!(manager.frame_state(frame % 2), FrameState::Submitted);
        }

        let events = manager.backend().events();
        let waits = events
            .iter()
            .filter(|e| matches!(e, Event::WaitFence(_)))
            .count();
        assert_eq!(waits, 4);
        assert_eq!(count_submits_with_fence(&events), 6);

        // Every reset of a fence that was submitted before is preceded by a wait on it.
        let mut submitted = std::collections::HashSet::new();
        for (i, event) in events.iter().enumerate() {
            match event {
                Event::Submit { fence: Some(f), .. } => {
                    submitted.insert(*f);
                }
                Event::ResetFence(f) if submitted.contains(f) => {
                    assert_eq!(events[i - 1], Event::WaitFence(*f));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn sync_readback_reflects_steps_recorded_earlier_in_the_frame() {
        let mut manager = manager(2);
        let a = manager
            .create_framebuffer(4, 4, vk::Format::R8G8B8A8_UNORM)
            .unwrap();
        let b = manager
            .create_framebuffer(4, 4, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        manager.begin_frame().unwrap();
        let clear = RenderPassAction::Clear;
        manager.bind_framebuffer_as_render_target(Some(&a), clear, clear, clear_values(0x1122_3344));
        manager.copy_framebuffer(
            &a,
            rect(0, 0, 4, 4),
            &b,
            vk::Offset2D { x: 0, y: 0 },
            vk::ImageAspectFlags::COLOR,
        );

        let mut out = vec![0u8; 2 * 2 * 4];
        manager
            .copy_framebuffer_to_memory_sync(
                &b,
                vk::ImageAspectFlags::COLOR,
                rect(1, 1, 2, 2),
                DataFormat::B8G8R8A8Unorm,
                &mut out,
                2,
            )
            .unwrap();
        assert_eq!(out, [0x22, 0x33, 0x44, 0x11].repeat(4));
        assert!(manager.backend().events().contains(&Event::WaitIdle));

        // The frame continues after the flush.
        manager.bind_framebuffer_as_render_target(Some(&a), clear, clear, clear_values(5));
        manager.draw(draw());
        manager.finish().unwrap();
        let events = manager.backend().events();
        assert_eq!(count_submits_with_fence(&events), 1);
        assert_eq!(begin_renderings(&manager.backend().executed()).len(), 2);
    }

    #[test]
    fn unsupported_readback_records_nothing() {
        let mut manager = manager(2);
        let fb = manager
            .create_framebuffer(4, 4, vk::Format::R8G8B8A8_UNORM)
            .unwrap();
        manager.begin_frame().unwrap();
        let mut out = vec![0u8; 64];
        let result = manager.copy_framebuffer_to_memory_sync(
            &fb,
            vk::ImageAspectFlags::COLOR,
            rect(0, 0, 4, 4),
            DataFormat::D32Float,
            &mut out,
            4,
        );
        assert!(matches!(result, Err(RenderError::UnsupportedReadback { .. })));
        assert!(manager.backend().submits().is_empty());
        manager.finish().unwrap();
    }

    #[test]
    fn out_of_date_acquire_submits_without_presenting() {
        let mut manager = manager(2);
        attach_swapchain(&mut manager);
        manager.backend().set_acquire_out_of_date(true);

        manager.begin_frame().unwrap();
        let clear = RenderPassAction::Clear;
        manager.bind_framebuffer_as_render_target(None, clear, clear, clear_values(0));
        manager.draw(draw());
        let outcome = manager.finish().unwrap();
        assert_eq!(outcome, FrameOutcome::OutOfDate);
        assert!(outcome.needs_recreate());

        let events = manager.backend().events();
        assert!(!events.iter().any(|e| matches!(e, Event::Present(_))));
        let main_submit = events
            .iter()
            .rev()
            .find(|e| matches!(e, Event::Submit { fence: Some(_), .. }))
            .unwrap();
        assert!(matches!(
            main_submit,
            Event::Submit {
                wait: None,
                signal: None,
                ..
            }
        ));
        assert!(begin_renderings(&manager.backend().executed()).is_empty());

        manager.backend().set_acquire_out_of_date(false);
        manager.destroy_backbuffers().unwrap();
        attach_swapchain(&mut manager);
        manager.begin_frame().unwrap();
        manager.bind_framebuffer_as_render_target(None, clear, clear, clear_values(0));
        assert_eq!(manager.finish().unwrap(), FrameOutcome::Presented);
    }

    #[test]
    fn failed_present_keeps_slot_fenced() {
        let mut manager = manager(1);
        attach_swapchain(&mut manager);
        manager
            .backend()
            .set_present_error(Some(vk::Result::ERROR_SURFACE_LOST_KHR));

        manager.begin_frame().unwrap();
        let clear = RenderPassAction::Clear;
        manager.bind_framebuffer_as_render_target(None, clear, clear, clear_values(0));
        assert!(matches!(
            manager.finish(),
            Err(RenderError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
        assert_eq!(manager.frame_state(0), FrameState::Submitted);

        manager.backend().set_present_error(None);
        manager.begin_frame().unwrap();
        let fence = manager.backend().frame_resources()[0].sync.in_flight;
        let events = manager.backend().events();
        let waited = events.iter().position(|e| *e == Event::WaitFence(fence));
        let reset = events.iter().rposition(|e| *e == Event::ResetFence(fence));
        assert!(waited.is_some() && waited < reset);
        manager.bind_framebuffer_as_render_target(None, clear, clear, clear_values(0));
        assert_eq!(manager.finish().unwrap(), FrameOutcome::Presented);
    }

    #[test]
    fn presented_frame_waits_on_acquire_and_signals_present() {
        let mut manager = manager(2);
        attach_swapchain(&mut manager);
        manager
            .backend()
            .set_present_status(vkstep_gpu::PresentStatus::Suboptimal);

        manager.begin_frame().unwrap();
        let clear = RenderPassAction::Clear;
        manager.bind_framebuffer_as_render_target(None, clear, clear, clear_values(0));
        assert_eq!(manager.finish().unwrap(), FrameOutcome::Suboptimal);

        let sync = manager.backend().frame_resources()[0].sync;
        let events = manager.backend().events();
        assert!(events.contains(&Event::Acquire(sync.image_available)));
        assert!(events.contains(&Event::Submit {
            command_buffers: vec![manager.backend().frame_resources()[0].main_cmd],
            wait: Some(sync.image_available),
            signal: Some(sync.render_finished),
            fence: Some(sync.in_flight),
        }));
        assert_eq!(events.last(), Some(&Event::EndFrame));
        assert!(events.contains(&Event::Present(0)));
    }

    #[test]
    fn destroyed_framebuffer_is_deleted_one_slot_cycle_later() {
        let mut manager = manager(2);
        let fb = manager
            .create_framebuffer(8, 8, vk::Format::R8G8B8A8_UNORM)
            .unwrap();
        let images = [fb.color().image(), fb.depth().image()];

        manager.begin_frame().unwrap();
        let clear = RenderPassAction::Clear;
        manager.bind_framebuffer_as_render_target(Some(&fb), clear, clear, clear_values(0));
        manager.finish().unwrap();
        manager.destroy_framebuffer(fb).unwrap();

        for _ in 0..2 {
            manager.begin_frame().unwrap();
            assert!(manager.backend().destroyed_images().is_empty());
            manager.finish().unwrap();
        }
        manager.begin_frame().unwrap();
        assert_eq!(manager.backend().destroyed_images(), images);
        manager.finish().unwrap();
    }

    #[test]
    #[should_panic(expected = "destroyed while still referenced")]
    fn destroying_shared_framebuffer_panics() {
        let mut manager = manager(2);
        let fb = manager
            .create_framebuffer(8, 8, vk::Format::R8G8B8A8_UNORM)
            .unwrap();
        let _still_used = fb.clone();
        let _ = manager.destroy_framebuffer(fb);
    }

    #[test]
    #[should_panic(expected = "begin_frame called inside a frame")]
    fn nested_begin_frame_panics() {
        let mut manager = manager(2);
        manager.begin_frame().unwrap();
        let _ = manager.begin_frame();
    }

    #[test]
    #[should_panic(expected = "finish called without begin_frame")]
    fn finish_without_begin_panics() {
        let mut manager = manager(2);
        let _ = manager.finish();
    }

    #[test]
    fn threaded_frames_run_on_the_worker() {
        let config = RenderManagerConfig::new()
            .with_scheduling(SchedulingMode::Threaded)
            .with_worker_name("test-frame-worker");
        let mut manager = RenderManager::new(MockBackend::new(3), config).unwrap();
        attach_swapchain(&mut manager);
        let fb = manager
            .create_framebuffer(8, 8, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        for frame in 0..7u32 {
            manager.begin_frame().unwrap();
            let clear = RenderPassAction::Clear;
            manager.bind_framebuffer_as_render_target(Some(&fb), clear, clear, clear_values(frame));
            manager.draw(draw());
            manager.bind_framebuffer_as_texture(&fb, 0, vk::ImageAspectFlags::COLOR);
            manager.bind_framebuffer_as_render_target(None, clear, clear, clear_values(0));
            manager.draw(draw());
            assert_eq!(manager.finish().unwrap(), FrameOutcome::Queued);
        }
        assert_eq!(manager.wait_for_worker().unwrap(), None);

        let events = manager.backend().events();
        assert_eq!(count_submits_with_fence(&events), 7);
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::Present(_))).count(),
            7
        );
        assert_eq!(begin_renderings(&manager.backend().executed()).len(), 14);
        assert_eq!(manager.backend().color_of(fb.color().image()), Some(6));

        manager
            .backend()
            .set_present_status(vkstep_gpu::PresentStatus::OutOfDate);
        manager.begin_frame().unwrap();
        manager.bind_framebuffer_as_render_target(
            None,
            RenderPassAction::Clear,
            RenderPassAction::Clear,
            clear_values(0),
        );
        assert_eq!(manager.finish().unwrap(), FrameOutcome::Queued);
        assert_eq!(
            manager.wait_for_worker().unwrap(),
            Some(FrameOutcome::OutOfDate)
        );
    }
}
