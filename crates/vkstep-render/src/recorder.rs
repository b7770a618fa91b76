//! Step recording.

use crate::framebuffer::Framebuffer;
use crate::resolver::resolve_texture_read;
use crate::step::{
    BlitStep, ClearValues, CopyStep, DrawCommand, DrawIndexedCommand, PreTransition,
    ReadbackStep, RenderCommand, RenderPassAction, RenderStep, Step,
};
use ash::vk;
use std::sync::Arc;

/// Accumulates the steps of the frame being recorded.
///
/// At most one render step is current; draw and state commands append to it.
#[derive(Debug, Default)]
pub struct StepRecorder {
    steps: Vec<Step>,
    current: Option<usize>,
    render_width: u32,
    render_height: u32,
    backbuffer_width: u32,
    backbuffer_height: u32,
    /// Texture reads waiting for the next render step.
    pending_reads: Vec<PreTransition>,
}

impl StepRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps recorded since the last hand-off.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Size used for backbuffer render steps.
    pub fn set_backbuffer_size(&mut self, width: u32, height: u32) {
        self.backbuffer_width = width;
        self.backbuffer_height = height;
    }

    /// Size of the current render target.
    pub fn render_area(&self) -> (u32, u32) {
        (self.render_width, self.render_height)
    }

    /// Whether a render step is open.
    pub fn has_current_step(&self) -> bool {
        self.current.is_some()
    }

    fn current_render(&self) -> Option<&RenderStep> {
        self.current
            .and_then(|index| self.steps.get(index))
            .and_then(Step::as_render)
    }

    fn current_render_mut(&mut self, operation: &str) -> &mut RenderStep {
        let step = self
            .current
            .and_then(|index| self.steps.get_mut(index))
            .and_then(Step::as_render_mut);
        match step {
            Some(step) => step,
            None => panic!("{operation} requires a render target to be bound"),
        }
    }

    fn close_current(&mut self) {
        self.current = None;
    }

    /// Start rendering into `target` (`None` = backbuffer).
    ///
    /// Rebinding the target of the current step without requesting a clear
    /// continues that step instead of starting a new one.
    pub fn bind_render_target(
        &mut self,
        target: Option<&Arc<Framebuffer>>,
        color: RenderPassAction,
        depth_stencil: RenderPassAction,
        clear: ClearValues,
    ) {
        let (width, height) = target.map_or((self.backbuffer_width, self.backbuffer_height), |fb| {
            (fb.width(), fb.height())
        });
        self.render_width = width;
        self.render_height = height;

        if let Some(current) = self.current_render() {
            if current.targets(target)
                && color != RenderPassAction::Clear
                && depth_stencil != RenderPassAction::Clear
            {
                return;
            }
        }

        self.close_current();
        let mut step = RenderStep::new(target.cloned(), color, depth_stencil, clear);
        step.pre_transitions = std::mem::take(&mut self.pending_reads);
        self.steps.push(Step::Render(step));
        self.current = Some(self.steps.len() - 1);
    }

    /// Clear the masked aspects of the current target.
    ///
    /// Before the first draw this becomes part of the step's load
    /// configuration; afterwards it is recorded as an attachment clear.
    pub fn clear(&mut self, color: u32, depth: f32, stencil: u8, mask: vk::ImageAspectFlags) {
        let step = self.current_render_mut("clear");
        if step.num_draws == 0 {
            step.merge_clear(color, depth, stencil, mask);
        } else {
            step.commands.push(RenderCommand::Clear {
                color,
                depth,
                stencil,
                mask,
            });
        }
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.current_render_mut("set_viewport")
            .commands
            .push(RenderCommand::Viewport(viewport));
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.current_render_mut("set_scissor")
            .commands
            .push(RenderCommand::Scissor(scissor));
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.current_render_mut("set_blend_constants")
            .commands
            .push(RenderCommand::BlendConstants(constants));
    }

    pub fn set_stencil_params(&mut self, write_mask: u8, compare_mask: u8, reference: u8) {
        self.current_render_mut("set_stencil_params")
            .commands
            .push(RenderCommand::StencilParams {
                write_mask,
                compare_mask,
                reference,
            });
    }

    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.current_render_mut("push_constants")
            .commands
            .push(RenderCommand::PushConstants {
                layout,
                stages,
                offset,
                data: data.to_vec(),
            });
    }

    pub fn draw(&mut self, draw: DrawCommand) {
        let step = self.current_render_mut("draw");
        step.commands.push(RenderCommand::Draw(draw));
        step.num_draws += 1;
    }

    pub fn draw_indexed(&mut self, draw: DrawIndexedCommand) {
        let step = self.current_render_mut("draw_indexed");
        step.commands.push(RenderCommand::DrawIndexed(draw));
        step.num_draws += 1;
    }

    /// Copy `src_rect` of `src` to `dst_pos` in `dst`.
    ///
    /// # Panics
    /// If either rectangle leaves its framebuffer, or `src` and `dst` are the same.
    pub fn copy(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_pos: vk::Offset2D,
        aspect: vk::ImageAspectFlags,
    ) {
        assert!(
            !Arc::ptr_eq(src, dst),
            "copy source and destination must be different framebuffers"
        );
        assert!(
            src.contains(src_rect),
            "copy source rect {src_rect:?} outside framebuffer {}",
            src.id()
        );
        let dst_rect = vk::Rect2D {
            offset: dst_pos,
            extent: src_rect.extent,
        };
        assert!(
            dst.contains(dst_rect),
            "copy destination rect {dst_rect:?} outside framebuffer {}",
            dst.id()
        );

        self.close_current();
        self.steps.push(Step::Copy(CopyStep {
            src: src.clone(),
            src_rect,
            dst: dst.clone(),
            dst_pos,
            aspect,
        }));
    }

    /// Scaled copy of `src_rect` of `src` into `dst_rect` of `dst`.
    ///
    /// # Panics
    /// If either rectangle leaves its framebuffer.
    pub fn blit(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_rect: vk::Rect2D,
        aspect: vk::ImageAspectFlags,
        filter: vk::Filter,
    ) {
        assert!(
            src.contains(src_rect),
            "blit source rect {src_rect:?} outside framebuffer {}",
            src.id()
        );
        assert!(
            dst.contains(dst_rect),
            "blit destination rect {dst_rect:?} outside framebuffer {}",
            dst.id()
        );

        self.close_current();
        self.steps.push(Step::Blit(BlitStep {
            src: src.clone(),
            src_rect,
            dst: dst.clone(),
            dst_rect,
            aspect,
            filter,
        }));
    }

    /// Read one aspect of `rect` in `src` back to host memory.
    ///
    /// # Panics
    /// If `aspect` names more than one aspect or `rect` leaves the framebuffer.
    pub fn readback(&mut self, src: &Arc<Framebuffer>, aspect: vk::ImageAspectFlags, rect: vk::Rect2D) {
        assert!(
            aspect == vk::ImageAspectFlags::COLOR
                || aspect == vk::ImageAspectFlags::DEPTH
                || aspect == vk::ImageAspectFlags::STENCIL,
            "readback needs exactly one aspect, got {aspect:?}"
        );
        assert!(
            src.contains(rect),
            "readback rect {rect:?} outside framebuffer {}",
            src.id()
        );

        self.close_current();
        self.steps.push(Step::Readback(ReadbackStep {
            src: src.clone(),
            rect,
            aspect,
        }));
    }

    /// Declare that `framebuffer`'s color image is sampled from here on.
    ///
    /// The nearest step rendering into it is told to leave the image
    /// shader-readable, and the consuming render step transitions it before
    /// rendering begins. When the producer itself is current it is closed and
    /// the read applies to the next bound render target.
    ///
    /// # Panics
    /// If `aspect` is not `COLOR`.
    pub fn bind_as_texture(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
        aspect: vk::ImageAspectFlags,
    ) -> vk::ImageView {
        assert_eq!(
            aspect,
            vk::ImageAspectFlags::COLOR,
            "only color attachments can be bound as textures"
        );
        resolve_texture_read(&mut self.steps, framebuffer);

        let read = PreTransition {
            framebuffer: framebuffer.clone(),
            aspect,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let producer_is_current = self
            .current_render()
            .is_some_and(|step| step.targets(Some(framebuffer)));
        let reads = match self.current {
            Some(index) if !producer_is_current => match self.steps[index].as_render_mut() {
                Some(step) => &mut step.pre_transitions,
                None => &mut self.pending_reads,
            },
            _ => {
                self.close_current();
                &mut self.pending_reads
            }
        };
        if !reads
            .iter()
            .any(|pre| Arc::ptr_eq(&pre.framebuffer, framebuffer))
        {
            reads.push(read);
        }
        framebuffer.color().view()
    }

    /// Close the current step and move the recorded steps into `slot_steps`.
    ///
    /// `slot_steps` must be empty; its allocation is taken over for the next frame.
    pub fn hand_off(&mut self, slot_steps: &mut Vec<Step>) {
        assert!(
            slot_steps.is_empty(),
            "frame slot still holds untranslated steps"
        );
        self.close_current();
        if !self.pending_reads.is_empty() {
            tracing::trace!(
                count = self.pending_reads.len(),
                "Dropping texture reads with no consuming render step"
            );
            self.pending_reads.clear();
        }
        std::mem::swap(&mut self.steps, slot_steps);
    }
}
