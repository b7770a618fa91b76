//! Deferred rendering steps.
//!
//! A frame is recorded as an ordered list of [`Step`]s and only turned into
//! native commands when the frame is flushed or finished.

use crate::framebuffer::Framebuffer;
use ash::vk;
use std::sync::Arc;

/// What happens to an attachment's contents when a render step begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderPassAction {
    /// Clear to the step's clear value.
    Clear,
    /// Preserve the previous contents.
    #[default]
    Keep,
    /// Previous contents are irrelevant.
    DontCare,
}

impl RenderPassAction {
    /// Native load op.
    pub fn load_op(self) -> vk::AttachmentLoadOp {
        match self {
            Self::Clear => vk::AttachmentLoadOp::CLEAR,
            Self::Keep => vk::AttachmentLoadOp::LOAD,
            Self::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

/// Clear values of a render step. Color is packed RGBA8 with red in the low byte.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClearValues {
    pub color: u32,
    pub depth: f32,
    pub stencil: u8,
}

impl ClearValues {
    pub fn new(color: u32, depth: f32, stencil: u8) -> Self {
        Self {
            color,
            depth,
            stencil,
        }
    }
}

/// Unpack an RGBA8 color into normalized floats.
pub fn unpack_rgba8(color: u32) -> [f32; 4] {
    color.to_le_bytes().map(|c| f32::from(c) / 255.0)
}

/// Mask of the depth and stencil aspects.
pub const DEPTH_STENCIL: vk::ImageAspectFlags = vk::ImageAspectFlags::from_raw(
    vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
);

/// A non-indexed draw.
#[derive(Debug, Clone)]
pub struct DrawCommand {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: Option<vk::DescriptorSet>,
    pub dynamic_offsets: Vec<u32>,
    pub vertex_buffer: Option<vk::Buffer>,
    pub vertex_offset: vk::DeviceSize,
    pub vertex_count: u32,
}

/// An indexed, optionally instanced draw.
#[derive(Debug, Clone)]
pub struct DrawIndexedCommand {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: Option<vk::DescriptorSet>,
    pub dynamic_offsets: Vec<u32>,
    pub vertex_buffer: vk::Buffer,
    pub vertex_offset: vk::DeviceSize,
    pub index_buffer: vk::Buffer,
    pub index_offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
    pub index_count: u32,
    pub instances: u32,
}

/// Draw and state commands recorded inside a render step.
#[derive(Debug, Clone)]
pub enum RenderCommand {
    /// Clear of the masked aspects after draws have already been recorded.
    Clear {
        color: u32,
        depth: f32,
        stencil: u8,
        mask: vk::ImageAspectFlags,
    },
    Viewport(vk::Viewport),
    Scissor(vk::Rect2D),
    BlendConstants([f32; 4]),
    StencilParams {
        write_mask: u8,
        compare_mask: u8,
        reference: u8,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    Draw(DrawCommand),
    DrawIndexed(DrawIndexedCommand),
}

/// A layout change applied before a render step begins.
#[derive(Debug, Clone)]
pub struct PreTransition {
    pub framebuffer: Arc<Framebuffer>,
    pub aspect: vk::ImageAspectFlags,
    pub layout: vk::ImageLayout,
}

/// Rendering into a framebuffer, or into the backbuffer when `framebuffer` is `None`.
#[derive(Debug)]
pub struct RenderStep {
    pub framebuffer: Option<Arc<Framebuffer>>,
    pub color: RenderPassAction,
    pub depth: RenderPassAction,
    /// Starts equal to `depth`; a stencil-only clear changes just this one.
    pub stencil: RenderPassAction,
    pub clear: ClearValues,
    pub commands: Vec<RenderCommand>,
    pub num_draws: u32,
    /// Layout the color image is left in. `None` until a later step declares a read.
    pub final_color_layout: Option<vk::ImageLayout>,
    pub pre_transitions: Vec<PreTransition>,
}

impl RenderStep {
    pub fn new(
        framebuffer: Option<Arc<Framebuffer>>,
        color: RenderPassAction,
        depth_stencil: RenderPassAction,
        clear: ClearValues,
    ) -> Self {
        // The backbuffer always ends in attachment layout; present is handled per frame.
        let final_color_layout = framebuffer
            .is_none()
            .then_some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        Self {
            framebuffer,
            color,
            depth: depth_stencil,
            stencil: depth_stencil,
            clear,
            commands: Vec::new(),
            num_draws: 0,
            final_color_layout,
            pre_transitions: Vec::new(),
        }
    }

    /// Whether this step renders into `target` (`None` = backbuffer).
    pub fn targets(&self, target: Option<&Arc<Framebuffer>>) -> bool {
        match (&self.framebuffer, target) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Fold a clear into the load configuration. Only the masked aspects change.
    pub(crate) fn merge_clear(
        &mut self,
        color: u32,
        depth: f32,
        stencil: u8,
        mask: vk::ImageAspectFlags,
    ) {
        if mask.contains(vk::ImageAspectFlags::COLOR) {
            self.color = RenderPassAction::Clear;
            self.clear.color = color;
        }
        if mask.contains(vk::ImageAspectFlags::DEPTH) {
            self.depth = RenderPassAction::Clear;
            self.clear.depth = depth;
        }
        if mask.contains(vk::ImageAspectFlags::STENCIL) {
            self.stencil = RenderPassAction::Clear;
            self.clear.stencil = stencil;
        }
    }
}

/// Image to image copy.
#[derive(Debug)]
pub struct CopyStep {
    pub src: Arc<Framebuffer>,
    pub src_rect: vk::Rect2D,
    pub dst: Arc<Framebuffer>,
    pub dst_pos: vk::Offset2D,
    pub aspect: vk::ImageAspectFlags,
}

/// Scaled image to image blit.
#[derive(Debug)]
pub struct BlitStep {
    pub src: Arc<Framebuffer>,
    pub src_rect: vk::Rect2D,
    pub dst: Arc<Framebuffer>,
    pub dst_rect: vk::Rect2D,
    pub aspect: vk::ImageAspectFlags,
    pub filter: vk::Filter,
}

/// Copy of one aspect of a framebuffer region into the host-visible readback buffer.
#[derive(Debug)]
pub struct ReadbackStep {
    pub src: Arc<Framebuffer>,
    pub rect: vk::Rect2D,
    pub aspect: vk::ImageAspectFlags,
}

/// Discriminant of a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Render,
    Copy,
    Blit,
    Readback,
}

/// One deferred unit of rendering work.
#[derive(Debug)]
pub enum Step {
    Render(RenderStep),
    Copy(CopyStep),
    Blit(BlitStep),
    Readback(ReadbackStep),
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Render(_) => StepKind::Render,
            Self::Copy(_) => StepKind::Copy,
            Self::Blit(_) => StepKind::Blit,
            Self::Readback(_) => StepKind::Readback,
        }
    }

    pub fn as_render(&self) -> Option<&RenderStep> {
        match self {
            Self::Render(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_render_mut(&mut self) -> Option<&mut RenderStep> {
        match self {
            Self::Render(step) => Some(step),
            _ => None,
        }
    }
}
