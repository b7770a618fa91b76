//! Command-buffer side of the backend seam.
//!
//! The queue runner only ever talks to a [`CommandEncoder`]. The Vulkan
//! implementation records synchronization2 barriers and dynamic rendering.

use crate::step::{unpack_rgba8, ClearValues, RenderCommand, RenderPassAction};
use ash::vk;

/// Stage and access masks an image layout implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutMasks {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl LayoutMasks {
    const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    /// Masks for work that last used an image in `layout`.
    pub fn source(layout: vk::ImageLayout) -> Self {
        match layout {
            vk::ImageLayout::UNDEFINED => {
                Self::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE)
            }
            // Chains with the acquire semaphore wait stage
            vk::ImageLayout::PRESENT_SRC_KHR => Self::new(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::NONE,
            ),
            other => Self::common(other),
        }
    }

    /// Masks for work that will use an image in `layout`.
    pub fn destination(layout: vk::ImageLayout) -> Self {
        match layout {
            vk::ImageLayout::PRESENT_SRC_KHR => {
                Self::new(vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE)
            }
            other => Self::common(other),
        }
    }

    fn common(layout: vk::ImageLayout) -> Self {
        match layout {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => Self::new(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => Self::new(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => Self::new(
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_READ,
            ),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => Self::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => Self::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            _ => Self::new(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            ),
        }
    }
}

/// A layout transition of a whole single-mip, single-layer image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src: LayoutMasks,
    pub dst: LayoutMasks,
}

impl ImageTransition {
    pub fn new(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            image,
            aspect,
            old_layout,
            new_layout,
            src: LayoutMasks::source(old_layout),
            dst: LayoutMasks::destination(new_layout),
        }
    }

    fn barrier(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(full_range(self.aspect))
    }
}

/// Subresource range covering mip 0, layer 0.
pub fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// Subresource layers for mip 0, layer 0.
pub fn layers(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(aspect)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

/// Attachments and load configuration for one dynamic rendering scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderingTarget {
    pub color_view: vk::ImageView,
    pub depth_view: vk::ImageView,
    /// Whether the depth view also carries a stencil aspect.
    pub has_stencil: bool,
    pub extent: vk::Extent2D,
    pub color_load: RenderPassAction,
    pub depth_load: RenderPassAction,
    /// Ignored when the depth view has no stencil aspect.
    pub stencil_load: RenderPassAction,
    pub clear: ClearValues,
}

/// An attachment clear over the full render area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentClear {
    pub values: ClearValues,
    pub mask: vk::ImageAspectFlags,
    pub extent: vk::Extent2D,
}

/// Image to image copy between transfer layouts.
#[derive(Debug, Clone, Copy)]
pub struct ImageCopy {
    pub src: vk::Image,
    pub dst: vk::Image,
    pub region: vk::ImageCopy,
}

/// Scaled image to image blit between transfer layouts.
#[derive(Debug, Clone, Copy)]
pub struct ImageBlit {
    pub src: vk::Image,
    pub dst: vk::Image,
    pub region: vk::ImageBlit,
    pub filter: vk::Filter,
}

/// Records native commands into one command buffer.
pub trait CommandEncoder {
    /// Emit a layout transition barrier.
    fn transition(&mut self, transition: &ImageTransition);

    /// Begin a dynamic rendering scope.
    fn begin_rendering(&mut self, target: &RenderingTarget);

    /// End the current rendering scope.
    fn end_rendering(&mut self);

    /// Clear attachments inside the current rendering scope.
    fn clear_attachments(&mut self, clear: &AttachmentClear);

    /// Emit a draw or state command.
    ///
    /// `RenderCommand::Clear` is lowered through [`Self::clear_attachments`]
    /// by the caller and ignored here.
    fn execute(&mut self, command: &RenderCommand);

    /// Copy between images in transfer layouts.
    fn copy_image(&mut self, copy: &ImageCopy);

    /// Blit between images in transfer layouts.
    fn blit_image(&mut self, blit: &ImageBlit);

    /// Copy an image in `TRANSFER_SRC_OPTIMAL` into a buffer.
    fn copy_image_to_buffer(
        &mut self,
        image: vk::Image,
        buffer: vk::Buffer,
        region: &vk::BufferImageCopy,
    );
}

/// [`CommandEncoder`] recording into a Vulkan command buffer.
pub struct VulkanEncoder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
}

impl<'a> VulkanEncoder<'a> {
    /// Wrap a command buffer that is in the recording state.
    pub fn new(device: &'a ash::Device, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }
}

fn clear_color(color: u32) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue {
            float32: unpack_rgba8(color),
        },
    }
}

fn clear_depth_stencil(values: &ClearValues) -> vk::ClearValue {
    vk::ClearValue {
        depth_stencil: vk::ClearDepthStencilValue {
            depth: values.depth,
            stencil: u32::from(values.stencil),
        },
    }
}

impl CommandEncoder for VulkanEncoder<'_> {
    fn transition(&mut self, transition: &ImageTransition) {
        let barriers = [transition.barrier()];
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe {
            self.device
                .cmd_pipeline_barrier2(self.cmd, &dependency_info);
        }
    }

    fn begin_rendering(&mut self, target: &RenderingTarget) {
        let color = [vk::RenderingAttachmentInfo::default()
            .image_view(target.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(target.color_load.load_op())
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_color(target.clear.color))];

        let depth_attachment = |load: RenderPassAction| {
            vk::RenderingAttachmentInfo::default()
                .image_view(target.depth_view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(load.load_op())
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear_depth_stencil(&target.clear))
        };
        let depth = depth_attachment(target.depth_load);
        let stencil = depth_attachment(target.stencil_load);

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color)
            .depth_attachment(&depth);
        if target.has_stencil {
            rendering_info = rendering_info.stencil_attachment(&stencil);
        }

        unsafe {
            self.device.cmd_begin_rendering(self.cmd, &rendering_info);
        }
    }

    fn end_rendering(&mut self) {
        unsafe {
            self.device.cmd_end_rendering(self.cmd);
        }
    }

    fn clear_attachments(&mut self, clear: &AttachmentClear) {
        let mut attachments = Vec::with_capacity(2);
        if clear.mask.contains(vk::ImageAspectFlags::COLOR) {
            attachments.push(
                vk::ClearAttachment::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .color_attachment(0)
                    .clear_value(clear_color(clear.values.color)),
            );
        }
        let depth_stencil =
            clear.mask & (vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);
        if !depth_stencil.is_empty() {
            attachments.push(
                vk::ClearAttachment::default()
                    .aspect_mask(depth_stencil)
                    .clear_value(clear_depth_stencil(&clear.values)),
            );
        }
        if attachments.is_empty() {
            return;
        }

        let rect = vk::ClearRect::default()
            .rect(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: clear.extent,
            })
            .base_array_layer(0)
            .layer_count(1);

        unsafe {
            self.device
                .cmd_clear_attachments(self.cmd, &attachments, &[rect]);
        }
    }

    fn execute(&mut self, command: &RenderCommand) {
        let device = self.device;
        let cmd = self.cmd;
        unsafe {
            match command {
                RenderCommand::Clear { .. } => {}
                RenderCommand::Viewport(viewport) => {
                    device.cmd_set_viewport(cmd, 0, std::slice::from_ref(viewport));
                }
                RenderCommand::Scissor(scissor) => {
                    device.cmd_set_scissor(cmd, 0, std::slice::from_ref(scissor));
                }
                RenderCommand::BlendConstants(constants) => {
                    device.cmd_set_blend_constants(cmd, constants);
                }
                RenderCommand::StencilParams {
                    write_mask,
                    compare_mask,
                    reference,
                } => {
                    let faces = vk::StencilFaceFlags::FRONT_AND_BACK;
                    device.cmd_set_stencil_write_mask(cmd, faces, u32::from(*write_mask));
                    device.cmd_set_stencil_compare_mask(cmd, faces, u32::from(*compare_mask));
                    device.cmd_set_stencil_reference(cmd, faces, u32::from(*reference));
                }
                RenderCommand::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => {
                    device.cmd_push_constants(cmd, *layout, *stages, *offset, data);
                }
                RenderCommand::Draw(draw) => {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
                    if let Some(set) = draw.descriptor_set {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            draw.layout,
                            0,
                            &[set],
                            &draw.dynamic_offsets,
                        );
                    }
                    if let Some(buffer) = draw.vertex_buffer {
                        device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[draw.vertex_offset]);
                    }
                    device.cmd_draw(cmd, draw.vertex_count, 1, 0, 0);
                }
                RenderCommand::DrawIndexed(draw) => {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
                    if let Some(set) = draw.descriptor_set {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            draw.layout,
                            0,
                            &[set],
                            &draw.dynamic_offsets,
                        );
                    }
                    device.cmd_bind_vertex_buffers(
                        cmd,
                        0,
                        &[draw.vertex_buffer],
                        &[draw.vertex_offset],
                    );
                    device.cmd_bind_index_buffer(
                        cmd,
                        draw.index_buffer,
                        draw.index_offset,
                        draw.index_type,
                    );
                    device.cmd_draw_indexed(cmd, draw.index_count, draw.instances, 0, 0, 0);
                }
            }
        }
    }

    fn copy_image(&mut self, copy: &ImageCopy) {
        unsafe {
            self.device.cmd_copy_image(
                self.cmd,
                copy.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                copy.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy.region],
            );
        }
    }

    fn blit_image(&mut self, blit: &ImageBlit) {
        unsafe {
            self.device.cmd_blit_image(
                self.cmd,
                blit.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                blit.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit.region],
                blit.filter,
            );
        }
    }

    fn copy_image_to_buffer(
        &mut self,
        image: vk::Image,
        buffer: vk::Buffer,
        region: &vk::BufferImageCopy,
    ) {
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                buffer,
                std::slice::from_ref(region),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn attachment_to_sampled_masks() {
        let t = ImageTransition::new(
            vk::Image::from_raw(7),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(t.src.stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert!(t.src.access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        assert_eq!(t.dst.stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!(t.dst.access, vk::AccessFlags2::SHADER_READ);
    }

    #[test]
    fn present_masks_depend_on_direction() {
        let acquire = ImageTransition::new(
            vk::Image::from_raw(1),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(
            acquire.src.stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(acquire.src.access, vk::AccessFlags2::NONE);

        let present = ImageTransition::new(
            vk::Image::from_raw(1),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert_eq!(present.dst.stage, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        assert_eq!(present.dst.access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn transfer_and_depth_masks() {
        let t = ImageTransition::new(
            vk::Image::from_raw(2),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(t.src.stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert!(t
            .dst
            .stage
            .contains(vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS));

        let src = LayoutMasks::destination(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(src.access, vk::AccessFlags2::TRANSFER_READ);
        let dst = LayoutMasks::destination(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(dst.access, vk::AccessFlags2::TRANSFER_WRITE);

        let general = LayoutMasks::source(vk::ImageLayout::GENERAL);
        assert_eq!(general.stage, vk::PipelineStageFlags2::ALL_COMMANDS);
    }

    #[test]
    fn barrier_covers_single_subresource() {
        let t = ImageTransition::new(
            vk::Image::from_raw(3),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let barrier = t.barrier();
        assert_eq!(barrier.subresource_range.level_count, 1);
        assert_eq!(barrier.subresource_range.layer_count, 1);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }
}
