//! Translation of recorded steps into native commands.

use crate::backend::RenderBackend;
use crate::encoder::{
    layers, AttachmentClear, CommandEncoder, ImageBlit, ImageCopy, ImageTransition,
    RenderingTarget,
};
use crate::error::{RenderError, Result};
use crate::framebuffer::{has_stencil, Framebuffer, RenderImage};
use crate::readback::{convert_readback, texel_size, DataFormat};
use crate::step::{
    BlitStep, ClearValues, CopyStep, ReadbackStep, RenderCommand, RenderStep, Step, DEPTH_STENCIL,
};
use ash::vk;
use tracing::{trace, warn};

/// Swapchain images and the depth buffer shared by backbuffer steps.
#[derive(Debug)]
pub struct Backbuffer {
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub depth: RenderImage,
}

/// Source description of the last readback copy.
#[derive(Debug, Clone, Copy)]
struct ReadbackInfo {
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    width: u32,
    height: u32,
}

/// Translates steps into a command encoder.
#[derive(Debug, Default)]
pub struct QueueRunner {
    backbuffer: Option<Backbuffer>,
    readback: Option<ReadbackInfo>,
}

fn offset3d(offset: vk::Offset2D) -> vk::Offset3D {
    vk::Offset3D {
        x: offset.x,
        y: offset.y,
        z: 0,
    }
}

fn rect_end(rect: vk::Rect2D) -> vk::Offset3D {
    vk::Offset3D {
        x: rect.offset.x + rect.extent.width as i32,
        y: rect.offset.y + rect.extent.height as i32,
        z: 1,
    }
}

/// The images of `framebuffer` touched by `aspect`, with the aspects each one carries.
fn aspect_images(
    framebuffer: &Framebuffer,
    aspect: vk::ImageAspectFlags,
) -> impl Iterator<Item = (&RenderImage, vk::ImageAspectFlags)> {
    let color = aspect & vk::ImageAspectFlags::COLOR;
    let depth_stencil = aspect & DEPTH_STENCIL & framebuffer.depth().aspect();
    [(framebuffer.color(), color), (framebuffer.depth(), depth_stencil)]
        .into_iter()
        .filter(|(_, aspect)| !aspect.is_empty())
}

impl QueueRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_backbuffer(&self) -> bool {
        self.backbuffer.is_some()
    }

    pub fn backbuffer(&self) -> Option<&Backbuffer> {
        self.backbuffer.as_ref()
    }

    /// Replace the backbuffer, returning the previous one.
    pub fn set_backbuffer(&mut self, backbuffer: Option<Backbuffer>) -> Option<Backbuffer> {
        std::mem::replace(&mut self.backbuffer, backbuffer)
    }

    /// Move an acquired swapchain image into attachment layout.
    pub fn begin_backbuffer<E>(&self, encoder: &mut E, image_index: u32)
    where
        E: CommandEncoder + ?Sized,
    {
        self.transition_swapchain_image(
            encoder,
            image_index,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
    }

    /// Move an acquired swapchain image back to present layout.
    pub fn end_backbuffer<E>(&self, encoder: &mut E, image_index: u32)
    where
        E: CommandEncoder + ?Sized,
    {
        self.transition_swapchain_image(
            encoder,
            image_index,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
    }

    fn transition_swapchain_image<E>(
        &self,
        encoder: &mut E,
        image_index: u32,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) where
        E: CommandEncoder + ?Sized,
    {
        let Some(image) = self
            .backbuffer
            .as_ref()
            .and_then(|bb| bb.images.get(image_index as usize))
        else {
            warn!(image_index, "No swapchain image to transition");
            return;
        };
        encoder.transition(&ImageTransition::new(
            *image,
            vk::ImageAspectFlags::COLOR,
            old,
            new,
        ));
    }

    /// Translate and drain `steps`.
    ///
    /// `image_index` is the acquired swapchain image, if any.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn run_steps<B, E>(
        &mut self,
        backend: &B,
        encoder: &mut E,
        steps: &mut Vec<Step>,
        image_index: Option<u32>,
    ) -> Result<()>
    where
        B: RenderBackend + ?Sized,
        E: CommandEncoder + ?Sized,
    {
        trace!(count = steps.len(), "Translating steps");
        for step in steps.drain(..) {
            match step {
                Step::Render(step) => self.run_render(encoder, &step, image_index),
                Step::Copy(step) => Self::run_copy(encoder, &step),
                Step::Blit(step) => Self::run_blit(encoder, &step),
                Step::Readback(step) => self.run_readback(backend, encoder, &step)?,
            }
        }
        Ok(())
    }

    fn run_render<E>(&self, encoder: &mut E, step: &RenderStep, image_index: Option<u32>)
    where
        E: CommandEncoder + ?Sized,
    {
        for pre in &step.pre_transitions {
            pre.framebuffer
                .image(pre.aspect)
                .transition_to(encoder, pre.layout);
        }

        let (color_view, depth) = match &step.framebuffer {
            Some(fb) => {
                fb.color()
                    .transition_to(encoder, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
                (fb.color().view(), fb.depth())
            }
            None => {
                let target = self
                    .backbuffer
                    .as_ref()
                    .zip(image_index)
                    .and_then(|(bb, index)| Some((bb.views.get(index as usize)?, &bb.depth)));
                let Some((view, depth)) = target else {
                    warn!(
                        commands = step.commands.len(),
                        "Skipping backbuffer step without a swapchain image"
                    );
                    return;
                };
                (*view, depth)
            }
        };
        depth.transition_to(encoder, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let extent = depth.extent();
        trace!(
            target = ?step.framebuffer.as_ref().map(|fb| fb.id()),
            draws = step.num_draws,
            "Render step"
        );
        encoder.begin_rendering(&RenderingTarget {
            color_view,
            depth_view: depth.view(),
            has_stencil: has_stencil(depth.format()),
            extent,
            color_load: step.color,
            depth_load: step.depth,
            stencil_load: step.stencil,
            clear: step.clear,
        });

        for command in &step.commands {
            match command {
                RenderCommand::Clear {
                    color,
                    depth,
                    stencil,
                    mask,
                } => encoder.clear_attachments(&AttachmentClear {
                    values: ClearValues::new(*color, *depth, *stencil),
                    mask: *mask,
                    extent,
                }),
                other => encoder.execute(other),
            }
        }
        encoder.end_rendering();

        if let (Some(fb), Some(layout)) = (&step.framebuffer, step.final_color_layout) {
            fb.color().transition_to(encoder, layout);
        }
    }

    fn run_copy<E>(encoder: &mut E, step: &CopyStep)
    where
        E: CommandEncoder + ?Sized,
    {
        trace!(src = step.src.id(), dst = step.dst.id(), "Copy step");
        let images = aspect_images(&step.src, step.aspect).zip(aspect_images(&step.dst, step.aspect));
        for ((src, aspect), (dst, _)) in images {
            src.transition_to(encoder, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            dst.transition_to(encoder, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let region = vk::ImageCopy {
                src_subresource: layers(aspect),
                src_offset: offset3d(step.src_rect.offset),
                dst_subresource: layers(aspect),
                dst_offset: offset3d(step.dst_pos),
                extent: vk::Extent3D {
                    width: step.src_rect.extent.width,
                    height: step.src_rect.extent.height,
                    depth: 1,
                },
            };
            encoder.copy_image(&ImageCopy {
                src: src.image(),
                dst: dst.image(),
                region,
            });
        }
    }

    fn run_blit<E>(encoder: &mut E, step: &BlitStep)
    where
        E: CommandEncoder + ?Sized,
    {
        trace!(src = step.src.id(), dst = step.dst.id(), "Blit step");
        let images = aspect_images(&step.src, step.aspect).zip(aspect_images(&step.dst, step.aspect));
        for ((src, aspect), (dst, _)) in images {
            src.transition_to(encoder, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            dst.transition_to(encoder, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let region = vk::ImageBlit {
                src_subresource: layers(aspect),
                src_offsets: [offset3d(step.src_rect.offset), rect_end(step.src_rect)],
                dst_subresource: layers(aspect),
                dst_offsets: [offset3d(step.dst_rect.offset), rect_end(step.dst_rect)],
            };
            encoder.blit_image(&ImageBlit {
                src: src.image(),
                dst: dst.image(),
                region,
                filter: step.filter,
            });
        }
    }

    fn run_readback<B, E>(&mut self, backend: &B, encoder: &mut E, step: &ReadbackStep) -> Result<()>
    where
        B: RenderBackend + ?Sized,
        E: CommandEncoder + ?Sized,
    {
        let image = step.src.image(step.aspect);
        let format = image.format();
        let texel = texel_size(format, step.aspect).ok_or(RenderError::UnsupportedReadback {
            src: format,
            aspect: step.aspect,
            dst: DataFormat::R8G8B8A8Unorm,
        })?;
        let size = u64::from(step.rect.extent.width) * u64::from(step.rect.extent.height) * texel as u64;
        let buffer = backend.readback_buffer(size)?;

        trace!(src = step.src.id(), size, "Readback step");
        image.transition_to(encoder, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: layers(step.aspect),
            image_offset: offset3d(step.rect.offset),
            image_extent: vk::Extent3D {
                width: step.rect.extent.width,
                height: step.rect.extent.height,
                depth: 1,
            },
        };
        encoder.copy_image_to_buffer(image.image(), buffer, &region);

        self.readback = Some(ReadbackInfo {
            format,
            aspect: step.aspect,
            width: step.rect.extent.width,
            height: step.rect.extent.height,
        });
        Ok(())
    }

    /// Convert the last readback into `out`, `row_stride` pixels per row.
    ///
    /// Only valid once the readback's submission has completed.
    pub fn read_readback<B>(
        &self,
        backend: &B,
        dst: DataFormat,
        out: &mut [u8],
        row_stride: u32,
    ) -> Result<()>
    where
        B: RenderBackend + ?Sized,
    {
        let info = self.readback.ok_or(RenderError::NoReadback)?;
        let texel = texel_size(info.format, info.aspect).ok_or(RenderError::UnsupportedReadback {
            src: info.format,
            aspect: info.aspect,
            dst,
        })?;
        let len = info.width as usize * info.height as usize * texel;
        let data = backend.read_readback(len)?;
        convert_readback(
            info.format,
            info.aspect,
            dst,
            info.width,
            info.height,
            &data,
            out,
            row_stride,
        )
    }
}
