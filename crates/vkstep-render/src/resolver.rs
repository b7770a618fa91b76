//! Read-after-render dependency resolution.

use crate::framebuffer::Framebuffer;
use crate::step::Step;
use ash::vk;
use std::sync::Arc;

/// Declare that `framebuffer` is about to be sampled.
///
/// Walks `steps` backward to the nearest render step targeting
/// `framebuffer` and makes it leave the color image shader-readable.
/// Returns the index of that step, or `None` when the framebuffer was not
/// rendered in `steps` (its tracked layout is then handled by the consumer's
/// pre-transition).
///
/// # Panics
/// If the producer already declared a final layout other than
/// shader-read-only. Steps are never reordered to satisfy conflicting reads.
pub fn resolve_texture_read(steps: &mut [Step], framebuffer: &Arc<Framebuffer>) -> Option<usize> {
    for (index, step) in steps.iter_mut().enumerate().rev() {
        let Some(render) = step.as_render_mut() else {
            continue;
        };
        if !render.targets(Some(framebuffer)) {
            continue;
        }
        match render.final_color_layout {
            None => {
                render.final_color_layout = Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {}
            Some(other) => panic!(
                "framebuffer {} sampled after step {index} declared final layout {other:?}",
                framebuffer.id()
            ),
        }
        return Some(index);
    }
    None
}
