//! Offscreen framebuffers and their images.

use crate::encoder::{CommandEncoder, ImageTransition};
use ash::vk;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use vkstep_gpu::GpuImage;

/// Role of an image in a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Color,
    DepthStencil,
}

/// Description of a 2D render image.
#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub kind: ImageKind,
}

impl ImageDesc {
    pub fn color(name: impl Into<String>, width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            format,
            kind: ImageKind::Color,
        }
    }

    pub fn depth_stencil(
        name: impl Into<String>,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            format,
            kind: ImageKind::DepthStencil,
        }
    }

    /// Image usage: sampled and transfer in both directions, plus the attachment role.
    pub fn usage(&self) -> vk::ImageUsageFlags {
        let base = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        match self.kind {
            ImageKind::Color => base | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ImageKind::DepthStencil => base | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }

    /// Aspects of the whole image.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        match self.kind {
            ImageKind::Color => vk::ImageAspectFlags::COLOR,
            ImageKind::DepthStencil if has_stencil(self.format) => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            ImageKind::DepthStencil => vk::ImageAspectFlags::DEPTH,
        }
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: 1,
        }
    }
}

/// Whether a depth format carries a stencil aspect.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::S8_UINT
    )
}

/// Check that a freshly created image may be moved into `layout`.
///
/// # Panics
/// Any layout other than color attachment, transfer destination or
/// depth-stencil attachment.
pub fn check_initial_layout(layout: vk::ImageLayout) {
    assert!(
        matches!(
            layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                | vk::ImageLayout::TRANSFER_DST_OPTIMAL
                | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        ),
        "unsupported initial image layout {layout:?}"
    );
}

/// A device image with its view and tracked layout.
///
/// The tracked layout is the layout the image will be in once every command
/// recorded so far has executed. Images are not freed on drop; hand them to
/// the backend's deferred deletion.
pub struct RenderImage {
    memory: GpuImage,
    view: vk::ImageView,
    aspect: vk::ImageAspectFlags,
    layout: Mutex<vk::ImageLayout>,
}

impl RenderImage {
    /// Wrap a freshly created image. The tracked layout starts as `UNDEFINED`.
    pub fn new(memory: GpuImage, view: vk::ImageView, aspect: vk::ImageAspectFlags) -> Self {
        Self {
            memory,
            view,
            aspect,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
        }
    }

    pub fn image(&self) -> vk::Image {
        self.memory.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.memory.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.memory.extent.width,
            height: self.memory.extent.height,
        }
    }

    /// Currently tracked layout.
    pub fn layout(&self) -> vk::ImageLayout {
        *self.layout.lock()
    }

    /// Record a transition to `layout` unless the image is already there.
    pub fn transition_to<E>(&self, encoder: &mut E, layout: vk::ImageLayout)
    where
        E: CommandEncoder + ?Sized,
    {
        let mut current = self.layout.lock();
        if *current == layout {
            return;
        }
        encoder.transition(&ImageTransition::new(
            self.memory.image,
            self.aspect,
            *current,
            layout,
        ));
        *current = layout;
    }

    /// Split into the allocation and view for destruction.
    pub fn into_parts(self) -> (GpuImage, vk::ImageView) {
        (self.memory, self.view)
    }
}

impl fmt::Debug for RenderImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderImage")
            .field("image", &self.memory.image)
            .field("format", &self.memory.format)
            .field("layout", &self.layout())
            .finish_non_exhaustive()
    }
}

static NEXT_FRAMEBUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An offscreen render target: one color image plus one depth-stencil image.
///
/// Shared as `Arc<Framebuffer>`; steps compare targets by pointer identity.
pub struct Framebuffer {
    id: u64,
    width: u32,
    height: u32,
    pub(crate) color: RenderImage,
    pub(crate) depth: RenderImage,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32, color: RenderImage, depth: RenderImage) -> Self {
        Self {
            id: NEXT_FRAMEBUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            color,
            depth,
        }
    }

    /// Process-unique id, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    pub fn color(&self) -> &RenderImage {
        &self.color
    }

    pub fn depth(&self) -> &RenderImage {
        &self.depth
    }

    /// The image holding `aspect`: color for `COLOR`, otherwise depth-stencil.
    pub fn image(&self, aspect: vk::ImageAspectFlags) -> &RenderImage {
        if aspect.contains(vk::ImageAspectFlags::COLOR) {
            &self.color
        } else {
            &self.depth
        }
    }

    /// Whether `rect` lies entirely inside the framebuffer.
    pub fn contains(&self, rect: vk::Rect2D) -> bool {
        let x = i64::from(rect.offset.x);
        let y = i64::from(rect.offset.y);
        x >= 0
            && y >= 0
            && x + i64::from(rect.extent.width) <= i64::from(self.width)
            && y + i64::from(rect.extent.height) <= i64::from(self.height)
    }

    pub(crate) fn into_images(self) -> (RenderImage, RenderImage) {
        (self.color, self.depth)
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Build a rectangle from position and size.
pub fn rect(x: i32, y: i32, width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x, y },
        extent: vk::Extent2D { width, height },
    }
}
