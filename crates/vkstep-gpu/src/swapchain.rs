//! Swapchain management.

use crate::error::{GpuError, Result};
use ash::vk;

/// Result of presenting a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    /// Presented and the swapchain still matches the surface.
    Optimal,
    /// Presented, but the swapchain should be recreated.
    Suboptimal,
    /// The surface changed; the swapchain must be recreated.
    OutOfDate,
}

/// A swapchain with one color view per image.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Swapchain parameters chosen from a surface query.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub queue_family: u32,
}

impl SwapchainDesc {
    /// Pick format, present mode, extent and image count for a `width` x
    /// `height` window.
    pub fn choose(
        surface: vk::SurfaceKHR,
        support: &SurfaceSupport,
        width: u32,
        height: u32,
        vsync: bool,
        queue_family: u32,
    ) -> Result<Self> {
        Ok(Self {
            surface,
            format: select_surface_format(&support.formats)?,
            present_mode: select_present_mode(&support.present_modes, vsync),
            extent: calculate_extent(&support.capabilities, width, height),
            min_image_count: image_count(&support.capabilities),
            transform: support.capabilities.current_transform,
            queue_family,
        })
    }
}

/// Surface properties a swapchain is chosen from.
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl Swapchain {
    /// Create a swapchain for `desc`, retiring `old_swapchain` if given.
    ///
    /// The images are usable as color attachments and as transfer source or
    /// destination, so frames can be blitted to and read back from them.
    ///
    /// # Safety
    /// All handles must be valid. `old_swapchain` must not be in use.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        desc: &SwapchainDesc,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let queue_families = [desc.queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(desc.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or_default());

        let swapchain = swapchain_loader.create_swapchain(&create_info, None)?;
        let mut created = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format: desc.format.format,
            extent: desc.extent,
        };
        if let Err(e) = created.create_views(device, swapchain_loader) {
            created.destroy(device, swapchain_loader);
            return Err(e);
        }

        tracing::info!(
            images = created.images.len(),
            width = desc.extent.width,
            height = desc.extent.height,
            format = ?desc.format.format,
            present_mode = ?desc.present_mode,
            "Swapchain created"
        );
        Ok(created)
    }

    unsafe fn create_views(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) -> Result<()> {
        self.images = swapchain_loader.get_swapchain_images(self.swapchain)?;
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            self.image_views
                .push(device.create_image_view(&view_info, None)?);
        }
        Ok(())
    }

    /// Destroy the image views and the swapchain.
    ///
    /// # Safety
    /// No image of the swapchain may be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Acquire the next swapchain image, signalling `semaphore` when it is ready.
///
/// Returns `None` when the swapchain is out of date and no image was acquired.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub unsafe fn acquire_next_image(
    swapchain_loader: &ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    semaphore: vk::Semaphore,
    timeout_ns: u64,
) -> Result<Option<(u32, bool)>> {
    match swapchain_loader.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
    {
        Ok((index, suboptimal)) => Ok(Some((index, suboptimal))),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
        Err(e) => Err(GpuError::from(e)),
    }
}

/// Present an image.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub unsafe fn present_image(
    swapchain_loader: &ash::khr::swapchain::Device,
    queue: vk::Queue,
    swapchain: vk::SwapchainKHR,
    image_index: u32,
    wait_semaphores: &[vk::Semaphore],
) -> Result<PresentStatus> {
    let swapchains = [swapchain];
    let image_indices = [image_index];

    let present_info = vk::PresentInfoKHR::default()
        .wait_semaphores(wait_semaphores)
        .swapchains(&swapchains)
        .image_indices(&image_indices);

    match swapchain_loader.queue_present(queue, &present_info) {
        Ok(false) => Ok(PresentStatus::Optimal),
        Ok(true) => Ok(PresentStatus::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
        Err(e) => Err(GpuError::from(e)),
    }
}

/// Select the best surface format.
///
/// Prefers UNORM BGRA/RGBA so readbacks of the backbuffer format convert
/// without gamma changes; falls back to the first reported format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

    PREFERRED
        .iter()
        .find_map(|&wanted| {
            available.iter().copied().find(|f| {
                f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| available.first().copied())
        .ok_or(GpuError::NoSurfaceFormat)
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// One image more than the minimum so acquisition rarely blocks, capped by
/// the surface maximum (0 means unbounded).
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

/// The surface's current extent, or the window size clamped to the surface
/// limits when the surface lets the swapchain decide.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_unorm_bgra() {
        let available = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        let picked = select_surface_format(&available).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn falls_back_to_first_format() {
        let available = [format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        let picked = select_surface_format(&available).unwrap();
        assert_eq!(picked.format, vk::Format::A2B10G10R10_UNORM_PACK32);
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_selection() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn image_count_respects_surface_maximum() {
        let caps = vk::SurfaceCapabilitiesKHR::default().min_image_count(2);
        assert_eq!(image_count(&caps), 3);
        assert_eq!(image_count(&caps.max_image_count(2)), 2);
        assert_eq!(image_count(&caps.max_image_count(8)), 3);
    }

    #[test]
    fn extent_clamps_when_surface_is_flexible() {
        let caps = vk::SurfaceCapabilitiesKHR::default()
            .current_extent(vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            })
            .min_image_extent(vk::Extent2D {
                width: 16,
                height: 16,
            })
            .max_image_extent(vk::Extent2D {
                width: 1024,
                height: 1024,
            });
        let extent = calculate_extent(&caps, 4096, 8);
        assert_eq!((extent.width, extent.height), (1024, 16));
    }
}
