//! Window surfaces.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{SurfaceSupport, Swapchain, SwapchainDesc};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A window surface plus the extension loaders that operate on it.
///
/// The render manager only needs the swapchain images; creating and
/// recreating the swapchain stays with the owner of the window.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface for `window` and check that the graphics queue can
    /// present to it.
    ///
    /// # Safety
    /// `window` must outlive the returned surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let surface = ash_window::create_surface(
            gpu.entry(),
            gpu.instance(),
            window.display_handle()?.as_raw(),
            window.window_handle()?.as_raw(),
            None,
        )?;
        let surface_loader = ash::khr::surface::Instance::new(gpu.entry(), gpu.instance());

        let presentable = surface_loader.get_physical_device_surface_support(
            gpu.physical_device(),
            gpu.graphics_queue_family(),
            surface,
        );
        if !matches!(presentable, Ok(true)) {
            surface_loader.destroy_surface(surface, None);
            return Err(match presentable {
                Err(e) => e.into(),
                Ok(_) => GpuError::NotPresentable,
            });
        }

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader: ash::khr::swapchain::Device::new(gpu.instance(), gpu.device()),
        })
    }

    /// Query what the surface currently supports.
    pub fn support(&self, gpu: &GpuContext) -> Result<SurfaceSupport> {
        let physical_device = gpu.physical_device();
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }

    /// # Safety
    /// `old_swapchain`, if given, must not be in use.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Swapchain> {
        let desc = SwapchainDesc::choose(
            self.surface,
            &self.support(gpu)?,
            width,
            height,
            vsync,
            gpu.graphics_queue_family(),
        )?;
        Swapchain::new(gpu.device(), &self.swapchain_loader, &desc, old_swapchain)
    }

    /// Replace `old_swapchain` with one sized `width` x `height`.
    ///
    /// The old swapchain is handed to the driver for reuse, then destroyed
    /// whether or not the new one could be created.
    ///
    /// # Safety
    /// No image of `old_swapchain` may be in use.
    pub unsafe fn recreate_swapchain(
        &self,
        gpu: &GpuContext,
        old_swapchain: Swapchain,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Swapchain> {
        let result =
            self.create_swapchain(gpu, width, height, vsync, Some(old_swapchain.swapchain));
        old_swapchain.destroy(gpu.device(), &self.swapchain_loader);
        result
    }

    /// # Safety
    /// Every swapchain created for the surface must already be destroyed.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}
