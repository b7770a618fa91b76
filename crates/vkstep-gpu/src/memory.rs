//! Image and buffer memory through gpu-allocator.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use std::sync::Arc;

/// Owns the device memory of every render image and readback buffer.
///
/// The inner allocator is dropped by [`GpuAllocator::shutdown`], which must
/// happen before the device is destroyed.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// # Safety
    /// The instance, device and physical device must be valid and must
    /// outlive the allocator.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator.as_mut().ok_or(GpuError::AllocatorShutDown)
    }

    /// Create a buffer and bind fresh memory at `location` to it.
    ///
    /// `GpuToCpu` buffers are persistently mapped.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.allocate(name, requirements, location, true);
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.allocator()?.free(allocation)?;
            return Err(e.into());
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Create an optimal-tiling image and bind fresh memory at `location` to it.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(name, requirements, location, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.allocator()?.free(allocation)?;
            return Err(e.into());
        }

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        Ok(self.allocator()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    /// Destroy `buffer` and return its memory.
    ///
    /// # Safety
    /// The GPU must no longer use the buffer.
    pub unsafe fn free_buffer(&mut self, mut buffer: GpuBuffer) -> Result<()> {
        self.device.destroy_buffer(buffer.buffer, None);
        match buffer.allocation.take() {
            Some(allocation) => Ok(self.allocator()?.free(allocation)?),
            None => Ok(()),
        }
    }

    /// Destroy `image` and return its memory.
    ///
    /// # Safety
    /// The GPU must no longer use the image, and all of its views must be gone.
    pub unsafe fn free_image(&mut self, mut image: GpuImage) -> Result<()> {
        self.device.destroy_image(image.image, None);
        match image.allocation.take() {
            Some(allocation) => Ok(self.allocator()?.free(allocation)?),
            None => Ok(()),
        }
    }

    /// Release all device memory. Outstanding allocations are logged as leaks.
    pub fn shutdown(&mut self) {
        drop(self.allocator.take());
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Copy `len` bytes starting at `offset` out of a host-visible buffer.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or(GpuError::NotHostVisible)?;
        let start = usize::try_from(offset).map_err(|_| GpuError::OutOfBounds {
            offset,
            len,
            size: self.size,
        })?;
        start
            .checked_add(len)
            .filter(|&end| end as u64 <= self.size)
            .and_then(|end| mapped.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or(GpuError::OutOfBounds {
                offset,
                len,
                size: self.size,
            })
    }
}

/// An image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}
