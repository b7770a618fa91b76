//! Device capability queries.

use ash::vk;

/// Depth-stencil formats in order of preference.
pub const DEPTH_STENCIL_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify the vendor from its PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// What the selected device offers the render manager.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
    /// First entry of [`DEPTH_STENCIL_CANDIDATES`] usable as an optimal-tiling
    /// attachment.
    pub depth_stencil_format: Option<vk::Format>,
    pub max_image_dimension_2d: u32,
    pub device_local_memory_mb: u64,
}

impl GpuCapabilities {
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory = instance.get_physical_device_memory_properties(physical_device);

        let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
        if properties.api_version >= vk::API_VERSION_1_3 {
            let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3);
            instance.get_physical_device_features2(physical_device, &mut features);
        }

        let depth_stencil_format = pick_depth_stencil_format(|format| {
            instance
                .get_physical_device_format_properties(physical_device, format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        });

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            dynamic_rendering: vulkan_1_3.dynamic_rendering == vk::TRUE,
            synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,
            depth_stencil_format,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            device_local_memory_mb: memory
                .memory_heaps_as_slice()
                .iter()
                .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|heap| heap.size >> 20)
                .sum(),
        }
    }

    /// Vulkan 1.3 with dynamic rendering, synchronization2 and a packed
    /// depth-stencil attachment format.
    pub fn meets_requirements(&self) -> bool {
        self.api_version >= vk::API_VERSION_1_3
            && self.dynamic_rendering
            && self.synchronization2
            && self.depth_stencil_format.is_some()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM - depth {:?}",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.depth_stencil_format,
        )
    }
}

/// Pick the first depth-stencil candidate accepted by `supported`.
pub fn pick_depth_stencil_format(supported: impl Fn(vk::Format) -> bool) -> Option<vk::Format> {
    DEPTH_STENCIL_CANDIDATES
        .iter()
        .copied()
        .find(|&format| supported(format))
}
