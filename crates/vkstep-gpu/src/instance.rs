//! Instance creation and physical device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Window system surface extensions, enabled when the loader offers them.
const SURFACE_EXTENSIONS: [&CStr; 6] = [
    ash::khr::surface::NAME,
    ash::khr::win32_surface::NAME,
    ash::khr::xlib_surface::NAME,
    ash::khr::xcb_surface::NAME,
    ash::khr::wayland_surface::NAME,
    ash::ext::metal_surface::NAME,
];

/// Names in `wanted` that also appear in `available`.
fn filter_available<'a>(wanted: &[&'a CStr], available: &[&CStr]) -> Vec<&'a CStr> {
    wanted
        .iter()
        .copied()
        .filter(|name| available.contains(name))
        .collect()
}

/// # Safety
/// `entry` must be a loaded Vulkan library.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name).map_err(|_| GpuError::InvalidAppName)?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"vkstep")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_props = entry.enumerate_instance_extension_properties(None)?;
    let available: Vec<&CStr> = extension_props
        .iter()
        .filter_map(|props| props.extension_name_as_c_str().ok())
        .collect();
    let mut extensions = filter_available(&SURFACE_EXTENSIONS, &available);
    let mut flags = vk::InstanceCreateFlags::empty();
    if available.contains(&ash::khr::portability_enumeration::NAME) {
        extensions.push(ash::khr::portability_enumeration::NAME);
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }
    tracing::debug!(?extensions, "Enabling instance extensions");

    let mut layers = Vec::new();
    if enable_validation {
        let layer_props = entry.enumerate_instance_layer_properties()?;
        if layer_props
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
        {
            layers.push(VALIDATION_LAYER);
        } else {
            tracing::warn!("Validation requested but {VALIDATION_LAYER:?} is not installed");
        }
    }

    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|name| name.as_ptr()).collect();
    let layer_names: Vec<*const std::ffi::c_char> =
        layers.iter().map(|name| name.as_ptr()).collect();
    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// Pick the highest scoring device that runs Vulkan 1.3 and has a graphics
/// queue and the swapchain extension.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    instance
        .enumerate_physical_devices()?
        .into_iter()
        .filter(|&device| is_usable(instance, device))
        .max_by_key(|&device| {
            let properties = instance.get_physical_device_properties(device);
            let memory = instance.get_physical_device_memory_properties(device);
            device_score(properties.device_type, device_local_bytes(&memory))
        })
        .ok_or(GpuError::NoSuitableDevice)
}

unsafe fn is_usable(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let properties = instance.get_physical_device_properties(device);
    if properties.api_version < vk::API_VERSION_1_3 {
        return false;
    }
    let has_graphics = instance
        .get_physical_device_queue_family_properties(device)
        .iter()
        .any(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS));
    let has_swapchain = instance
        .enumerate_device_extension_properties(device)
        .unwrap_or_default()
        .iter()
        .any(|props| props.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME));
    has_graphics && has_swapchain
}

fn device_local_bytes(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    memory
        .memory_heaps_as_slice()
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

/// Discrete beats integrated beats virtual; VRAM breaks ties at one point per GiB.
fn device_score(device_type: vk::PhysicalDeviceType, device_local_bytes: u64) -> u64 {
    let type_score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };
    type_score + device_local_bytes / (1 << 30)
}
