//! Physical device (GPU) selection.
//!
//! The renderer drives everything through one general-purpose queue, so a GPU
//! qualifies only if a single queue family supports graphics, compute,
//! transfer and presentation to the window surface. Among qualifying GPUs,
//! discrete ones win, then larger device-local memory.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::backend::DeviceLimits;
use crate::error::RhiError;

/// Information about the selected physical device.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// The general-purpose queue family used for all submissions.
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Device")
        }
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Limits the resource containers lay out their buffers against.
    pub fn limits(&self) -> DeviceLimits {
        DeviceLimits::from_vk(&self.properties.limits)
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_family", &self.queue_family)
            .field("limits", &self.limits())
            .finish()
    }
}

/// Selects the most suitable physical device for rendering to `surface`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no GPU exposes a general-purpose
/// queue family that can present to the surface, or none supports Vulkan 1.3.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance, device, surface, surface_loader))
        .max_by_key(rate_device)
        .ok_or(RhiError::NoSuitableGpu)?;

    info!(
        "Selected GPU: '{}' ({}), queue family {}",
        selected.device_name(),
        selected.device_type_name(),
        selected.queue_family
    );

    Ok(selected)
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    let device_name = unsafe {
        CStr::from_ptr(properties.device_name.as_ptr())
            .to_str()
            .unwrap_or("Unknown")
    };

    let version = properties.api_version;
    if !supports_vulkan_1_3(version) {
        debug!(
            "GPU '{}' skipped: Vulkan 1.3 not supported (version: {}.{})",
            device_name,
            vk::api_version_major(version),
            vk::api_version_minor(version)
        );
        return None;
    }

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let queue_family = families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let presents = unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        };
        (is_general_purpose(family) && presents).then_some(index)
    });

    let Some(queue_family) = queue_family else {
        debug!(
            "GPU '{}' skipped: no general-purpose queue family that can present",
            device_name
        );
        return None;
    };

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_family,
    })
}

fn supports_vulkan_1_3(version: u32) -> bool {
    let major = vk::api_version_major(version);
    let minor = vk::api_version_minor(version);
    major > 1 || (major == 1 && minor >= 3)
}

fn is_general_purpose(family: &vk::QueueFamilyProperties) -> bool {
    family.queue_count > 0
        && family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
}

/// Higher scores indicate more desirable devices.
fn rate_device(info: &PhysicalDeviceInfo) -> u64 {
    let type_score = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    };
    let vram_mb = info.device_local_memory() / (1024 * 1024);
    type_score * 1_000_000 + vram_mb.min(999_999)
}
