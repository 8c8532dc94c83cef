//! Vulkan instance creation and physical device selection.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Keep only the requested layers the loader actually reports.
///
/// Missing layers are logged and skipped rather than failing instance
/// creation.
pub fn filter_available_layers(
    requested: &[&'static CStr],
    available: &[vk::LayerProperties],
) -> Vec<&'static CStr> {
    requested
        .iter()
        .copied()
        .filter(|layer| {
            let found = available
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *layer));
            if !found {
                tracing::warn!("Layer {:?} not available, skipping", layer);
            }
            found
        })
        .collect()
}

/// Owned Vulkan instance.
///
/// Destroyed on drop; every object created from it (surfaces, devices)
/// holds an `Arc<Instance>` so it outlives them.
pub struct Instance {
    // Entry must be kept alive for the lifetime of the instance
    entry: ash::Entry,
    raw: ash::Instance,
}

impl Instance {
    /// Create a Vulkan instance able to present to `display`.
    pub fn new(app_name: &str, enable_validation: bool, display: RawDisplayHandle) -> Result<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions beyond
        // the library itself being well-behaved.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let app_name = CString::new(app_name)
            .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"framekit")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let extension_names: &[*const c_char] = ash_window::enumerate_required_extensions(display)
            .map_err(|e| GpuError::SurfaceCreation(format!("Unsupported display: {e}")))?;

        let layers = if enable_validation {
            // SAFETY: entry is a loaded Vulkan entry point.
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .op("vkEnumerateInstanceLayerProperties")?;
            filter_available_layers(&validation_layers(), &available)
        } else {
            Vec::new()
        };
        let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(extension_names)
            .enabled_layer_names(&layer_names);

        // SAFETY: create_info only borrows locals that outlive the call.
        let raw = unsafe { entry.create_instance(&create_info, None) }.op("vkCreateInstance")?;

        tracing::debug!("Vulkan instance created ({} layers)", layer_names.len());

        Ok(Self { entry, raw })
    }

    /// The loaded Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// The raw instance.
    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // SAFETY: all children hold an Arc to this instance, so none remain.
        unsafe { self.raw.destroy_instance(None) };
    }
}

/// What the selection heuristic needs to know about a physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub geometry_shader: bool,
}

impl DeviceCandidate {
    fn rank(&self) -> Option<u8> {
        match (self.device_type, self.geometry_shader) {
            (vk::PhysicalDeviceType::DISCRETE_GPU, true) => Some(3),
            (vk::PhysicalDeviceType::DISCRETE_GPU, false) => Some(2),
            (vk::PhysicalDeviceType::INTEGRATED_GPU, true) => Some(1),
            (vk::PhysicalDeviceType::INTEGRATED_GPU, false) => Some(0),
            _ => None,
        }
    }
}

/// Pick a device index from `candidates`.
///
/// Discrete GPUs beat integrated ones and geometry shader support breaks the
/// tie; among equals the first enumerated wins. Other device types are only
/// accepted when they are the sole device present.
pub fn pick_physical_device(candidates: &[DeviceCandidate]) -> Option<usize> {
    let mut best: Option<(usize, u8)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if let Some(rank) = candidate.rank() {
            if best.map_or(true, |(_, best_rank)| rank > best_rank) {
                best = Some((index, rank));
            }
        }
    }

    match best {
        Some((index, _)) => Some(index),
        None if candidates.len() == 1 => Some(0),
        None => None,
    }
}

/// Enumerate physical devices, log them, and select one.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = instance
        .enumerate_physical_devices()
        .op("vkEnumeratePhysicalDevices")?;

    tracing::info!("Found {} physical device(s)", devices.len());

    let candidates: Vec<DeviceCandidate> = devices
        .iter()
        .map(|&device| {
            let properties = instance.get_physical_device_properties(device);
            let features = instance.get_physical_device_features(device);
            let name = properties
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            tracing::info!(
                "  {} (id {:#x}, driver {:#x}, {:?})",
                name,
                properties.device_id,
                properties.driver_version,
                properties.device_type
            );

            DeviceCandidate {
                name,
                device_type: properties.device_type,
                geometry_shader: features.geometry_shader == vk::TRUE,
            }
        })
        .collect();

    let index = pick_physical_device(&candidates).ok_or_else(|| {
        GpuError::NoCompatibleDevice(format!(
            "{} device(s) enumerated, none discrete or integrated",
            candidates.len()
        ))
    })?;

    tracing::info!("Active device: {}", candidates[index].name);
    Ok(devices[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(device_type: vk::PhysicalDeviceType, geometry_shader: bool) -> DeviceCandidate {
        DeviceCandidate {
            name: format!("{device_type:?}"),
            device_type,
            geometry_shader,
        }
    }

    #[test]
    fn discrete_with_geometry_shader_wins() {
        let devices = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, false),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(pick_physical_device(&devices), Some(2));
    }

    #[test]
    fn integrated_accepted_without_discrete() {
        let devices = [
            candidate(vk::PhysicalDeviceType::CPU, true),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, false),
        ];
        assert_eq!(pick_physical_device(&devices), Some(1));
    }

    #[test]
    fn sole_device_accepted_unconditionally() {
        let devices = [candidate(vk::PhysicalDeviceType::CPU, false)];
        assert_eq!(pick_physical_device(&devices), Some(0));
    }

    #[test]
    fn no_ranked_device_among_many_fails() {
        let devices = [
            candidate(vk::PhysicalDeviceType::CPU, false),
            candidate(vk::PhysicalDeviceType::VIRTUAL_GPU, true),
        ];
        assert_eq!(pick_physical_device(&devices), None);
        assert_eq!(pick_physical_device(&[]), None);
    }

    #[test]
    fn selection_is_deterministic_among_equals() {
        let devices = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(pick_physical_device(&devices), Some(0));
        assert_eq!(pick_physical_device(&devices), Some(0));
    }

    #[test]
    fn missing_layers_are_dropped() {
        let mut present = vk::LayerProperties::default();
        for (dst, src) in present
            .layer_name
            .iter_mut()
            .zip(c"VK_LAYER_present".to_bytes_with_nul())
        {
            *dst = *src as c_char;
        }

        let requested = [c"VK_LAYER_present", c"VK_LAYER_missing"];
        let kept = filter_available_layers(&requested, &[present]);
        assert_eq!(kept, vec![c"VK_LAYER_present"]);
    }
}
