//! Device context: physical device, logical device, and queues.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::{select_physical_device, Instance};
use crate::memory::{memory_type_index, GpuAllocator};
use crate::surface::Surface;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr};
use std::ops::Deref;
use std::sync::Arc;

/// Owned logical device.
///
/// Shared through `Arc` by every object created from it; the device is
/// destroyed when the last holder drops, after waiting for it to go idle.
pub struct LogicalDevice {
    raw: ash::Device,
    _instance: Arc<Instance>,
}

impl Deref for LogicalDevice {
    type Target = ash::Device;

    fn deref(&self) -> &ash::Device {
        &self.raw
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        // SAFETY: no child object remains; each holds an Arc to this device.
        unsafe {
            let _ = self.raw.device_wait_idle();
            self.raw.destroy_device(None);
        }
        tracing::debug!("Logical device destroyed");
    }
}

/// Graphics and present queue family indices.
///
/// Resolved once during initialization and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Whether one family serves both graphics and presentation.
    pub fn is_unified(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_unified() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Find the graphics family and a present-capable family.
///
/// The graphics family is the first one advertising `GRAPHICS`. For
/// presentation the graphics family is preferred; otherwise the first family
/// for which `supports_present` answers true is used.
pub fn resolve_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Result<QueueFamilies>
where
    F: FnMut(u32) -> Result<bool>,
{
    let graphics = families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .ok_or_else(|| GpuError::NoCompatibleDevice("no graphics queue family".to_string()))?
        as u32;

    if supports_present(graphics)? {
        return Ok(QueueFamilies {
            graphics,
            present: graphics,
        });
    }

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if index == graphics || family.queue_count == 0 {
            continue;
        }
        if supports_present(index)? {
            return Ok(QueueFamilies {
                graphics,
                present: index,
            });
        }
    }

    Err(GpuError::NoPresentableQueue)
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Device features to enable: everything reported except robust buffer
/// access, which costs performance and is not needed for correctness.
pub fn enabled_features(supported: vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        robust_buffer_access: vk::FALSE,
        ..supported
    }
}

/// Main GPU context holding the device, its queues, and the allocator.
pub struct DeviceContext {
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    device: Arc<LogicalDevice>,
    capabilities: GpuCapabilities,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocator: Arc<Mutex<GpuAllocator>>,

    queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl DeviceContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the shared logical device.
    pub fn shared_device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the instance.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the device memory type table.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Index of the first memory type in `type_bits` carrying `required`.
    pub fn memory_type_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        memory_type_index(&self.memory_properties, type_bits, required).ok_or(
            GpuError::NoCompatibleMemoryType {
                type_bits,
                required,
            },
        )
    }

    /// Get the graphics and present queue families.
    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the present queue (may alias the graphics queue).
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is valid for the lifetime of self.
        unsafe { self.device.device_wait_idle() }.op("vkDeviceWaitIdle")
    }
}

/// Builder for creating a device context.
pub struct DeviceContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for DeviceContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "framekit".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl DeviceContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the device context together with the window's surface.
    ///
    /// Presentation support is a per-surface query, so the surface is created
    /// here, before queue families are resolved.
    pub fn build<W>(self, window: &W) -> Result<(DeviceContext, Arc<Surface>)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;

        let instance = Arc::new(Instance::new(
            &self.app_name,
            self.enable_validation,
            display.as_raw(),
        )?);

        // SAFETY: the instance is valid and the window outlives this call.
        let physical_device = unsafe { select_physical_device(instance.raw())? };

        // SAFETY: instance and physical device are valid.
        let capabilities = unsafe { GpuCapabilities::query(instance.raw(), physical_device) };
        tracing::info!("Selected GPU: {}", capabilities.summary());
        if !capabilities.supports_dynamic_uniforms() {
            return Err(GpuError::NoCompatibleDevice(format!(
                "{} cannot bind dynamic uniform buffers",
                capabilities.device_name
            )));
        }

        // SAFETY: the window provides valid handles for the surface's lifetime.
        let surface = Arc::new(unsafe { Surface::from_window(&instance, window)? });

        // SAFETY: instance and physical device are valid.
        let family_properties = unsafe {
            instance
                .raw()
                .get_physical_device_queue_family_properties(physical_device)
        };
        let queue_families = resolve_queue_families(&family_properties, |index| {
            surface.supports_present(physical_device, index)
        })?;

        tracing::info!(
            "Queue families: graphics {}, present {}",
            queue_families.graphics,
            queue_families.present
        );

        // SAFETY: instance and physical device are valid.
        let device = Arc::new(unsafe { create_device(&instance, physical_device, queue_families)? });

        // SAFETY: families were requested at device creation with one queue each.
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = if queue_families.is_unified() {
            graphics_queue
        } else {
            // SAFETY: as above.
            unsafe { device.get_device_queue(queue_families.present, 0) }
        };

        // SAFETY: instance and physical device are valid.
        let memory_properties = unsafe {
            instance
                .raw()
                .get_physical_device_memory_properties(physical_device)
        };

        let allocator = GpuAllocator::new(
            &instance,
            device.clone(),
            physical_device,
            capabilities.non_coherent_atom_size,
        )?;

        Ok((
            DeviceContext {
                instance,
                physical_device,
                device,
                capabilities,
                memory_properties,
                allocator: Arc::new(Mutex::new(allocator)),
                queue_families,
                graphics_queue,
                present_queue,
            },
            surface,
        ))
    }
}

/// Create the logical device with one queue per unique family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamilies,
) -> Result<LogicalDevice> {
    // Single queue per family, so the priority value is irrelevant.
    let queue_priority = 0.0_f32;
    let unique_families = queue_families.unique();
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names: Vec<*const c_char> = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let features = enabled_features(
        instance
            .raw()
            .get_physical_device_features(physical_device),
    );

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let raw = instance
        .raw()
        .create_device(physical_device, &device_create_info, None)
        .op("vkCreateDevice")?;

    Ok(LogicalDevice {
        raw,
        _instance: instance.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn graphics_family_preferred_for_present() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        let resolved = resolve_queue_families(&families, |_| Ok(true)).unwrap();
        assert_eq!(
            resolved,
            QueueFamilies {
                graphics: 1,
                present: 1
            }
        );
        assert!(resolved.is_unified());
        assert_eq!(resolved.unique(), vec![1]);
    }

    #[test]
    fn separate_present_family_found() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        let resolved = resolve_queue_families(&families, |index| Ok(index == 2)).unwrap();
        assert_eq!(resolved.graphics, 0);
        assert_eq!(resolved.present, 2);
        assert_eq!(resolved.unique(), vec![0, 2]);
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::GRAPHICS, 2),
        ];
        let resolved = resolve_queue_families(&families, |_| Ok(true)).unwrap();
        assert_eq!(resolved.graphics, 1);
    }

    #[test]
    fn no_present_support_is_an_error() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        let err = resolve_queue_families(&families, |_| Ok(false)).unwrap_err();
        assert!(matches!(err, GpuError::NoPresentableQueue));
    }

    #[test]
    fn no_graphics_family_is_an_error() {
        let families = [family(vk::QueueFlags::COMPUTE, 1)];
        let err = resolve_queue_families(&families, |_| Ok(true)).unwrap_err();
        assert!(matches!(err, GpuError::NoCompatibleDevice(_)));
    }

    #[test]
    fn robust_buffer_access_disabled_everything_else_kept() {
        let supported = vk::PhysicalDeviceFeatures {
            robust_buffer_access: vk::TRUE,
            geometry_shader: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let enabled = enabled_features(supported);
        assert_eq!(enabled.robust_buffer_access, vk::FALSE);
        assert_eq!(enabled.geometry_shader, vk::TRUE);
        assert_eq!(enabled.sampler_anisotropy, vk::TRUE);
    }
}
