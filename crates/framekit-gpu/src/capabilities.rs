//! GPU capability detection.

use ash::vk;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Arm,
    ImgTec,
    Qualcomm,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x13B5 => Self::Arm,
            0x1010 => Self::ImgTec,
            0x5143 => Self::Qualcomm,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Device type (discrete, integrated, ...)
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Required alignment of dynamic uniform buffer offsets, in bytes.
    pub min_uniform_buffer_offset_alignment: u64,
    /// Granularity of flushes on non-coherent host-visible memory.
    pub non_coherent_atom_size: u64,
    /// Maximum dynamic uniform buffers per pipeline layout.
    pub max_descriptor_set_uniform_buffers_dynamic: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            max_descriptor_set_uniform_buffers_dynamic: properties
                .limits
                .max_descriptor_set_uniform_buffers_dynamic,

            device_local_memory_mb,
        }
    }

    /// Whether the device can bind at least one dynamic uniform buffer.
    pub fn supports_dynamic_uniforms(&self) -> bool {
        self.max_descriptor_set_uniform_buffers_dynamic >= 1
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x1010), GpuVendor::ImgTec);
        assert_eq!(GpuVendor::from_vendor_id(0xABCD), GpuVendor::Other(0xABCD));
    }

    #[test]
    fn dynamic_uniform_support_follows_limit() {
        let mut caps = GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".into(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_0,
            driver_version: 0,
            min_uniform_buffer_offset_alignment: 256,
            non_coherent_atom_size: 64,
            max_descriptor_set_uniform_buffers_dynamic: 8,
            device_local_memory_mb: 0,
        };
        assert!(caps.supports_dynamic_uniforms());

        caps.max_descriptor_set_uniform_buffers_dynamic = 0;
        assert!(!caps.supports_dynamic_uniforms());
    }
}
