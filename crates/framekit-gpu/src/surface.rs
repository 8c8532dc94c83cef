//! Presentation surface for a platform window.
//!
//! Hides the raw-window-handle plumbing from application code.

use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::Instance;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// Owned `VkSurfaceKHR` with its extension loader.
pub struct Surface {
    raw: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
    _instance: Arc<Instance>,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The window must outlive the returned surface.
    pub unsafe fn from_window<W>(instance: &Arc<Instance>, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let raw = ash_window::create_surface(
            instance.entry(),
            instance.raw(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(format!("{e:?}")))?;

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.raw());

        Ok(Self {
            raw,
            loader,
            _instance: instance.clone(),
        })
    }

    /// The raw surface handle.
    pub fn raw(&self) -> vk::SurfaceKHR {
        self.raw
    }

    /// Whether `queue_family` of `physical_device` can present to this surface.
    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        // SAFETY: the surface and physical device belong to the same instance.
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.raw)
        }
        .op("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    /// Query capabilities, formats, and present modes.
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        // SAFETY: the surface and physical device belong to the same instance.
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.raw)
                .op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.raw)
                .op("vkGetPhysicalDeviceSurfaceFormatsKHR")?;

            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.raw)
                .op("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: swapchains hold an Arc to this surface, so none remain.
        unsafe { self.loader.destroy_surface(self.raw, None) };
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
