//! Synchronization primitives.

use crate::context::LogicalDevice;
use crate::error::{Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

/// Owned binary semaphore.
pub struct Semaphore {
    raw: vk::Semaphore,
    device: Arc<LogicalDevice>,
}

impl Semaphore {
    /// Create an unsignalled semaphore.
    pub fn new(device: &Arc<LogicalDevice>) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the device is valid while the Arc is held.
        let raw = unsafe { device.create_semaphore(&create_info, None) }.op("vkCreateSemaphore")?;
        Ok(Self {
            raw,
            device: device.clone(),
        })
    }

    /// Raw handle.
    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: owners drop semaphores only after the device is idle.
        unsafe { self.device.destroy_semaphore(self.raw, None) };
    }
}

/// Owned fence.
pub struct Fence {
    raw: vk::Fence,
    device: Arc<LogicalDevice>,
}

impl Fence {
    /// Create a fence, optionally already signalled.
    pub fn new(device: &Arc<LogicalDevice>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the device is valid while the Arc is held.
        let raw = unsafe { device.create_fence(&create_info, None) }.op("vkCreateFence")?;
        Ok(Self {
            raw,
            device: device.clone(),
        })
    }

    /// Raw handle.
    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    /// Block until the fence is signalled.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn wait(&self) -> Result<()> {
        // SAFETY: the fence belongs to this device.
        unsafe { self.device.wait_for_fences(&[self.raw], true, u64::MAX) }
            .op("vkWaitForFences")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: owners drop fences only after the device is idle.
        unsafe { self.device.destroy_fence(self.raw, None) };
    }
}
