//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A named Vulkan call failed.
    #[error("{op} failed: {result:?}")]
    VulkanCall {
        /// The operation that failed, e.g. "vkCreateSwapchainKHR".
        op: &'static str,
        /// The API error code.
        result: vk::Result,
    },

    /// No physical device satisfies the selection rules.
    #[error("No compatible GPU found: {0}")]
    NoCompatibleDevice(String),

    /// No queue family can present to the surface.
    #[error("No queue family can present to the surface")]
    NoPresentableQueue,

    /// No memory type matches the requested property flags.
    ///
    /// Recoverable: the caller may retry with relaxed flags.
    #[error("No memory type in bits {type_bits:#x} has properties {required:?}")]
    NoCompatibleMemoryType {
        /// Memory type bits reported by the resource's requirements.
        type_bits: u32,
        /// Property flags that had to be present.
        required: vk::MemoryPropertyFlags,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the error leaves the caller a meaningful retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoCompatibleMemoryType { .. })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Tags a raw Vulkan result with the name of the call that produced it.
pub trait VkResultExt<T> {
    /// Convert into [`Result`], recording `op` as the failed operation.
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::VulkanCall { op, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_call_names_operation_and_code() {
        let err: Result<()> = Err(vk::Result::ERROR_DEVICE_LOST).op("vkQueueSubmit");
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("vkQueueSubmit"));
        assert!(msg.contains("ERROR_DEVICE_LOST"));
    }

    #[test]
    fn only_memory_type_errors_are_recoverable() {
        let err = GpuError::NoCompatibleMemoryType {
            type_bits: 0b11,
            required: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        assert!(err.is_recoverable());
        assert!(!GpuError::NoPresentableQueue.is_recoverable());
        assert!(!GpuError::NoCompatibleDevice("none".into()).is_recoverable());
    }
}
