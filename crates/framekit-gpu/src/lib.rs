//! Vulkan frame lifecycle and GPU synchronization.
//!
//! This crate provides:
//! - Instance, physical device, and queue selection
//! - Surface and swapchain management
//! - Memory allocation via gpu-allocator, plus buffer and texture upload
//! - Per-frame uniform slices addressed by dynamic offsets
//! - Frame slots (fences and semaphores) and the frame loop that drives them
//!
//! Every Vulkan object is owned by a wrapper that destroys it on drop and
//! holds an `Arc` to the device (or instance) it was created from.

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod frame_loop;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod uniform;
pub mod upload;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::CommandPool;
pub use context::{DeviceContext, DeviceContextBuilder, LogicalDevice, QueueFamilies};
pub use descriptors::{
    update_descriptor_set, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    DescriptorWrite,
};
pub use error::{GpuError, Result};
pub use frame::{FrameResourceSet, FrameSlot, SlotHandles};
pub use frame_loop::{FrameDevice, FrameLoop, FrameOutcome, VulkanFrameDevice};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage, MemoryUsage};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig};
pub use render_pass::{Framebuffers, RenderPass};
pub use surface::{Surface, SurfaceSupport};
pub use swapchain::{AcquiredImage, PresentStatus, Swapchain, SwapchainConfig};
pub use sync::{Fence, Semaphore};
pub use uniform::{DynamicUniformStream, SliceLayout, UniformSink};
pub use upload::{ResourceUploader, Texture};

pub use ash::vk;
