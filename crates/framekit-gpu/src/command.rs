//! Command buffer management.

use crate::context::LogicalDevice;
use crate::error::{GpuError, Result, VkResultExt};
use crate::sync::Fence;
use ash::vk;
use std::sync::Arc;

/// Command pool for allocating command buffers.
///
/// Buffers allocated from the pool are freed with it.
pub struct CommandPool {
    pool: vk::CommandPool,
    device: Arc<LogicalDevice>,
}

impl CommandPool {
    /// Create a new command pool.
    pub fn new(
        device: &Arc<LogicalDevice>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        // SAFETY: the family was requested at device creation.
        let pool =
            unsafe { device.create_command_pool(&create_info, None) }.op("vkCreateCommandPool")?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    /// Allocate a single primary command buffer.
    pub fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.allocate_command_buffers(1)?
            .pop()
            .ok_or_else(|| GpuError::InvalidState("driver returned no command buffer".into()))
    }

    /// Allocate multiple primary command buffers.
    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        // SAFETY: the pool belongs to this device.
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .op("vkAllocateCommandBuffers")
    }

    /// Return command buffers to the pool.
    ///
    /// # Safety
    /// The buffers must come from this pool and must not be pending.
    pub unsafe fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        self.device.free_command_buffers(self.pool, command_buffers);
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // SAFETY: owners drop the pool only after the device is idle.
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The command buffer must be in the initial state.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device
        .begin_command_buffer(cmd, &begin_info)
        .op("vkBeginCommandBuffer")
}

/// End recording a command buffer.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd).op("vkEndCommandBuffer")
}

/// Record commands with `f`, submit them, and block until they complete.
///
/// Completion is observed through a fresh fence rather than a queue-wide
/// idle wait. The command buffer is freed before returning.
pub fn execute_one_shot<F>(
    device: &Arc<LogicalDevice>,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let cmd = pool.allocate_command_buffer()?;
    let raw: &ash::Device = device;

    let submitted = (|| {
        // SAFETY: cmd was just allocated and is in the initial state.
        unsafe {
            begin_command_buffer(raw, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            f(raw, cmd);
            end_command_buffer(raw, cmd)?;
        }

        let fence = Fence::new(device, false)?;
        let cmd_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
        // SAFETY: cmd is executable and the fence is unsignalled.
        unsafe { raw.queue_submit(queue, &[submit_info], fence.raw()) }.op("vkQueueSubmit")?;
        fence.wait()
    })();

    // SAFETY: the fence wait observed completion, or submission never happened,
    // or the device is lost; cmd is not pending in any case.
    unsafe { pool.free(&[cmd]) };

    submitted
}
