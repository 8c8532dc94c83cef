//! Per-frame-slot synchronization objects and pre-recorded command buffers.

use crate::command::CommandPool;
use crate::context::LogicalDevice;
use crate::error::{GpuError, Result};
use crate::sync::{Fence, Semaphore};
use ash::vk;
use std::sync::Arc;

/// Raw handles of one frame slot, as seen by the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandles {
    pub image_acquired: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Synchronization objects for one frame in flight.
///
/// The fence starts signalled so the first wait on it returns immediately.
pub struct FrameSlot {
    pub image_acquired: Semaphore,
    pub render_finished: Semaphore,
    pub fence: Fence,
}

impl FrameSlot {
    fn new(device: &Arc<LogicalDevice>) -> Result<Self> {
        Ok(Self {
            image_acquired: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            fence: Fence::new(device, true)?,
        })
    }

    /// Raw handles.
    pub fn handles(&self) -> SlotHandles {
        SlotHandles {
            image_acquired: self.image_acquired.raw(),
            render_finished: self.render_finished.raw(),
            fence: self.fence.raw(),
        }
    }
}

/// Index into an image-major grid of `(image, slot)` command buffers.
pub fn grid_index(image: u32, slot: u32, slot_count: u32) -> usize {
    image as usize * slot_count as usize + slot as usize
}

/// All frame slots plus one command buffer per `(swapchain image, slot)`.
///
/// Command buffers are recorded once. Because a recording bakes in the
/// dynamic uniform offset of its slot, every image needs one buffer per slot.
pub struct FrameResourceSet {
    slots: Vec<FrameSlot>,
    command_buffers: Vec<vk::CommandBuffer>,
    image_count: u32,
    // Frees the grid when dropped.
    _pool: CommandPool,
}

impl FrameResourceSet {
    /// Create `slot_count` slots and the command buffer grid for
    /// `image_count` swapchain images.
    pub fn new(
        device: &Arc<LogicalDevice>,
        graphics_family: u32,
        slot_count: u32,
        image_count: u32,
    ) -> Result<Self> {
        if slot_count == 0 || image_count == 0 {
            return Err(GpuError::InvalidState(format!(
                "frame resources need slots and images (got {slot_count} slots, {image_count} images)"
            )));
        }

        let pool = CommandPool::new(device, graphics_family, vk::CommandPoolCreateFlags::empty())?;
        let command_buffers = pool.allocate_command_buffers(slot_count * image_count)?;

        let slots = (0..slot_count)
            .map(|_| FrameSlot::new(device))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "Frame resources: {} slots, {} images, {} command buffers",
            slot_count,
            image_count,
            command_buffers.len()
        );

        Ok(Self {
            slots,
            command_buffers,
            image_count,
            _pool: pool,
        })
    }

    /// Number of frame slots.
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of swapchain images the grid covers.
    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    /// Raw handles of every slot, in slot order.
    pub fn slot_handles(&self) -> Vec<SlotHandles> {
        self.slots.iter().map(FrameSlot::handles).collect()
    }

    /// Command buffer for `image` rendered through `slot`.
    pub fn command_buffer(&self, image: u32, slot: u32) -> Option<vk::CommandBuffer> {
        if image >= self.image_count || slot >= self.slot_count() {
            return None;
        }
        self.command_buffers
            .get(grid_index(image, slot, self.slot_count()))
            .copied()
    }

    /// The whole image-major grid.
    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_image_major() {
        assert_eq!(grid_index(0, 0, 2), 0);
        assert_eq!(grid_index(0, 1, 2), 1);
        assert_eq!(grid_index(1, 0, 2), 2);
        assert_eq!(grid_index(2, 1, 2), 5);
    }

    #[test]
    fn grid_indices_are_unique() {
        let (images, slots) = (3_u32, 2_u32);
        let mut seen = std::collections::HashSet::new();
        for image in 0..images {
            for slot in 0..slots {
                assert!(seen.insert(grid_index(image, slot, slots)));
            }
        }
        assert_eq!(seen.len(), (images * slots) as usize);
        assert!(seen.iter().all(|&i| i < (images * slots) as usize));
    }
}
