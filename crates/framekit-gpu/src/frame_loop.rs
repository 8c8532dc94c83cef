//! The per-frame wait / acquire / write / submit / present sequence.
//!
//! Frame slots and swapchain images are indexed independently: the slot index
//! cycles over frames in flight, the image index is whatever the swapchain
//! hands out. A slot's fence is the only thing protecting its uniform slice
//! and its semaphores from reuse while the GPU may still read them.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result, VkResultExt};
use crate::frame::{grid_index, FrameResourceSet, SlotHandles};
use crate::swapchain::{AcquiredImage, PresentStatus, Swapchain};
use crate::uniform::UniformSink;
use ash::vk;

/// The GPU operations the frame loop issues.
pub trait FrameDevice {
    /// Block until `fence` is signalled.
    fn wait_fence(&mut self, fence: vk::Fence) -> Result<()>;

    /// Return `fence` to the unsignalled state.
    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    /// Acquire a swapchain image, signalling `image_acquired` when it is ready.
    fn acquire_next_image(&mut self, image_acquired: vk::Semaphore) -> Result<AcquiredImage>;

    /// Submit `command_buffer` after `wait`, signalling `signal` and `fence`.
    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Signal `fence` without doing any work.
    fn signal_fence(&mut self, fence: vk::Fence) -> Result<()>;

    /// Present `image_index` once `wait` is signalled.
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> Result<()>;
}

/// [`FrameDevice`] backed by a real device and swapchain.
pub struct VulkanFrameDevice<'a> {
    context: &'a DeviceContext,
    swapchain: &'a Swapchain,
}

impl<'a> VulkanFrameDevice<'a> {
    pub fn new(context: &'a DeviceContext, swapchain: &'a Swapchain) -> Self {
        Self { context, swapchain }
    }
}

impl FrameDevice for VulkanFrameDevice<'_> {
    fn wait_fence(&mut self, fence: vk::Fence) -> Result<()> {
        // SAFETY: fences handed to the frame loop belong to this device.
        unsafe { self.context.device().wait_for_fences(&[fence], true, u64::MAX) }
            .op("vkWaitForFences")
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        // SAFETY: the fence was just observed signalled, so it is not pending.
        unsafe { self.context.device().reset_fences(&[fence]) }.op("vkResetFences")
    }

    fn acquire_next_image(&mut self, image_acquired: vk::Semaphore) -> Result<AcquiredImage> {
        self.swapchain.acquire_next_image(image_acquired)
    }

    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [signal];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // SAFETY: the command buffer was recorded at startup and its slot's
        // fence has been waited on, so it is not pending.
        unsafe {
            self.context
                .device()
                .queue_submit(self.context.graphics_queue(), &[submit_info], fence)
        }
        .op("vkQueueSubmit")
    }

    fn signal_fence(&mut self, fence: vk::Fence) -> Result<()> {
        // SAFETY: an empty submission only signals the unsignalled fence.
        unsafe {
            self.context
                .device()
                .queue_submit(self.context.graphics_queue(), &[], fence)
        }
        .op("vkQueueSubmit")
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus> {
        self.swapchain
            .present(self.context.present_queue(), image_index, wait)
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.context.wait_idle()
    }
}

/// What one [`FrameLoop::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was rendered and queued for presentation.
    Presented {
        slot: u32,
        image_index: u32,
        status: PresentStatus,
    },
    /// No image could be acquired; the slot was not consumed.
    Skipped { slot: u32 },
}

/// Drives frames through a fixed ring of frame slots.
pub struct FrameLoop {
    slots: Vec<SlotHandles>,
    command_buffers: Vec<vk::CommandBuffer>,
    image_count: u32,
    current_slot: u32,
    frames_presented: u64,
    swapchain_warned: bool,
}

impl FrameLoop {
    /// Create a loop over `slots` and an image-major `(image, slot)` grid of
    /// pre-recorded command buffers.
    pub fn new(
        slots: Vec<SlotHandles>,
        command_buffers: Vec<vk::CommandBuffer>,
        image_count: u32,
    ) -> Result<Self> {
        let expected = slots.len() * image_count as usize;
        if slots.is_empty() || command_buffers.len() != expected {
            return Err(GpuError::InvalidState(format!(
                "{} command buffers for {} slots x {} images",
                command_buffers.len(),
                slots.len(),
                image_count
            )));
        }

        Ok(Self {
            slots,
            command_buffers,
            image_count,
            current_slot: 0,
            frames_presented: 0,
            swapchain_warned: false,
        })
    }

    /// Create a loop over a [`FrameResourceSet`].
    pub fn for_resources(resources: &FrameResourceSet) -> Result<Self> {
        Self::new(
            resources.slot_handles(),
            resources.command_buffers().to_vec(),
            resources.image_count(),
        )
    }

    /// Slot the next step will use.
    pub fn current_slot(&self) -> u32 {
        self.current_slot
    }

    /// Number of frame slots.
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Frames queued for presentation so far.
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    fn note_swapchain_status(&mut self, what: &str) {
        if self.swapchain_warned {
            tracing::trace!("Swapchain {what}; resize handling is not implemented");
        } else {
            tracing::warn!("Swapchain {what}; resize handling is not implemented");
            self.swapchain_warned = true;
        }
    }

    /// Run one frame, writing `uniform_data` into the current slot's slice.
    #[tracing::instrument(level = "trace", skip_all, fields(slot = self.current_slot))]
    pub fn step<D, U>(
        &mut self,
        device: &mut D,
        uniforms: &mut U,
        uniform_data: &[u8],
    ) -> Result<FrameOutcome>
    where
        D: FrameDevice + ?Sized,
        U: UniformSink + ?Sized,
    {
        let slot = self.current_slot;
        let handles = self.slots[slot as usize];

        device.wait_fence(handles.fence)?;
        device.reset_fence(handles.fence)?;

        // Until a submit succeeds nothing will signal the fence, so every
        // other exit signals it here.
        let image_index = match self.acquire_and_submit(device, uniforms, uniform_data, slot) {
            Ok(Some(image_index)) => image_index,
            Ok(None) => {
                device.signal_fence(handles.fence)?;
                self.note_swapchain_status("out of date on acquire");
                return Ok(FrameOutcome::Skipped { slot });
            }
            Err(e) => {
                if let Err(signal_err) = device.signal_fence(handles.fence) {
                    tracing::error!("Failed to re-signal fence of slot {slot}: {signal_err}");
                }
                return Err(e);
            }
        };

        let status = device.present(image_index, handles.render_finished)?;
        match status {
            PresentStatus::Optimal => {}
            PresentStatus::Suboptimal => self.note_swapchain_status("suboptimal on present"),
            PresentStatus::OutOfDate => self.note_swapchain_status("out of date on present"),
        }

        self.frames_presented += 1;
        self.current_slot = (slot + 1) % self.slot_count();

        Ok(FrameOutcome::Presented {
            slot,
            image_index,
            status,
        })
    }

    /// Acquire, write the slot's uniforms, and submit. `None` means the
    /// swapchain was out of date and nothing was submitted.
    fn acquire_and_submit<D, U>(
        &mut self,
        device: &mut D,
        uniforms: &mut U,
        uniform_data: &[u8],
        slot: u32,
    ) -> Result<Option<u32>>
    where
        D: FrameDevice + ?Sized,
        U: UniformSink + ?Sized,
    {
        let handles = self.slots[slot as usize];

        let image_index = match device.acquire_next_image(handles.image_acquired)? {
            AcquiredImage::Ready { index, suboptimal } => {
                if suboptimal {
                    self.note_swapchain_status("suboptimal on acquire");
                }
                index
            }
            AcquiredImage::OutOfDate => return Ok(None),
        };

        if image_index >= self.image_count {
            return Err(GpuError::InvalidState(format!(
                "acquired image {image_index} of {}",
                self.image_count
            )));
        }

        uniforms.write_slice(slot, uniform_data)?;

        let command_buffer =
            self.command_buffers[grid_index(image_index, slot, self.slot_count())];
        device.submit(
            command_buffer,
            handles.image_acquired,
            handles.render_finished,
            handles.fence,
        )?;
        Ok(Some(image_index))
    }

    /// Wait for all GPU work, then confirm every slot's fence is signalled.
    ///
    /// Fences are left signalled so any later wait returns immediately.
    pub fn shutdown<D: FrameDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        device.wait_idle()?;
        for handles in &self.slots {
            device.wait_fence(handles.fence)?;
        }
        tracing::debug!(
            "Frame loop stopped after {} presented frames",
            self.frames_presented
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniform::SliceLayout;
    use ash::vk::Handle;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FenceState {
        signaled: bool,
        waits: u32,
        resets: u32,
    }

    /// Executes submissions instantly: a submit signals its fence at once.
    struct MockDevice {
        fences: HashMap<u64, FenceState>,
        image_count: u32,
        next_image: u32,
        acquire_results: Vec<Result<AcquiredImage>>,
        present_results: Vec<PresentStatus>,
        fail_submit: bool,
        submitted: Vec<vk::CommandBuffer>,
        presented: Vec<u32>,
        idle_waits: u32,
    }

    impl MockDevice {
        fn new(slots: &[SlotHandles], image_count: u32) -> Self {
            let fences = slots
                .iter()
                .map(|s| {
                    (
                        s.fence.as_raw(),
                        FenceState {
                            signaled: true,
                            ..Default::default()
                        },
                    )
                })
                .collect();
            Self {
                fences,
                image_count,
                next_image: 0,
                acquire_results: Vec::new(),
                present_results: Vec::new(),
                fail_submit: false,
                submitted: Vec::new(),
                presented: Vec::new(),
                idle_waits: 0,
            }
        }

        fn fence(&mut self, fence: vk::Fence) -> &mut FenceState {
            self.fences
                .get_mut(&fence.as_raw())
                .expect("unknown fence")
        }
    }

    impl FrameDevice for MockDevice {
        fn wait_fence(&mut self, fence: vk::Fence) -> Result<()> {
            let state = self.fence(fence);
            if !state.signaled {
                // Nothing is in flight in the mock, so this wait would hang.
                return Err(GpuError::InvalidState("wait on unsignalled fence".into()));
            }
            state.waits += 1;
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
            let state = self.fence(fence);
            state.signaled = false;
            state.resets += 1;
            Ok(())
        }

        fn acquire_next_image(&mut self, _: vk::Semaphore) -> Result<AcquiredImage> {
            if !self.acquire_results.is_empty() {
                return self.acquire_results.remove(0);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquiredImage::Ready {
                index,
                suboptimal: false,
            })
        }

        fn submit(
            &mut self,
            command_buffer: vk::CommandBuffer,
            _: vk::Semaphore,
            _: vk::Semaphore,
            fence: vk::Fence,
        ) -> Result<()> {
            if self.fail_submit {
                return Err(GpuError::VulkanCall {
                    op: "vkQueueSubmit",
                    result: vk::Result::ERROR_DEVICE_LOST,
                });
            }
            self.submitted.push(command_buffer);
            self.fence(fence).signaled = true;
            Ok(())
        }

        fn signal_fence(&mut self, fence: vk::Fence) -> Result<()> {
            self.fence(fence).signaled = true;
            Ok(())
        }

        fn present(&mut self, image_index: u32, _: vk::Semaphore) -> Result<PresentStatus> {
            self.presented.push(image_index);
            if self.present_results.is_empty() {
                Ok(PresentStatus::Optimal)
            } else {
                Ok(self.present_results.remove(0))
            }
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.idle_waits += 1;
            Ok(())
        }
    }

    struct HostSlices {
        layout: SliceLayout,
        bytes: Vec<u8>,
        writes: Vec<u32>,
    }

    impl HostSlices {
        fn new(slots: u32) -> Self {
            let layout = SliceLayout::new(slots, 16, 64).unwrap();
            Self {
                bytes: vec![0; layout.total_size() as usize],
                layout,
                writes: Vec::new(),
            }
        }
    }

    impl UniformSink for HostSlices {
        fn slice_count(&self) -> u32 {
            self.layout.slice_count()
        }

        fn write_slice(&mut self, slice: u32, data: &[u8]) -> Result<()> {
            self.writes.push(slice);
            self.layout.write_into(&mut self.bytes, slice, data)
        }
    }

    fn fixture(slot_count: u32, image_count: u32) -> (FrameLoop, MockDevice, HostSlices) {
        let slots: Vec<SlotHandles> = (0..u64::from(slot_count))
            .map(|i| SlotHandles {
                image_acquired: vk::Semaphore::from_raw(100 + i),
                render_finished: vk::Semaphore::from_raw(200 + i),
                fence: vk::Fence::from_raw(300 + i),
            })
            .collect();
        let command_buffers = (0..u64::from(slot_count * image_count))
            .map(|i| vk::CommandBuffer::from_raw(1000 + i))
            .collect();

        let device = MockDevice::new(&slots, image_count);
        let frame_loop = FrameLoop::new(slots, command_buffers, image_count).unwrap();
        (frame_loop, device, HostSlices::new(slot_count))
    }

    #[test]
    fn cold_start_first_frame_completes() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 3);

        let outcome = frame_loop
            .step(&mut device, &mut uniforms, &[1; 16])
            .unwrap();

        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                slot: 0,
                image_index: 0,
                status: PresentStatus::Optimal
            }
        );
        assert_eq!(device.presented, vec![0]);
        assert_eq!(device.submitted, vec![vk::CommandBuffer::from_raw(1000)]);
        assert_eq!(frame_loop.current_slot(), 1);
    }

    #[test]
    fn steady_state_cycles_each_slot_twice() {
        let slot_count = 3;
        let (mut frame_loop, mut device, mut uniforms) = fixture(slot_count, 2);

        let mut visited = Vec::new();
        for _ in 0..2 * slot_count {
            match frame_loop
                .step(&mut device, &mut uniforms, &[7; 16])
                .unwrap()
            {
                FrameOutcome::Presented { slot, .. } => visited.push(slot),
                FrameOutcome::Skipped { .. } => panic!("unexpected skip"),
            }
        }

        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(uniforms.writes, visited);
        for state in device.fences.values() {
            assert_eq!(state.waits, 2);
            assert_eq!(state.resets, 2);
        }
        assert_eq!(frame_loop.frames_presented(), 6);
    }

    #[test]
    fn slot_and_image_indices_are_decoupled() {
        // Two slots over three images: the grid entry follows both indices.
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 3);
        for _ in 0..6 {
            frame_loop
                .step(&mut device, &mut uniforms, &[0; 16])
                .unwrap();
        }

        let expected: Vec<vk::CommandBuffer> = [(0, 0), (1, 1), (2, 0), (0, 1), (1, 0), (2, 1)]
            .iter()
            .map(|&(image, slot)| {
                vk::CommandBuffer::from_raw(1000 + grid_index(image, slot, 2) as u64)
            })
            .collect();
        assert_eq!(device.submitted, expected);
        assert_eq!(device.presented, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn fences_signalled_after_shutdown() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 2);
        for _ in 0..3 {
            frame_loop
                .step(&mut device, &mut uniforms, &[0; 16])
                .unwrap();
        }

        frame_loop.shutdown(&mut device).unwrap();
        assert_eq!(device.idle_waits, 1);

        // Every fence can still be waited on without hanging.
        let fences: Vec<vk::Fence> = device
            .fences
            .keys()
            .map(|&raw| vk::Fence::from_raw(raw))
            .collect();
        for fence in fences {
            device.wait_fence(fence).unwrap();
            assert!(device.fence(fence).signaled);
        }
    }

    #[test]
    fn out_of_date_acquire_skips_without_deadlock() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 2);
        device.acquire_results.push(Ok(AcquiredImage::OutOfDate));

        let outcome = frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped { slot: 0 });
        assert_eq!(frame_loop.current_slot(), 0);
        assert!(device.submitted.is_empty());
        assert!(uniforms.writes.is_empty());

        // The same slot is retried and its fence does not block.
        let outcome = frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { slot: 0, .. }));
        frame_loop.shutdown(&mut device).unwrap();
    }

    #[test]
    fn failed_acquire_leaves_fence_signalled() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 2);
        device.acquire_results.push(Err(GpuError::VulkanCall {
            op: "vkAcquireNextImageKHR",
            result: vk::Result::ERROR_SURFACE_LOST_KHR,
        }));

        let err = frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::VulkanCall {
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
                ..
            }
        ));
        assert!(device.submitted.is_empty());
        assert!(device.fence(vk::Fence::from_raw(300)).signaled);
        frame_loop.shutdown(&mut device).unwrap();
    }

    #[test]
    fn out_of_range_image_leaves_fence_signalled() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 2);
        device.acquire_results.push(Ok(AcquiredImage::Ready {
            index: 5,
            suboptimal: false,
        }));

        assert!(frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .is_err());
        assert!(uniforms.writes.is_empty());
        frame_loop.shutdown(&mut device).unwrap();
    }

    #[test]
    fn failed_uniform_write_leaves_fence_signalled() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 2);

        // Larger than one slice.
        assert!(frame_loop
            .step(&mut device, &mut uniforms, &[0; 32])
            .is_err());
        assert!(device.submitted.is_empty());
        frame_loop.shutdown(&mut device).unwrap();
    }

    #[test]
    fn failed_submit_leaves_fence_signalled() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 2);
        device.fail_submit = true;

        let err = frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::VulkanCall {
                op: "vkQueueSubmit",
                ..
            }
        ));
        assert_eq!(frame_loop.current_slot(), 0);
        assert_eq!(frame_loop.frames_presented(), 0);
        frame_loop.shutdown(&mut device).unwrap();
    }

    #[test]
    fn stale_present_is_logged_and_ignored() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(2, 2);
        device
            .present_results
            .extend([PresentStatus::OutOfDate, PresentStatus::Suboptimal]);

        let first = frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .unwrap();
        assert_eq!(
            first,
            FrameOutcome::Presented {
                slot: 0,
                image_index: 0,
                status: PresentStatus::OutOfDate
            }
        );
        assert!(frame_loop.swapchain_warned);

        let second = frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .unwrap();
        assert_eq!(
            second,
            FrameOutcome::Presented {
                slot: 1,
                image_index: 1,
                status: PresentStatus::Suboptimal
            }
        );

        // Both slots come round again without blocking.
        for _ in 0..2 {
            let outcome = frame_loop
                .step(&mut device, &mut uniforms, &[0; 16])
                .unwrap();
            assert!(matches!(
                outcome,
                FrameOutcome::Presented {
                    status: PresentStatus::Optimal,
                    ..
                }
            ));
        }
        assert_eq!(frame_loop.frames_presented(), 4);
        frame_loop.shutdown(&mut device).unwrap();
    }

    #[test]
    fn suboptimal_acquire_still_presents() {
        let (mut frame_loop, mut device, mut uniforms) = fixture(1, 2);
        device.acquire_results.push(Ok(AcquiredImage::Ready {
            index: 1,
            suboptimal: true,
        }));

        let outcome = frame_loop
            .step(&mut device, &mut uniforms, &[0; 16])
            .unwrap();
        assert!(matches!(
            outcome,
            FrameOutcome::Presented { image_index: 1, .. }
        ));
        assert!(frame_loop.swapchain_warned);
    }

    #[test]
    fn mismatched_grid_rejected() {
        let slots = vec![SlotHandles {
            image_acquired: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            fence: vk::Fence::null(),
        }];
        assert!(FrameLoop::new(slots, vec![vk::CommandBuffer::null()], 2).is_err());
        assert!(FrameLoop::new(Vec::new(), Vec::new(), 2).is_err());
    }
}
