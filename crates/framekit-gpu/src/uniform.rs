//! Per-frame uniform data in one dynamically offset buffer.
//!
//! Each frame slot owns one aligned slice of a single persistently mapped
//! buffer. Draws select the slice with a dynamic offset, so one descriptor
//! serves every slot.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer, MemoryUsage};
use ash::vk;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// Round `raw_size` up to the next multiple of `min_alignment`.
///
/// An alignment of zero is treated as one.
pub fn compute_slice_stride(raw_size: u64, min_alignment: u64) -> u64 {
    let alignment = min_alignment.max(1);
    raw_size.div_ceil(alignment) * alignment
}

/// Byte layout of `slice_count` equally sized, aligned slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceLayout {
    slice_count: u32,
    raw_size: u64,
    stride: u64,
}

impl SliceLayout {
    /// Lay out `slice_count` slices of `raw_size` bytes.
    pub fn new(slice_count: u32, raw_size: u64, min_alignment: u64) -> Result<Self> {
        if slice_count == 0 || raw_size == 0 {
            return Err(GpuError::InvalidState(format!(
                "uniform stream needs at least one non-empty slice (got {slice_count} x {raw_size} bytes)"
            )));
        }

        let stride = compute_slice_stride(raw_size, min_alignment);
        let total = stride
            .checked_mul(u64::from(slice_count))
            .filter(|total| *total <= u64::from(u32::MAX))
            .ok_or_else(|| {
                GpuError::InvalidState("uniform stream exceeds dynamic offset range".into())
            })?;
        debug_assert!(total >= raw_size);

        Ok(Self {
            slice_count,
            raw_size,
            stride,
        })
    }

    /// Number of slices.
    pub fn slice_count(&self) -> u32 {
        self.slice_count
    }

    /// Distance between slice starts.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Size of the whole buffer.
    pub fn total_size(&self) -> u64 {
        self.stride * u64::from(self.slice_count)
    }

    /// Dynamic offset selecting `slice`.
    pub fn binding_offset_for(&self, slice: u32) -> u32 {
        // Cannot overflow: the total size was checked against u32::MAX.
        (u64::from(slice) * self.stride) as u32
    }

    /// Byte range owned by `slice`.
    pub fn slice_range(&self, slice: u32) -> Range<usize> {
        let start = (u64::from(slice) * self.stride) as usize;
        start..start + self.stride as usize
    }

    fn check_write(&self, slice: u32, len: usize) -> Result<()> {
        if slice >= self.slice_count {
            return Err(GpuError::InvalidState(format!(
                "slice {slice} out of range (count {})",
                self.slice_count
            )));
        }
        if len as u64 > self.raw_size {
            return Err(GpuError::InvalidState(format!(
                "{len} bytes exceed slice size {}",
                self.raw_size
            )));
        }
        Ok(())
    }

    /// Copy `data` into `slice` of a host-side image of the buffer.
    pub fn write_into(&self, bytes: &mut [u8], slice: u32, data: &[u8]) -> Result<()> {
        self.check_write(slice, data.len())?;
        let start = self.slice_range(slice).start;
        let target = bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| GpuError::InvalidState("slice lies outside the buffer".into()))?;
        target.copy_from_slice(data);
        Ok(())
    }
}

/// Destination for per-slot uniform writes.
pub trait UniformSink {
    /// Number of independently writable slices.
    fn slice_count(&self) -> u32;

    /// Overwrite the start of `slice` with `data`.
    fn write_slice(&mut self, slice: u32, data: &[u8]) -> Result<()>;
}

/// One host-visible buffer split into per-frame slices.
pub struct DynamicUniformStream {
    buffer: GpuBuffer,
    layout: SliceLayout,
}

impl DynamicUniformStream {
    /// Allocate and persistently map a buffer for `slice_count` slices.
    ///
    /// `min_alignment` is the device's `minUniformBufferOffsetAlignment`.
    pub fn allocate(
        allocator: &Arc<Mutex<GpuAllocator>>,
        min_alignment: u64,
        slice_count: u32,
        raw_size: u64,
    ) -> Result<Self> {
        let layout = SliceLayout::new(slice_count, raw_size, min_alignment)?;
        let buffer = GpuBuffer::new(
            allocator,
            layout.total_size(),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUsage::HostVisible,
            "dynamic uniform stream",
        )?;

        tracing::debug!(
            "Uniform stream: {} slices, {} bytes each, stride {} (alignment {}, coherent: {})",
            slice_count,
            raw_size,
            layout.stride(),
            min_alignment,
            buffer.is_host_coherent()
        );

        Ok(Self { buffer, layout })
    }

    /// Slice layout.
    pub fn layout(&self) -> &SliceLayout {
        &self.layout
    }

    /// Underlying buffer handle for descriptor writes.
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Range one descriptor binding covers.
    pub fn descriptor_range(&self) -> u64 {
        self.layout.stride()
    }

    /// Dynamic offset selecting `slice`.
    pub fn binding_offset_for(&self, slice: u32) -> u32 {
        self.layout.binding_offset_for(slice)
    }
}

impl UniformSink for DynamicUniformStream {
    fn slice_count(&self) -> u32 {
        self.layout.slice_count()
    }

    fn write_slice(&mut self, slice: u32, data: &[u8]) -> Result<()> {
        self.layout.check_write(slice, data.len())?;
        let offset = u64::from(self.layout.binding_offset_for(slice));
        self.buffer.write_bytes(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_aligned_and_covers_data() {
        for alignment in [1_u64, 4, 16, 64, 256] {
            for raw in 1_u64..=300 {
                let stride = compute_slice_stride(raw, alignment);
                assert_eq!(stride % alignment, 0, "raw {raw} align {alignment}");
                assert!(stride >= raw);
                assert!(stride < raw + alignment);
            }
        }
    }

    #[test]
    fn stride_examples() {
        assert_eq!(compute_slice_stride(64, 256), 256);
        assert_eq!(compute_slice_stride(256, 256), 256);
        assert_eq!(compute_slice_stride(257, 256), 512);
        assert_eq!(compute_slice_stride(64, 0), 64);
    }

    #[test]
    fn binding_offsets_step_by_stride() {
        let layout = SliceLayout::new(3, 64, 256).unwrap();
        assert_eq!(layout.stride(), 256);
        assert_eq!(layout.total_size(), 768);
        assert_eq!(layout.binding_offset_for(0), 0);
        assert_eq!(layout.binding_offset_for(1), 256);
        assert_eq!(layout.binding_offset_for(2), 512);
    }

    #[test]
    fn empty_layouts_rejected() {
        assert!(SliceLayout::new(0, 64, 256).is_err());
        assert!(SliceLayout::new(2, 0, 256).is_err());
    }

    #[test]
    fn writes_stay_inside_their_slice() {
        let layout = SliceLayout::new(4, 64, 256).unwrap();
        let mut bytes = vec![0_u8; layout.total_size() as usize];

        for slice in 0..4_u32 {
            let pattern = vec![0xA0 | slice as u8; 64];
            layout.write_into(&mut bytes, slice, &pattern).unwrap();
        }

        // Rewrite slice 2 and make sure its neighbours are untouched.
        layout.write_into(&mut bytes, 2, &[0xFF; 64]).unwrap();

        for slice in 0..4_u32 {
            let range = layout.slice_range(slice);
            let expected = if slice == 2 { 0xFF } else { 0xA0 | slice as u8 };
            assert!(bytes[range.start..range.start + 64]
                .iter()
                .all(|&b| b == expected));
            // Padding is never written.
            assert!(bytes[range.start + 64..range.end].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn out_of_range_writes_rejected() {
        let layout = SliceLayout::new(2, 16, 64).unwrap();
        let mut bytes = vec![0_u8; layout.total_size() as usize];
        assert!(layout.write_into(&mut bytes, 2, &[0; 16]).is_err());
        assert!(layout.write_into(&mut bytes, 0, &[0; 17]).is_err());
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
