//! GPU memory management.
//!
//! Memory types are chosen by [`memory_type_index`]; gpu-allocator only
//! sub-allocates inside the chosen type. Buffers and images free their
//! allocation and destroy their handle on drop.

use crate::context::LogicalDevice;
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::Instance;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// Index of the first memory type allowed by `type_bits` whose property
/// flags contain all of `required`.
pub fn memory_type_index(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties
        .memory_types
        .iter()
        .take(properties.memory_type_count as usize)
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(index, _)| index as u32)
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Memory range to flush after writing `len` bytes at `write_offset` into an
/// allocation that starts at `allocation_offset` inside its device memory.
///
/// The range is widened to `atom` boundaries and clamped to the allocation.
/// Returns `(offset, size)` relative to the device memory object.
pub fn flush_range(
    allocation_offset: u64,
    allocation_size: u64,
    write_offset: u64,
    len: u64,
    atom: u64,
) -> (u64, u64) {
    let atom = atom.max(1);
    let start = align_down(write_offset, atom);
    let end = align_up(write_offset + len, atom).min(allocation_size);
    (allocation_offset + start, end.saturating_sub(start))
}

/// Validate a host write of `len` bytes at `offset` into a buffer of `size`
/// bytes allocated for `usage`. Returns the end of the written range.
///
/// Device-local buffers are filled by transfers only, even when the chosen
/// memory type happens to be host-visible as well.
fn check_host_write(usage: MemoryUsage, size: u64, offset: u64, len: usize) -> Result<u64> {
    if usage == MemoryUsage::DeviceLocal {
        return Err(GpuError::InvalidState(
            "Device-local buffers are written through transfers only".to_string(),
        ));
    }
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidState(format!(
            "Write of {len} bytes at {offset} exceeds buffer size {size}"
        )));
    }
    Ok(end)
}

/// Where a resource's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Host-visible and persistently mapped. Coherent memory is preferred;
    /// non-coherent memory is accepted and flushed after writes.
    HostVisible,
    /// Device-local; populated only through transfer commands.
    DeviceLocal,
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: u64,
    device: Arc<LogicalDevice>,
}

impl GpuAllocator {
    /// Create a new allocator.
    pub fn new(
        instance: &Instance,
        device: Arc<LogicalDevice>,
        physical_device: vk::PhysicalDevice,
        non_coherent_atom_size: u64,
    ) -> Result<Self> {
        // SAFETY: the physical device was enumerated from this instance.
        let memory_properties = unsafe {
            instance
                .raw()
                .get_physical_device_memory_properties(physical_device)
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw().clone(),
            device: (**device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            memory_properties,
            non_coherent_atom_size,
            device,
        })
    }

    /// The device this allocator serves.
    pub fn device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }

    /// Flush granularity for non-coherent memory.
    pub fn non_coherent_atom_size(&self) -> u64 {
        self.non_coherent_atom_size
    }

    /// Resolve the memory type for `usage`.
    ///
    /// Host-visible requests first try coherent memory, then retry with the
    /// coherence requirement relaxed.
    pub fn select_memory_type(&self, type_bits: u32, usage: MemoryUsage) -> Result<u32> {
        let lookup = |required: vk::MemoryPropertyFlags| {
            memory_type_index(&self.memory_properties, type_bits, required).ok_or(
                GpuError::NoCompatibleMemoryType {
                    type_bits,
                    required,
                },
            )
        };

        match usage {
            MemoryUsage::DeviceLocal => lookup(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryUsage::HostVisible => {
                match lookup(
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                ) {
                    Err(e) if e.is_recoverable() => {
                        tracing::debug!("{e}; retrying without HOST_COHERENT");
                        lookup(vk::MemoryPropertyFlags::HOST_VISIBLE)
                    }
                    other => other,
                }
            }
        }
    }

    /// Allocate memory for a resource with the given requirements.
    pub fn allocate(
        &mut self,
        mut requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
        name: &str,
    ) -> Result<Allocation> {
        let type_index = self.select_memory_type(requirements.memory_type_bits, usage)?;
        let flags = self.memory_properties.memory_types[type_index as usize].property_flags;

        // Pin gpu-allocator to the chosen type.
        requirements.memory_type_bits = 1 << type_index;

        // Flushes operate on whole atoms, so keep non-coherent allocations
        // atom-aligned and atom-sized.
        if !flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
            && flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            let atom = self.non_coherent_atom_size.max(1);
            requirements.alignment = requirements.alignment.max(atom);
            requirements.size = align_up(requirements.size, atom);
        }

        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::Unknown,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Return an allocation.
    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// Remaining allocations are released and logged as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    allocation: Option<Allocation>,
    raw: vk::Buffer,
    size: u64,
    usage: MemoryUsage,
    memory_flags: vk::MemoryPropertyFlags,
    non_coherent_atom_size: u64,
    allocator: Arc<Mutex<GpuAllocator>>,
    device: Arc<LogicalDevice>,
}

impl GpuBuffer {
    /// Create a buffer and bind freshly allocated memory to it.
    pub fn new(
        allocator: &Arc<Mutex<GpuAllocator>>,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<Self> {
        let mut guard = allocator.lock();
        let device = guard.device().clone();
        let non_coherent_atom_size = guard.non_coherent_atom_size();

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device is valid while the Arc is held.
        let raw = unsafe { device.create_buffer(&buffer_info, None) }.op("vkCreateBuffer")?;
        // SAFETY: raw was just created on this device.
        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };

        let allocation = match guard.allocate(requirements, memory, true, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: raw has no memory bound and was never used.
                unsafe { device.destroy_buffer(raw, None) };
                return Err(e);
            }
        };
        drop(guard);

        let buffer = Self {
            memory_flags: allocation.memory_properties(),
            allocation: Some(allocation),
            raw,
            size,
            usage: memory,
            non_coherent_atom_size,
            allocator: allocator.clone(),
            device,
        };

        if let Some(allocation) = &buffer.allocation {
            // SAFETY: the allocation satisfies the buffer's requirements.
            unsafe {
                buffer
                    .device
                    .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
            }
            .op("vkBindBufferMemory")?;
        }

        tracing::trace!(
            "Buffer '{}': {} bytes, {:?}",
            name,
            size,
            buffer.memory_flags
        );

        Ok(buffer)
    }

    /// Raw buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether host writes become visible without an explicit flush.
    pub fn is_host_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Copy `data` into the persistently mapped memory at `offset`.
    ///
    /// Non-coherent memory is flushed over exactly the written range, rounded
    /// to whole atoms. Buffers created as [`MemoryUsage::DeviceLocal`]
    /// reject host writes.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = check_host_write(self.usage, self.size, offset, data.len())?;

        let allocation = self
            .allocation
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer has no memory".to_string()))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer is not host-visible".to_string()))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);

        if !self.is_host_coherent() {
            self.flush(offset, data.len() as u64)?;
        }

        Ok(())
    }

    fn flush(&self, offset: u64, len: u64) -> Result<()> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Buffer has no memory".to_string()))?;

        let (flush_offset, flush_size) = flush_range(
            allocation.offset(),
            allocation.size(),
            offset,
            len,
            self.non_coherent_atom_size,
        );

        // SAFETY: the range lies inside this buffer's mapped allocation.
        unsafe {
            let range = vk::MappedMemoryRange::default()
                .memory(allocation.memory())
                .offset(flush_offset)
                .size(flush_size);
            self.device.flush_mapped_memory_ranges(&[range])
        }
        .op("vkFlushMappedMemoryRanges")
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                tracing::error!("Failed to free buffer memory: {e}");
            }
        }
        // SAFETY: owners drop buffers only after the GPU stopped using them.
        unsafe { self.device.destroy_buffer(self.raw, None) };
    }
}

/// A device-local GPU image with its allocation.
pub struct GpuImage {
    allocation: Option<Allocation>,
    raw: vk::Image,
    allocator: Arc<Mutex<GpuAllocator>>,
    device: Arc<LogicalDevice>,
}

impl GpuImage {
    /// Create an image backed by device-local memory.
    pub fn new(
        allocator: &Arc<Mutex<GpuAllocator>>,
        create_info: &vk::ImageCreateInfo,
        name: &str,
    ) -> Result<Self> {
        let mut guard = allocator.lock();
        let device = guard.device().clone();

        // SAFETY: the device is valid while the Arc is held.
        let raw = unsafe { device.create_image(create_info, None) }.op("vkCreateImage")?;
        // SAFETY: raw was just created on this device.
        let requirements = unsafe { device.get_image_memory_requirements(raw) };

        let linear = create_info.tiling == vk::ImageTiling::LINEAR;
        let allocation = match guard.allocate(requirements, MemoryUsage::DeviceLocal, linear, name)
        {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: raw has no memory bound and was never used.
                unsafe { device.destroy_image(raw, None) };
                return Err(e);
            }
        };
        drop(guard);

        let image = Self {
            allocation: Some(allocation),
            raw,
            allocator: allocator.clone(),
            device,
        };

        if let Some(allocation) = &image.allocation {
            // SAFETY: the allocation satisfies the image's requirements.
            unsafe {
                image
                    .device
                    .bind_image_memory(raw, allocation.memory(), allocation.offset())
            }
            .op("vkBindImageMemory")?;
        }

        Ok(image)
    }

    /// Raw image handle.
    pub fn raw(&self) -> vk::Image {
        self.raw
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                tracing::error!("Failed to free image memory: {e}");
            }
        }
        // SAFETY: owners drop images only after the GPU stopped using them.
        unsafe { self.device.destroy_image(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, &f) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = f;
        }
        props
    }

    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    #[test]
    fn first_matching_type_wins() {
        let props = properties(&[
            DEVICE_LOCAL,
            HOST_VISIBLE | HOST_COHERENT,
            HOST_VISIBLE | HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(
            memory_type_index(&props, 0b111, HOST_VISIBLE | HOST_COHERENT),
            Some(1)
        );
        assert_eq!(memory_type_index(&props, 0b111, DEVICE_LOCAL), Some(0));
    }

    #[test]
    fn type_bits_filter_candidates() {
        let props = properties(&[HOST_VISIBLE, HOST_VISIBLE | HOST_COHERENT]);
        assert_eq!(memory_type_index(&props, 0b01, HOST_VISIBLE), Some(0));
        assert_eq!(memory_type_index(&props, 0b10, HOST_VISIBLE), Some(1));
        assert_eq!(
            memory_type_index(&props, 0b01, HOST_VISIBLE | HOST_COHERENT),
            None
        );
    }

    #[test]
    fn types_beyond_count_are_ignored() {
        let mut props = properties(&[DEVICE_LOCAL]);
        props.memory_types[1].property_flags = HOST_VISIBLE;
        assert_eq!(memory_type_index(&props, u32::MAX, HOST_VISIBLE), None);
    }

    #[test]
    fn device_local_buffers_reject_host_writes() {
        let err = check_host_write(MemoryUsage::DeviceLocal, 64, 0, 16).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert_eq!(check_host_write(MemoryUsage::HostVisible, 64, 0, 16).unwrap(), 16);
    }

    #[test]
    fn host_writes_stay_inside_the_buffer() {
        assert_eq!(check_host_write(MemoryUsage::HostVisible, 64, 48, 16).unwrap(), 64);
        assert!(check_host_write(MemoryUsage::HostVisible, 64, 49, 16).is_err());
        assert!(check_host_write(MemoryUsage::HostVisible, 64, u64::MAX, 1).is_err());
    }

    #[test]
    fn flush_range_rounds_to_atoms() {
        // 10 bytes at offset 70 in an allocation at 256, atom 64.
        assert_eq!(flush_range(256, 512, 70, 10, 64), (256 + 64, 64));
        // Straddling an atom boundary covers both atoms.
        assert_eq!(flush_range(0, 512, 60, 10, 64), (0, 128));
    }

    #[test]
    fn flush_range_clamped_to_allocation() {
        assert_eq!(flush_range(1024, 192, 150, 40, 128), (1024 + 128, 64));
    }

    #[test]
    fn flush_range_with_unit_atom_is_exact() {
        assert_eq!(flush_range(8, 100, 3, 5, 1), (11, 5));
        assert_eq!(flush_range(8, 100, 3, 5, 0), (11, 5));
    }
}
