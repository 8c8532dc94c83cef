//! Descriptor set layouts, pools, and updates.

use crate::context::LogicalDevice;
use crate::error::{Result, VkResultExt};
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collects single-descriptor bindings for one set layout.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<(u32, vk::DescriptorType, vk::ShaderStageFlags)>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uniform buffer whose slice is chosen by a dynamic offset at bind time.
    pub fn uniform_buffer_dynamic(mut self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.bindings
            .push((binding, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, stages));
        self
    }

    /// Combined image sampler.
    pub fn sampled_image(mut self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.bindings
            .push((binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages));
        self
    }

    pub fn build(self, device: &Arc<LogicalDevice>) -> Result<DescriptorSetLayout> {
        let bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|&(binding, ty, stages)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        // SAFETY: the bindings outlive the call.
        let raw = unsafe { device.create_descriptor_set_layout(&info, None) }
            .op("vkCreateDescriptorSetLayout")?;
        Ok(DescriptorSetLayout {
            raw,
            types: self.bindings.iter().map(|&(_, ty, _)| ty).collect(),
            device: device.clone(),
        })
    }
}

/// Owned descriptor set layout.
pub struct DescriptorSetLayout {
    raw: vk::DescriptorSetLayout,
    types: Vec<vk::DescriptorType>,
    device: Arc<LogicalDevice>,
}

impl DescriptorSetLayout {
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        // SAFETY: pipeline layouts copy what they need at creation.
        unsafe { self.device.destroy_descriptor_set_layout(self.raw, None) };
    }
}

/// Pool sizes covering one descriptor of each listed type.
fn pool_sizes<'a>(
    types: impl IntoIterator<Item = &'a vk::DescriptorType>,
) -> Vec<vk::DescriptorPoolSize> {
    let mut counts = BTreeMap::<i32, u32>::new();
    for ty in types {
        *counts.entry(ty.as_raw()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

/// Fixed-size descriptor pool. Sets live as long as the pool.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Arc<LogicalDevice>,
}

impl DescriptorPool {
    /// Create a pool sized for exactly one set per layout and allocate them,
    /// in the order given.
    pub fn for_layouts(
        device: &Arc<LogicalDevice>,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<(Self, Vec<vk::DescriptorSet>)> {
        let sizes = pool_sizes(layouts.iter().flat_map(|layout| &layout.types));
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(layouts.len() as u32)
            .pool_sizes(&sizes);

        // SAFETY: sizes outlives the call.
        let pool = unsafe { device.create_descriptor_pool(&info, None) }
            .op("vkCreateDescriptorPool")?;
        let pool = Self {
            pool,
            device: device.clone(),
        };

        let raw_layouts: Vec<_> = layouts.iter().map(|layout| layout.raw).collect();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool.pool)
            .set_layouts(&raw_layouts);
        // SAFETY: the pool was sized for these layouts.
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .op("vkAllocateDescriptorSets")?;
        Ok((pool, sets))
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        // SAFETY: owners drop the pool only after the device is idle.
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// A single descriptor update for [`update_descriptor_set`].
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    /// Dynamic uniform buffer. `range` is the size of one slice; the
    /// dynamic offset supplied at bind time picks the slice.
    UniformDynamic {
        binding: u32,
        buffer: vk::Buffer,
        range: u64,
    },
    /// Combined image sampler, sampled in shader-read layout.
    Sampler {
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
}

/// Apply `writes` to `set` in one `vkUpdateDescriptorSets` call.
///
/// # Safety
/// The set must not be in use by pending command buffers.
pub unsafe fn update_descriptor_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    writes: &[DescriptorWrite],
) {
    let buffers: Vec<_> = writes
        .iter()
        .map(|w| match *w {
            DescriptorWrite::UniformDynamic { buffer, range, .. } => {
                [vk::DescriptorBufferInfo::default().buffer(buffer).range(range)]
            }
            DescriptorWrite::Sampler { .. } => [vk::DescriptorBufferInfo::default()],
        })
        .collect();
    let images: Vec<_> = writes
        .iter()
        .map(|w| match *w {
            DescriptorWrite::Sampler { view, sampler, .. } => [vk::DescriptorImageInfo::default()
                .image_view(view)
                .sampler(sampler)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)],
            DescriptorWrite::UniformDynamic { .. } => [vk::DescriptorImageInfo::default()],
        })
        .collect();

    let vk_writes: Vec<_> = writes
        .iter()
        .zip(buffers.iter().zip(&images))
        .map(|(w, (buffer_info, image_info))| {
            let base = vk::WriteDescriptorSet::default().dst_set(set);
            match *w {
                DescriptorWrite::UniformDynamic { binding, .. } => base
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                    .buffer_info(buffer_info),
                DescriptorWrite::Sampler { binding, .. } => base
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(image_info),
            }
        })
        .collect();

    // SAFETY: the caller guarantees the set is idle; the infos outlive the call.
    unsafe { device.update_descriptor_sets(&vk_writes, &[]) };
}
