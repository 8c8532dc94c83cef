//! Moving CPU data into GPU buffers and images.
//!
//! Texture uploads are synchronous: the staging copy is submitted and waited
//! on before returning, so the result is ready for sampling with no further
//! synchronization. This is a startup path only.

use crate::command::{execute_one_shot, CommandPool};
use crate::context::{DeviceContext, LogicalDevice};
use crate::error::{GpuError, Result, VkResultExt};
use crate::memory::{GpuBuffer, GpuImage, MemoryUsage};
use crate::swapchain::color_subresource_range;
use ash::vk;
use std::sync::Arc;

/// Bytes per texel for the formats the uploader accepts.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R8_UNORM => Some(1),
        _ => None,
    }
}

/// A sampled, immutable texture.
pub struct Texture {
    sampler: vk::Sampler,
    view: vk::ImageView,
    // Released by its own Drop after the view.
    _image: GpuImage,
    device: Arc<LogicalDevice>,
}

impl Texture {
    /// Image view for descriptor writes.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Sampler for descriptor writes.
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // SAFETY: owners drop textures only after the device is idle.
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_image_view(self.view, None);
        }
    }
}

/// Creates buffers and textures on behalf of the application.
pub struct ResourceUploader<'a> {
    context: &'a DeviceContext,
    pool: CommandPool,
}

impl<'a> ResourceUploader<'a> {
    /// Create an uploader with its own transient command pool on the
    /// graphics queue family.
    pub fn new(context: &'a DeviceContext) -> Result<Self> {
        let pool = CommandPool::new(
            context.shared_device(),
            context.queue_families().graphics,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        Ok(Self { context, pool })
    }

    /// Allocate a host-visible buffer and optionally fill it.
    ///
    /// The fill flushes when the chosen memory type is not host-coherent.
    pub fn create_host_visible_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        data: Option<&[u8]>,
        name: &str,
    ) -> Result<GpuBuffer> {
        if let Some(bytes) = data {
            if bytes.len() as u64 > size {
                return Err(GpuError::InvalidState(format!(
                    "{} bytes of data for a {}-byte buffer",
                    bytes.len(),
                    size
                )));
            }
        }

        let mut buffer = GpuBuffer::new(
            self.context.allocator(),
            size,
            usage,
            MemoryUsage::HostVisible,
            name,
        )?;

        if let Some(bytes) = data {
            buffer.write_bytes(0, bytes)?;
        }

        Ok(buffer)
    }

    /// Upload `pixels` into a new device-local texture.
    ///
    /// The image moves UNDEFINED -> TRANSFER_DST -> SHADER_READ_ONLY, and the
    /// call blocks on a fence until the copy has completed.
    #[tracing::instrument(level = "debug", skip(self, pixels))]
    pub fn upload_image(
        &self,
        width: u32,
        height: u32,
        pixels: &[u8],
        format: vk::Format,
    ) -> Result<Texture> {
        let texel = texel_size(format)
            .ok_or_else(|| GpuError::InvalidState(format!("Unsupported texture format {format:?}")))?;
        let expected = u64::from(width) * u64::from(height) * texel;
        if width == 0 || height == 0 || pixels.len() as u64 != expected {
            return Err(GpuError::InvalidState(format!(
                "{}x{} {:?} texture needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                pixels.len()
            )));
        }

        let extent = vk::Extent3D {
            width,
            height,
            depth: 1,
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = GpuImage::new(self.context.allocator(), &image_info, "texture")?;

        let staging = self.create_host_visible_buffer(
            expected,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Some(pixels),
            "texture staging",
        )?;

        execute_one_shot(
            self.context.shared_device(),
            &self.pool,
            self.context.graphics_queue(),
            |device, cmd| {
                // SAFETY: cmd is recording; image and staging stay alive until
                // the one-shot submission has been waited on.
                unsafe { record_texture_copy(device, cmd, staging.raw(), image.raw(), extent) };
            },
        )?;

        drop(staging);

        let device = self.context.shared_device().clone();

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.raw())
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());
        // SAFETY: the image is fully initialized and owned by this function.
        let view = unsafe { device.create_image_view(&view_info, None) }.op("vkCreateImageView")?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_anisotropy(1.0)
            .compare_op(vk::CompareOp::ALWAYS)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        // SAFETY: the device is valid while the Arc is held.
        let sampler = match unsafe { device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(result) => {
                // SAFETY: the view was just created and never used.
                unsafe { device.destroy_image_view(view, None) };
                return Err(GpuError::VulkanCall {
                    op: "vkCreateSampler",
                    result,
                });
            }
        };

        tracing::debug!("Uploaded {}x{} {:?} texture", width, height, format);

        Ok(Texture {
            sampler,
            view,
            _image: image,
            device,
        })
    }
}

/// Record the layout transitions and buffer-to-image copy for a texture.
///
/// # Safety
/// `cmd` must be recording and both resources must outlive its execution.
unsafe fn record_texture_copy(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    staging: vk::Buffer,
    image: vk::Image,
    extent: vk::Extent3D,
) {
    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range());

    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_transfer],
    );

    let region = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_offset(vk::Offset3D::default())
        .image_extent(extent);

    device.cmd_copy_buffer_to_image(
        cmd,
        staging,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
    );

    let to_shader_read = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range());

    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_shader_read],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::B8G8R8A8_SRGB), Some(4));
        assert_eq!(texel_size(vk::Format::R8_UNORM), Some(1));
        assert_eq!(texel_size(vk::Format::D32_SFLOAT), None);
    }
}
