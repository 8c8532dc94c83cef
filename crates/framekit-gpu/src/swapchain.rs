//! Swapchain management.

use crate::context::{DeviceContext, LogicalDevice, QueueFamilies};
use crate::error::{GpuError, Result, VkResultExt};
use crate::surface::Surface;
use ash::vk;
use std::sync::Arc;

/// Format substituted when the driver reports no preference.
pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Requested swapchain parameters.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub width: u32,
    pub height: u32,
    pub present_mode: vk::PresentModeKHR,
}

/// Result of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquiredImage {
    /// An image was acquired; `suboptimal` means it still presents correctly.
    Ready { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and nothing was acquired.
    OutOfDate,
}

/// Result of a present request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// Swapchain with one color view per image.
///
/// Views are destroyed before the swapchain, and the swapchain before the
/// surface and device it holds.
pub struct Swapchain {
    image_views: Vec<vk::ImageView>,
    images: Vec<vk::Image>,
    raw: vk::SwapchainKHR,
    loader: ash::khr::swapchain::Device,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    _surface: Arc<Surface>,
    device: Arc<LogicalDevice>,
}

impl Swapchain {
    /// Create a swapchain for `surface`.
    ///
    /// May be called again with `old` to replace an existing swapchain.
    pub fn new(
        context: &DeviceContext,
        surface: &Arc<Surface>,
        config: SwapchainConfig,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let support = surface.support(context.physical_device())?;
        let caps = &support.capabilities;

        let format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(config.present_mode, &support.present_modes);
        let extent = resolve_extent(caps, config.width, config.height);
        let image_count = choose_image_count(caps);
        let (sharing_mode, family_indices) = sharing_for(context.queue_families());

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(choose_pre_transform(caps))
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.raw));

        let device = context.shared_device().clone();
        let loader = ash::khr::swapchain::Device::new(context.instance().raw(), &device);

        // SAFETY: create_info references locals that outlive the call.
        let raw = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(format!("vkCreateSwapchainKHR: {e:?}")))?;

        let mut swapchain = Self {
            image_views: Vec::new(),
            images: Vec::new(),
            raw,
            loader,
            format,
            present_mode,
            extent,
            _surface: surface.clone(),
            device,
        };

        // SAFETY: raw was just created by this loader.
        swapchain.images = unsafe { swapchain.loader.get_swapchain_images(raw) }
            .op("vkGetSwapchainImagesKHR")?;

        for &image in &swapchain.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_subresource_range());

            // SAFETY: image belongs to this swapchain; views pushed here are
            // destroyed by Drop even if a later view fails.
            let view = unsafe { swapchain.device.create_image_view(&view_info, None) }
                .op("vkCreateImageView")?;
            swapchain.image_views.push(view);
        }

        tracing::info!(
            "Swapchain: {:?}/{:?}, {:?}, {}x{}, {} images ({:?})",
            format.format,
            format.color_space,
            present_mode,
            extent.width,
            extent.height,
            swapchain.images.len(),
            sharing_mode,
        );

        Ok(swapchain)
    }

    /// Raw swapchain handle.
    pub fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// One color view per image.
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Chosen surface format.
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Present mode in effect after fallback.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Acquire the next image, signalling `semaphore` when it is ready.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquiredImage> {
        // SAFETY: semaphore is unsignalled with no pending operations; the
        // frame loop guarantees this through the slot fence.
        let result = unsafe {
            self.loader
                .acquire_next_image(self.raw, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquiredImage::OutOfDate),
            Err(e) => Err(GpuError::VulkanCall {
                op: "vkAcquireNextImageKHR",
                result: e,
            }),
        }
    }

    /// Queue `image_index` for presentation after `wait_semaphore` signals.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentStatus> {
        let swapchains = [self.raw];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: image_index was acquired from this swapchain.
        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(GpuError::VulkanCall {
                op: "vkQueuePresentKHR",
                result: e,
            }),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // SAFETY: the owner waits for the device to go idle before dropping.
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.raw, None);
        }
    }
}

/// Full single-mip, single-layer color range.
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// Pick the surface format.
///
/// A single `UNDEFINED` entry means the surface has no preference, so a
/// fixed BGRA8 default is substituted. Otherwise the first reported format
/// is taken as is.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    match formats {
        [] => Err(GpuError::SwapchainCreation(
            "surface reports no formats".to_string(),
        )),
        [only] if only.format == vk::Format::UNDEFINED => {
            tracing::debug!("Surface has no preferred format, using {:?}", DEFAULT_SURFACE_FORMAT);
            Ok(DEFAULT_SURFACE_FORMAT)
        }
        [first, ..] => Ok(*first),
    }
}

/// Return `requested` when supported, otherwise FIFO.
pub fn choose_present_mode(
    requested: vk::PresentModeKHR,
    supported: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if supported.contains(&requested) {
        requested
    } else {
        tracing::info!("Present mode {:?} unsupported, falling back to FIFO", requested);
        vk::PresentModeKHR::FIFO
    }
}

fn clamp_dimension(requested: u32, min: u32, max: u32) -> u32 {
    if requested < min {
        min
    } else if requested > max {
        max
    } else {
        requested
    }
}

/// Resolve the swapchain extent.
///
/// When the surface reports the `u32::MAX` sentinel the window size decides,
/// clamped to the surface bounds; otherwise the surface's current extent is
/// authoritative. A zero dimension falls back to the requested size.
pub fn resolve_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested_width: u32,
    requested_height: u32,
) -> vk::Extent2D {
    let current = capabilities.current_extent;
    let resolved = if current.width == u32::MAX {
        vk::Extent2D {
            width: clamp_dimension(
                requested_width,
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: clamp_dimension(
                requested_height,
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        current
    };

    if resolved.width == 0 || resolved.height == 0 {
        tracing::debug!(
            "Surface extent {}x{} is empty, using requested size",
            resolved.width,
            resolved.height
        );
        vk::Extent2D {
            width: requested_width,
            height: requested_height,
        }
    } else {
        resolved
    }
}

/// At least two images, never more than the surface allows.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count.max(2);
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

/// Sharing mode and family list for images used by both queues.
pub fn sharing_for(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_unified() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.present],
        )
    }
}

/// Identity when supported, otherwise whatever the surface currently applies.
pub fn choose_pre_transform(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if capabilities
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let fifo_only = [vk::PresentModeKHR::FIFO];
        for requested in [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO_RELAXED,
        ] {
            assert_eq!(
                choose_present_mode(requested, &fifo_only),
                vk::PresentModeKHR::FIFO
            );
        }
    }

    #[test]
    fn present_mode_exact_match_preferred() {
        let supported = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::FIFO, &supported),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::MAILBOX, &supported),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn undefined_extent_is_clamped() {
        let c = caps((u32::MAX, u32::MAX), (100, 100), (1920, 1080));
        assert_eq!(
            resolve_extent(&c, 4000, 50),
            vk::Extent2D {
                width: 1920,
                height: 100
            }
        );
        assert_eq!(
            resolve_extent(&c, 800, 600),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn concrete_extent_wins_over_request() {
        let c = caps((1280, 720), (1, 1), (4096, 4096));
        assert_eq!(
            resolve_extent(&c, 10, 10),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn zero_extent_falls_back_to_request() {
        let c = caps((0, 0), (0, 0), (0, 0));
        assert_eq!(
            resolve_extent(&c, 640, 480),
            vk::Extent2D {
                width: 640,
                height: 480
            }
        );
    }

    #[test]
    fn unified_families_share_exclusively() {
        let (mode, indices) = sharing_for(QueueFamilies {
            graphics: 0,
            present: 0,
        });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());
    }

    #[test]
    fn split_families_share_concurrently() {
        let (mode, indices) = sharing_for(QueueFamilies {
            graphics: 0,
            present: 2,
        });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn image_count_respects_bounds() {
        let mut c = vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&c), 2);

        c.min_image_count = 3;
        assert_eq!(choose_image_count(&c), 3);

        c.min_image_count = 1;
        c.max_image_count = 1;
        assert_eq!(choose_image_count(&c), 1);
    }

    #[test]
    fn undefined_format_uses_default() {
        let undefined = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            choose_surface_format(&undefined).unwrap(),
            DEFAULT_SURFACE_FORMAT
        );

        let reported = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            DEFAULT_SURFACE_FORMAT,
        ];
        assert_eq!(choose_surface_format(&reported).unwrap(), reported[0]);
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn identity_transform_preferred() {
        let mut c = vk::SurfaceCapabilitiesKHR {
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY
                | vk::SurfaceTransformFlagsKHR::ROTATE_90,
            current_transform: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            ..Default::default()
        };
        assert_eq!(
            choose_pre_transform(&c),
            vk::SurfaceTransformFlagsKHR::IDENTITY
        );

        c.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(
            choose_pre_transform(&c),
            vk::SurfaceTransformFlagsKHR::ROTATE_90
        );
    }
}
