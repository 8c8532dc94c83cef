//! Render pass and swapchain framebuffers.

use crate::context::LogicalDevice;
use crate::error::{Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

/// Single-subpass color render pass that clears and ends ready to present.
pub struct RenderPass {
    raw: vk::RenderPass,
    device: Arc<LogicalDevice>,
}

impl RenderPass {
    /// Create a render pass for one color attachment of `format`.
    pub fn new(device: &Arc<LogicalDevice>, format: vk::Format) -> Result<Self> {
        let attachments = [vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        // The layout transition must wait for the acquire semaphore, which the
        // submission waits on at COLOR_ATTACHMENT_OUTPUT.
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        // SAFETY: create_info only borrows locals that outlive the call.
        let raw = unsafe { device.create_render_pass(&create_info, None) }
            .op("vkCreateRenderPass")?;

        Ok(Self {
            raw,
            device: device.clone(),
        })
    }

    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        // SAFETY: framebuffers and pipelines using the pass are dropped first.
        unsafe { self.device.destroy_render_pass(self.raw, None) };
    }
}

/// One framebuffer per swapchain image view.
pub struct Framebuffers {
    raw: Vec<vk::Framebuffer>,
    device: Arc<LogicalDevice>,
}

impl Framebuffers {
    /// Create framebuffers wrapping `views` for `render_pass`.
    pub fn new(
        device: &Arc<LogicalDevice>,
        render_pass: &RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut framebuffers = Self {
            raw: Vec::with_capacity(views.len()),
            device: device.clone(),
        };

        for view in views {
            let attachments = [*view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass.raw())
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            // SAFETY: the view matches the render pass attachment format.
            let framebuffer = unsafe { device.create_framebuffer(&create_info, None) }
                .op("vkCreateFramebuffer")?;
            framebuffers.raw.push(framebuffer);
        }

        Ok(framebuffers)
    }

    /// Framebuffer for swapchain image `index`.
    pub fn get(&self, index: usize) -> Option<vk::Framebuffer> {
        self.raw.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        for &framebuffer in &self.raw {
            // SAFETY: owners drop framebuffers only after the device is idle.
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}
