//! The hello sample: a textured triangle spinning on a cleared background.
//!
//! Owns every GPU object it creates. Fields are declared so that drop order
//! is the reverse of creation order, and the first field waits for the
//! device to go idle before anything else is released.

use std::sync::Arc;

use anyhow::{ensure, Context};
use ash::vk;
use framekit_gpu::{
    update_descriptor_set, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    DescriptorWrite, DeviceContext, DeviceContextBuilder, DynamicUniformStream, FrameLoop,
    FrameOutcome, FrameResourceSet, Framebuffers, GpuBuffer, GraphicsPipeline,
    GraphicsPipelineConfig, LogicalDevice, RenderPass, ResourceUploader, Surface, Swapchain,
    SwapchainConfig, Texture, VulkanFrameDevice,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{info, warn};

use crate::scene::{
    checkerboard, FrameUniforms, Spinner, Vertex, CLEAR_COLOR, TEXTURE_SIZE, TRIANGLE,
};

/// Parameters for [`HelloApi::initialize`].
#[derive(Debug, Clone)]
pub struct HelloConfig {
    pub app_name: String,
    pub width: u32,
    pub height: u32,
    pub present_mode: vk::PresentModeKHR,
    pub frames_in_flight: u32,
    pub validation: bool,
}

/// Waits for the device to finish all work when dropped.
struct IdleGuard(Arc<LogicalDevice>);

impl Drop for IdleGuard {
    fn drop(&mut self) {
        // SAFETY: the device is alive while the Arc is held.
        if let Err(e) = unsafe { self.0.device_wait_idle() } {
            tracing::error!("Failed to wait for device idle: {e:?}");
        }
    }
}

/// All state of the hello sample.
pub struct HelloApi {
    _idle: IdleGuard,
    frame_loop: FrameLoop,
    frames: FrameResourceSet,
    static_set: vk::DescriptorSet,
    dynamic_set: vk::DescriptorSet,
    _descriptor_pool: DescriptorPool,
    pipeline: GraphicsPipeline,
    _dynamic_layout: DescriptorSetLayout,
    _static_layout: DescriptorSetLayout,
    framebuffers: Framebuffers,
    render_pass: RenderPass,
    uniforms: DynamicUniformStream,
    _texture: Texture,
    vertex_buffer: GpuBuffer,
    spinner: Spinner,
    swapchain: Swapchain,
    _surface: Arc<Surface>,
    context: DeviceContext,
}

impl HelloApi {
    /// Create the device, swapchain, resources, pipeline, and frame slots.
    pub fn initialize<W>(window: &W, config: &HelloConfig) -> anyhow::Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        ensure!(config.frames_in_flight >= 1, "at least one frame in flight is required");

        let (context, surface) = DeviceContextBuilder::new()
            .app_name(&config.app_name)
            .validation(config.validation)
            .build(window)
            .context("Failed to create device context")?;

        let caps = context.capabilities();

        let swapchain = Swapchain::new(
            &context,
            &surface,
            SwapchainConfig {
                width: config.width,
                height: config.height,
                present_mode: config.present_mode,
            },
            None,
        )
        .context("Failed to create swapchain")?;
        if swapchain.present_mode() != config.present_mode {
            warn!(
                "Present mode {:?} unsupported, using {:?}",
                config.present_mode,
                swapchain.present_mode()
            );
        }

        let (vertex_buffer, texture) = {
            let uploader = ResourceUploader::new(&context)?;
            let vertex_bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
            let vertex_buffer = uploader
                .create_host_visible_buffer(
                    vertex_bytes.len() as u64,
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                    Some(vertex_bytes),
                    "triangle vertices",
                )
                .context("Failed to create vertex buffer")?;

            let pixels = checkerboard(TEXTURE_SIZE, TEXTURE_SIZE);
            let texture = uploader
                .upload_image(
                    TEXTURE_SIZE,
                    TEXTURE_SIZE,
                    &pixels,
                    vk::Format::R8G8B8A8_UNORM,
                )
                .context("Failed to upload texture")?;
            (vertex_buffer, texture)
        };

        let uniforms = DynamicUniformStream::allocate(
            context.allocator(),
            caps.min_uniform_buffer_offset_alignment,
            config.frames_in_flight,
            std::mem::size_of::<FrameUniforms>() as u64,
        )
        .context("Failed to allocate uniform stream")?;

        let device = context.shared_device().clone();

        let render_pass = RenderPass::new(&device, swapchain.format().format)?;
        let framebuffers = Framebuffers::new(
            &device,
            &render_pass,
            swapchain.image_views(),
            swapchain.extent(),
        )?;

        let static_layout = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
            .build(&device)?;
        let dynamic_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer_dynamic(0, vk::ShaderStageFlags::VERTEX)
            .build(&device)?;

        let pipeline = GraphicsPipeline::new(
            &device,
            &render_pass,
            &triangle_pipeline_config(),
            &[static_layout.raw(), dynamic_layout.raw()],
        )
        .context("Failed to create graphics pipeline")?;

        let (descriptor_pool, sets) =
            DescriptorPool::for_layouts(&device, &[&static_layout, &dynamic_layout])?;
        let (static_set, dynamic_set) = match sets.as_slice() {
            [s, d] => (*s, *d),
            _ => anyhow::bail!("expected two descriptor sets, got {}", sets.len()),
        };

        // SAFETY: the sets are freshly allocated and not used by any command buffer.
        unsafe {
            update_descriptor_set(
                &device,
                static_set,
                &[DescriptorWrite::Sampler {
                    binding: 0,
                    view: texture.view(),
                    sampler: texture.sampler(),
                }],
            );
            update_descriptor_set(
                &device,
                dynamic_set,
                &[DescriptorWrite::UniformDynamic {
                    binding: 0,
                    buffer: uniforms.buffer(),
                    range: uniforms.descriptor_range(),
                }],
            );
        }

        let frames = FrameResourceSet::new(
            &device,
            context.queue_families().graphics,
            config.frames_in_flight,
            swapchain.image_count() as u32,
        )?;
        let frame_loop = FrameLoop::for_resources(&frames)?;

        let extent = swapchain.extent();
        info!(
            "Hello sample ready: {} frames in flight over {} swapchain images",
            config.frames_in_flight,
            swapchain.image_count()
        );

        Ok(Self {
            _idle: IdleGuard(device),
            frame_loop,
            frames,
            static_set,
            dynamic_set,
            _descriptor_pool: descriptor_pool,
            pipeline,
            _dynamic_layout: dynamic_layout,
            _static_layout: static_layout,
            framebuffers,
            render_pass,
            uniforms,
            _texture: texture,
            vertex_buffer,
            spinner: Spinner::new(extent.width, extent.height),
            swapchain,
            _surface: surface,
            context,
        })
    }

    /// Record one command buffer per (swapchain image, frame slot) pair.
    ///
    /// Must be called once after [`initialize`](Self::initialize) and before
    /// the first [`step_frame`](Self::step_frame).
    pub fn record_frame_commands(&self) -> anyhow::Result<()> {
        let device = self.context.device();
        let extent = self.swapchain.extent();

        for image in 0..self.frames.image_count() {
            let framebuffer = self
                .framebuffers
                .get(image as usize)
                .context("missing framebuffer")?;

            for slot in 0..self.frames.slot_count() {
                let cmd = self
                    .frames
                    .command_buffer(image, slot)
                    .context("missing command buffer")?;

                self.record_draw(device, cmd, framebuffer, extent, slot)?;
            }
        }

        info!(
            "Recorded {} command buffers",
            self.frames.command_buffers().len()
        );
        Ok(())
    }

    /// Record the draw for one `(image, slot)` pair into `cmd`.
    fn record_draw(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        slot: u32,
    ) -> anyhow::Result<()> {
        // SAFETY: called only from record_frame_commands, before any
        // command buffer has been submitted.
        unsafe {
            framekit_gpu::command::begin_command_buffer(
                device,
                cmd,
                vk::CommandBufferUsageFlags::empty(),
            )?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            }];
            let render_area = vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            };
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.render_pass.raw())
                .framebuffer(framebuffer)
                .render_area(render_area)
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.raw());

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            // Slot j always reads uniform slice j.
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                0,
                &[self.static_set, self.dynamic_set],
                &[self.uniforms.binding_offset_for(slot)],
            );

            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.raw()], &[0]);
            device.cmd_draw(cmd, TRIANGLE.len() as u32, 1, 0, 0);
            device.cmd_end_render_pass(cmd);

            framekit_gpu::command::end_command_buffer(device, cmd)?;
        }
        Ok(())
    }

    /// Run one frame. The rotation advances only when the frame is presented.
    pub fn step_frame(&mut self) -> anyhow::Result<FrameOutcome> {
        let uniforms = self.spinner.upcoming();
        let mut device = VulkanFrameDevice::new(&self.context, &self.swapchain);
        let outcome = self
            .frame_loop
            .step(&mut device, &mut self.uniforms, bytemuck::bytes_of(&uniforms))?;
        self.spinner.settle(&outcome);
        Ok(outcome)
    }

    /// Frames queued for presentation so far.
    pub fn frames_presented(&self) -> u64 {
        self.frame_loop.frames_presented()
    }

    /// Wait for the GPU, then release everything in reverse creation order.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        {
            let mut device = VulkanFrameDevice::new(&self.context, &self.swapchain);
            self.frame_loop.shutdown(&mut device)?;
        }
        info!("Releasing GPU resources");
        drop(self);
        Ok(())
    }
}

fn triangle_pipeline_config() -> GraphicsPipelineConfig<'static> {
    GraphicsPipelineConfig {
        vertex_shader: framekit_shaders::triangle_vertex_shader(),
        fragment_shader: framekit_shaders::triangle_fragment_shader(),
        vertex_bindings: vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }],
        vertex_attributes: vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, uv) as u32,
            },
        ],
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::CLOCKWISE,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_vertex_layout_matches_vertex() {
        let config = triangle_pipeline_config();
        assert_eq!(config.vertex_bindings[0].stride, 24);
        assert_eq!(config.vertex_attributes[0].offset, 0);
        assert_eq!(config.vertex_attributes[1].offset, 16);
        assert_eq!(config.front_face, vk::FrontFace::CLOCKWISE);
        assert_eq!(config.cull_mode, vk::CullModeFlags::BACK);
    }
}
