//! Graphics pipeline creation.

use crate::context::LogicalDevice;
use crate::error::{GpuError, Result, VkResultExt};
use crate::render_pass::RenderPass;
use ash::vk;
use std::sync::Arc;

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig<'a> {
    pub vertex_shader: &'a [u32],
    pub fragment_shader: &'a [u32],
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
}

impl GraphicsPipelineConfig<'_> {
    fn rasterization(&self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(self.polygon_mode)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .line_width(1.0)
    }
}

impl Default for GraphicsPipelineConfig<'_> {
    fn default() -> Self {
        Self {
            vertex_shader: &[],
            fragment_shader: &[],
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
        }
    }
}

/// Shader module destroyed when it goes out of scope.
struct ShaderModule<'a> {
    raw: vk::ShaderModule,
    device: &'a ash::Device,
}

impl<'a> ShaderModule<'a> {
    fn new(device: &'a ash::Device, code: &[u32], stage: &str) -> Result<Self> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: code is SPIR-V produced by the shader build step.
        let raw = unsafe { device.create_shader_module(&info, None) }
            .map_err(|e| GpuError::ShaderModule(format!("{stage}: {e:?}")))?;
        Ok(Self { raw, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        // SAFETY: pipelines keep no reference to the module after creation.
        unsafe { self.device.destroy_shader_module(self.raw, None) };
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    device: Arc<LogicalDevice>,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline for subpass 0 of `render_pass`.
    ///
    /// Viewport and scissor are dynamic state.
    pub fn new(
        device: &Arc<LogicalDevice>,
        render_pass: &RenderPass,
        config: &GraphicsPipelineConfig<'_>,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        let modules = [
            (
                vk::ShaderStageFlags::VERTEX,
                ShaderModule::new(device, config.vertex_shader, "vertex")?,
            ),
            (
                vk::ShaderStageFlags::FRAGMENT,
                ShaderModule::new(device, config.fragment_shader, "fragment")?,
            ),
        ];
        let shader_stages = modules.each_ref().map(|(stage, module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(*stage)
                .module(module.raw)
                .name(c"main")
        });

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(config.topology);
        let rasterization = config.rasterization();

        // One viewport and scissor, both set per frame.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let opaque = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default().attachments(&opaque);

        let layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(descriptor_set_layouts);

        // SAFETY: the set layouts are alive for the duration of the call.
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .op("vkCreatePipelineLayout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.raw())
            .subpass(0);

        // SAFETY: all state structs outlive the call.
        let created = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        let pipeline = match created {
            Ok(pipelines) if !pipelines.is_empty() => pipelines[0],
            failed => {
                // SAFETY: the layout is not referenced by any pipeline.
                unsafe { device.destroy_pipeline_layout(layout, None) };
                let reason = match failed {
                    Err((_, e)) => format!("{e:?}"),
                    Ok(_) => "driver returned no pipeline".to_string(),
                };
                return Err(GpuError::PipelineCreation(reason));
            }
        };

        Ok(Self {
            pipeline,
            layout,
            device: device.clone(),
        })
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        // SAFETY: owners drop the pipeline only after the device is idle.
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
