/*! Keyed cache of shader modules and pipeline state objects, plus the
 * pipeline layout and graphics pipeline builders used to create them.
 * Registering or looking up an unknown name is a programming error and
 * surfaces as such.
 */

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use ash::vk;

use crate::{
    context::{DeviceShared, RenderContext},
    descriptor::DescriptorSetLayout,
};

pub const DEFAULT_VIEWPORT_MIN_DEPTH: f32 = 0.0;
pub const DEFAULT_VIEWPORT_MAX_DEPTH: f32 = 1.0;

/// A programmable pipeline stage backed by a SPIR-V module.
pub struct Shader {
    pub stage: vk::ShaderStageFlags,
    pub(crate) module: vk::ShaderModule,
}

impl Shader {
    /// Creates a shader from SPIR-V bytecode. File I/O happens outside the
    /// core; this only consumes opaque byte slices.
    pub fn from_spirv(ctx: &RenderContext, code: &[u8], stage: vk::ShaderStageFlags) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(code);
        let words = ash::util::read_spv(&mut cursor)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { ctx.shared.raw.create_shader_module(&create_info, None)? };

        Ok(Self { stage, module })
    }
}

/// A pipeline state object: a pipeline handle and the bind point it targets.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStateObject {
    pub bind_point: vk::PipelineBindPoint,
    pub pipeline: vk::Pipeline,
}

/// Fluent builder for pipeline layouts. Push constants are packed back to
/// back with a running offset.
pub struct PipelineLayoutBuilder {
    push_constant_offset: u32,
    push_constants: Vec<vk::PushConstantRange>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
}

impl PipelineLayoutBuilder {
    pub fn new() -> Self {
        Self {
            push_constant_offset: 0,
            push_constants: Vec::new(),
            set_layouts: Vec::new(),
        }
    }

    pub fn add_push_constant(mut self, size: usize, stage_flags: vk::ShaderStageFlags) -> Self {
        self.push_constants.push(
            vk::PushConstantRange::default()
                .offset(self.push_constant_offset)
                .size(size as u32)
                .stage_flags(stage_flags),
        );
        self.push_constant_offset += size as u32;
        self
    }

    pub fn add_descriptor_set_layout(mut self, layout: &DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout.raw);
        self
    }

    pub fn build(self, ctx: &RenderContext) -> Result<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constants);

        let layout = unsafe { ctx.shared.raw.create_pipeline_layout(&create_info, None)? };
        Ok(layout)
    }
}

impl Default for PipelineLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Value builder enumerating the fixed-function state of a graphics
/// pipeline. Each method returns the updated builder value.
#[derive(Clone)]
pub struct GraphicsPipelineBuilder {
    pub vertex_input_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_input_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub input_assembly_state: vk::PipelineInputAssemblyStateCreateInfo<'static>,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub rasterization_state: vk::PipelineRasterizationStateCreateInfo<'static>,
    pub multisample_state: vk::PipelineMultisampleStateCreateInfo<'static>,
    pub depth_stencil_state: vk::PipelineDepthStencilStateCreateInfo<'static>,
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl GraphicsPipelineBuilder {
    pub fn new(layout: vk::PipelineLayout, render_pass: vk::RenderPass) -> Self {
        Self {
            vertex_input_bindings: Vec::new(),
            vertex_input_attributes: Vec::new(),
            input_assembly_state: Self::input_assembly_state(
                vk::PrimitiveTopology::TRIANGLE_LIST,
                false,
            ),
            viewport: Self::default_viewport(0.0, 0.0),
            scissor: Self::default_scissor(0, 0),
            rasterization_state: Self::rasterization_state(
                false,
                vk::PolygonMode::FILL,
                vk::CullModeFlags::NONE,
                vk::FrontFace::COUNTER_CLOCKWISE,
            ),
            multisample_state: Self::multisample_state(vk::SampleCountFlags::TYPE_1),
            depth_stencil_state: Self::depth_stencil_state(false, false, vk::CompareOp::LESS),
            color_blend_attachments: Vec::new(),
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            layout,
            render_pass,
            subpass: 0,
        }
    }

    pub fn vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_input_bindings = bindings;
        self.vertex_input_attributes = attributes;
        self
    }

    pub fn viewport_scissor_extent(mut self, extent: vk::Extent2D) -> Self {
        self.viewport = Self::default_viewport(extent.width as f32, extent.height as f32);
        self.scissor = Self::default_scissor(extent.width, extent.height);
        self
    }

    pub fn rasterization(mut self, state: vk::PipelineRasterizationStateCreateInfo<'static>) -> Self {
        self.rasterization_state = state;
        self
    }

    pub fn depth_stencil(mut self, state: vk::PipelineDepthStencilStateCreateInfo<'static>) -> Self {
        self.depth_stencil_state = state;
        self
    }

    pub fn color_blend_attachments(
        mut self,
        attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    ) -> Self {
        self.color_blend_attachments = attachments;
        self
    }

    pub fn subpass(mut self, subpass: u32) -> Self {
        self.subpass = subpass;
        self
    }

    pub fn input_assembly_state(
        topology: vk::PrimitiveTopology,
        primitive_restart: bool,
    ) -> vk::PipelineInputAssemblyStateCreateInfo<'static> {
        vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(topology)
            .primitive_restart_enable(primitive_restart)
    }

    pub fn default_viewport(width: f32, height: f32) -> vk::Viewport {
        vk::Viewport::default()
            .x(0.0)
            .y(0.0)
            .width(width)
            .height(height)
            .min_depth(DEFAULT_VIEWPORT_MIN_DEPTH)
            .max_depth(DEFAULT_VIEWPORT_MAX_DEPTH)
    }

    pub fn default_scissor(width: u32, height: u32) -> vk::Rect2D {
        vk::Rect2D::default()
            .offset(vk::Offset2D { x: 0, y: 0 })
            .extent(vk::Extent2D { width, height })
    }

    pub fn rasterization_state(
        discard: bool,
        polygon_mode: vk::PolygonMode,
        cull_mode: vk::CullModeFlags,
        front_face: vk::FrontFace,
    ) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .rasterizer_discard_enable(discard)
            .polygon_mode(polygon_mode)
            .cull_mode(cull_mode)
            .front_face(front_face)
            .line_width(1.0)
    }

    pub fn multisample_state(
        samples: vk::SampleCountFlags,
    ) -> vk::PipelineMultisampleStateCreateInfo<'static> {
        vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(samples)
            .min_sample_shading(1.0)
    }

    pub fn depth_stencil_state(
        depth_test: bool,
        depth_write: bool,
        compare_op: vk::CompareOp,
    ) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_test)
            .depth_write_enable(depth_write)
            .depth_compare_op(compare_op)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
    }

    /// An opaque color blend attachment writing all components.
    pub fn opaque_color_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    }
}

/// The shader database maintains a cache of shader modules and PSOs, keyed by
/// unique names, and owns the serializable pipeline cache.
pub struct ShaderDatabase {
    shaders: HashMap<String, Shader>,
    pipelines: HashMap<String, PipelineStateObject>,
    pipeline_cache: vk::PipelineCache,
    device: Arc<DeviceShared>,
}

impl ShaderDatabase {
    /// Creates the database, optionally seeding the pipeline cache from a
    /// previously persisted blob.
    pub fn new(ctx: &RenderContext, initial_cache_data: Option<&[u8]>) -> Result<Self> {
        let create_info = vk::PipelineCacheCreateInfo::default()
            .initial_data(initial_cache_data.unwrap_or(&[]));
        let pipeline_cache = unsafe { ctx.shared.raw.create_pipeline_cache(&create_info, None)? };

        Ok(Self {
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            pipeline_cache,
            device: ctx.shared.clone(),
        })
    }

    /// Registers a shader under a unique name. Duplicate registration is a
    /// programming error.
    pub fn register_shader(&mut self, name: &str, shader: Shader) -> Result<()> {
        if self.shaders.contains_key(name) {
            return Err(anyhow::anyhow!("Shader {name} is already registered"));
        }
        self.shaders.insert(name.to_owned(), shader);
        Ok(())
    }

    pub fn shader(&self, name: &str) -> Result<&Shader> {
        self.shaders
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Shader {name} was never registered"))
    }

    pub fn pipeline(&self, name: &str) -> Result<PipelineStateObject> {
        self.pipelines
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Pipeline {name} was never registered"))
    }

    /// Creates and registers a graphics pipeline from registered shaders and
    /// a configured builder.
    pub fn create_graphics_pipeline(
        &mut self,
        name: &str,
        shader_names: &[&str],
        builder: &GraphicsPipelineBuilder,
    ) -> Result<PipelineStateObject> {
        self.check_new_pipeline_name(name)?;

        let shader_stages = shader_names
            .iter()
            .map(|shader_name| {
                let shader = self.shader(shader_name)?;
                Ok(vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage)
                    .module(shader.module)
                    .name(c"main"))
            })
            .collect::<Result<Vec<_>>>()?;

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&builder.vertex_input_bindings)
            .vertex_attribute_descriptions(&builder.vertex_input_attributes);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(std::slice::from_ref(&builder.viewport))
            .scissors(std::slice::from_ref(&builder.scissor));

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&builder.color_blend_attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&builder.dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&builder.input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&builder.rasterization_state)
            .multisample_state(&builder.multisample_state)
            .depth_stencil_state(&builder.depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(builder.layout)
            .render_pass(builder.render_pass)
            .subpass(builder.subpass);

        let pipeline = unsafe {
            self.device
                .raw
                .create_graphics_pipelines(
                    self.pipeline_cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|e| e.1)?[0]
        };

        let pso = PipelineStateObject {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            pipeline,
        };
        self.pipelines.insert(name.to_owned(), pso);
        Ok(pso)
    }

    /// Creates and registers a compute pipeline from a registered shader.
    pub fn create_compute_pipeline(
        &mut self,
        name: &str,
        shader_name: &str,
        layout: vk::PipelineLayout,
    ) -> Result<PipelineStateObject> {
        self.check_new_pipeline_name(name)?;

        let shader = self.shader(shader_name)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(shader.stage)
            .module(shader.module)
            .name(c"main");

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipeline = unsafe {
            self.device
                .raw
                .create_compute_pipelines(
                    self.pipeline_cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|e| e.1)?[0]
        };

        let pso = PipelineStateObject {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            pipeline,
        };
        self.pipelines.insert(name.to_owned(), pso);
        Ok(pso)
    }

    /// Registers an externally built pipeline, e.g. a ray tracing pipeline
    /// produced by the RT pipeline builder. The database takes ownership.
    pub fn register_pipeline(
        &mut self,
        name: &str,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) -> Result<PipelineStateObject> {
        self.check_new_pipeline_name(name)?;

        let pso = PipelineStateObject {
            bind_point,
            pipeline,
        };
        self.pipelines.insert(name.to_owned(), pso);
        Ok(pso)
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// Serializes the pipeline cache so the caller can persist it at
    /// shutdown and hand it back on the next startup.
    pub fn pipeline_cache_data(&self) -> Result<Vec<u8>> {
        let data = unsafe { self.device.raw.get_pipeline_cache_data(self.pipeline_cache)? };
        Ok(data)
    }

    fn check_new_pipeline_name(&self, name: &str) -> Result<()> {
        if self.pipelines.contains_key(name) {
            return Err(anyhow::anyhow!("Pipeline {name} is already registered"));
        }
        Ok(())
    }
}

impl Drop for ShaderDatabase {
    fn drop(&mut self) {
        unsafe {
            for (_, pso) in self.pipelines.drain() {
                self.device.raw.destroy_pipeline(pso.pipeline, None);
            }
            for (_, shader) in self.shaders.drain() {
                self.device.raw.destroy_shader_module(shader.module, None);
            }
            self.device
                .raw
                .destroy_pipeline_cache(self.pipeline_cache, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_layout_builder_packs_push_constants() {
        let builder = PipelineLayoutBuilder::new()
            .add_push_constant(16, vk::ShaderStageFlags::VERTEX)
            .add_push_constant(64, vk::ShaderStageFlags::FRAGMENT)
            .add_push_constant(8, vk::ShaderStageFlags::COMPUTE);

        let offsets = builder
            .push_constants
            .iter()
            .map(|range| (range.offset, range.size))
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![(0, 16), (16, 64), (80, 8)]);
    }

    #[test]
    fn test_graphics_pipeline_builder_defaults() {
        let builder =
            GraphicsPipelineBuilder::new(vk::PipelineLayout::null(), vk::RenderPass::null())
                .viewport_scissor_extent(vk::Extent2D {
                    width: 1280,
                    height: 720,
                });

        assert_eq!(builder.viewport.width, 1280.0);
        assert_eq!(builder.viewport.height, 720.0);
        assert_eq!(builder.viewport.min_depth, DEFAULT_VIEWPORT_MIN_DEPTH);
        assert_eq!(builder.viewport.max_depth, DEFAULT_VIEWPORT_MAX_DEPTH);
        assert_eq!(builder.scissor.extent.width, 1280);
        assert_eq!(
            builder.dynamic_states,
            vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
        assert_eq!(builder.subpass, 0);
    }
}
