//! Deferred shading: combines the sampled G-buffer with the direct
//! illumination result into the final color image.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    descriptor::{DescriptorSetAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetManager},
    frame::ActiveFrame,
    passes::CommonResources,
    render_pass::{AttachmentType, RenderAttachmentConfig, RenderPassBuilder, RenderPassResourceManager},
    resource::{ImageSampler, ImageSamplerDescriptor},
    shader_database::{GraphicsPipelineBuilder, PipelineLayoutBuilder, PipelineStateObject, Shader, ShaderDatabase},
};

/// Binding index of the direct illumination input; the sampled G-buffer
/// occupies the bindings below it.
const ILLUMINATION_BINDING: u32 = 6;

pub struct DeferredShadingPass {
    pub pass_input_sampler: ImageSampler,
    pub input_descriptor_set_layout: DescriptorSetLayout,
    pub input_descriptor_sets: Vec<DescriptorSetManager>,
    pub pass_resources: RenderPassResourceManager,
    layout: vk::PipelineLayout,
    pso: PipelineStateObject,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl DeferredShadingPass {
    pub fn new(
        ctx: Arc<RenderContext>,
        shader_database: &mut ShaderDatabase,
        descriptor_allocator: &mut DescriptorSetAllocator,
        fullscreen_vertex_spirv: &[u8],
        fragment_spirv: &[u8],
    ) -> Result<Self> {
        let pass_input_sampler = ctx.create_sampler(ImageSamplerDescriptor::new(
            vk::Filter::NEAREST,
            vk::Filter::NEAREST,
            vk::SamplerMipmapMode::NEAREST,
        ))?;

        let mut layout_builder = DescriptorSetLayoutBuilder::new();
        for binding in 0..=ILLUMINATION_BINDING {
            layout_builder = layout_builder.add_binding(
                binding,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            );
        }
        let input_descriptor_set_layout = layout_builder.build(&ctx)?;
        let input_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &input_descriptor_set_layout)?;

        let extent = ctx.swapchain_extent();
        let pass_resources = Self::create_pass_resources(ctx.clone(), extent)?;

        let layout = PipelineLayoutBuilder::new()
            .add_descriptor_set_layout(&input_descriptor_set_layout)
            .build(&ctx)?;

        if shader_database.shader("fullscreen_quad_vert").is_err() {
            shader_database.register_shader(
                "fullscreen_quad_vert",
                Shader::from_spirv(&ctx, fullscreen_vertex_spirv, vk::ShaderStageFlags::VERTEX)?,
            )?;
        }
        shader_database.register_shader(
            "deferred_shading_frag",
            Shader::from_spirv(&ctx, fragment_spirv, vk::ShaderStageFlags::FRAGMENT)?,
        )?;

        let pipeline_builder = GraphicsPipelineBuilder::new(layout, pass_resources.render_pass())
            .viewport_scissor_extent(extent)
            .color_blend_attachments(vec![
                GraphicsPipelineBuilder::opaque_color_blend_attachment(),
            ]);

        let pso = shader_database.create_graphics_pipeline(
            "deferred_shading_pipeline",
            &["fullscreen_quad_vert", "deferred_shading_frag"],
            &pipeline_builder,
        )?;

        Ok(Self {
            pass_input_sampler,
            input_descriptor_set_layout,
            input_descriptor_sets,
            pass_resources,
            layout,
            pso,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    /// The final shaded color image view, sampled by the present pass.
    pub fn render_result_view(&self) -> vk::ImageView {
        self.pass_resources.attachment(0).view()
    }

    /// Rewrites the input descriptors from the sampled G-buffer and the
    /// illumination result. Called by the renderer each frame before
    /// commands are recorded.
    pub fn prepare_inputs(
        &mut self,
        frame_slot_index: u32,
        sampled_gbuffer_views: &[vk::ImageView],
        illumination_view: vk::ImageView,
    ) -> Result<()> {
        let sampler = self.pass_input_sampler.raw();
        let set = &mut self.input_descriptor_sets[frame_slot_index as usize];

        for (binding, view) in sampled_gbuffer_views.iter().enumerate() {
            set.write_image(
                binding as u32,
                vk::DescriptorImageInfo::default()
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .image_view(*view)
                    .sampler(sampler),
            );
        }
        set.write_image(
            ILLUMINATION_BINDING,
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image_view(illumination_view)
                .sampler(sampler),
        );
        set.flush()?;

        Ok(())
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, _common: &CommonResources) {
        let device = self.ctx.device();

        self.pass_resources.begin_render_pass(frame);
        self.debug.cmd_begin_label(frame.command_buffer, "Deferred shading pass");

        unsafe {
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                self.pso.bind_point,
                self.layout,
                0,
                &[self.input_descriptor_sets[frame.current_frame_index as usize].set()],
                &[],
            );
            device.cmd_bind_pipeline(frame.command_buffer, self.pso.bind_point, self.pso.pipeline);
            device.cmd_draw(frame.command_buffer, 3, 1, 0, 0);
        }

        self.debug.cmd_end_label(frame.command_buffer);
        self.pass_resources.end_render_pass(frame);

        // The final color image is sampled by the present pass.
        let memory_barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ);
        frame.pipeline_barrier(&[memory_barrier], vk::DependencyFlags::empty());
    }

    pub fn recreate_resources(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.pass_resources.recreate(extent)
    }

    fn create_pass_resources(
        ctx: Arc<RenderContext>,
        extent: vk::Extent2D,
    ) -> Result<RenderPassResourceManager> {
        let render_pass = RenderPassBuilder::new()
            .add_attachment(
                vk::Format::R32G32B32A32_SFLOAT,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
            )
            .set_attachment_reference(
                AttachmentType::Color,
                vk::AttachmentReference {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                },
            )
            .build(&ctx)?;

        let mut resources = RenderPassResourceManager::new(
            ctx,
            render_pass,
            vec![RenderAttachmentConfig::sampled_color(
                vk::Format::R32G32B32A32_SFLOAT,
            )],
            extent,
        )?;
        resources.set_clear_value(
            0,
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
        );

        Ok(resources)
    }
}

impl Drop for DeferredShadingPass {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}
