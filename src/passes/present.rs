//! Present pass: samples the final color image through a linear sampler and
//! writes it to the active swap image with a fullscreen triangle.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    descriptor::{DescriptorSetAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetManager},
    frame::ActiveFrame,
    passes::CommonResources,
    render_pass::{AttachmentType, RenderPassBuilder, SwapchainPassResourceManager},
    resource::{ImageSampler, ImageSamplerDescriptor},
    shader_database::{GraphicsPipelineBuilder, PipelineLayoutBuilder, PipelineStateObject, Shader, ShaderDatabase},
};

pub struct PresentPass {
    pub pass_input_sampler: ImageSampler,
    pub present_descriptor_set_layout: DescriptorSetLayout,
    pub present_descriptor_sets: Vec<DescriptorSetManager>,
    pub pass_resources: SwapchainPassResourceManager,
    layout: vk::PipelineLayout,
    pso: PipelineStateObject,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl PresentPass {
    pub fn new(
        ctx: Arc<RenderContext>,
        shader_database: &mut ShaderDatabase,
        descriptor_allocator: &mut DescriptorSetAllocator,
        fullscreen_vertex_spirv: &[u8],
        fragment_spirv: &[u8],
    ) -> Result<Self> {
        let pass_input_sampler = ctx.create_sampler(ImageSamplerDescriptor::new(
            vk::Filter::LINEAR,
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
        ))?;

        let present_descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            )
            .build(&ctx)?;
        let present_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &present_descriptor_set_layout)?;

        // The UI pass draws over the swap image afterwards, so the present
        // pass leaves it as a color attachment rather than a present source.
        let render_pass = RenderPassBuilder::new()
            .add_attachment(
                ctx.swapchain_format(),
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
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

        let mut pass_resources = SwapchainPassResourceManager::new(ctx.clone(), render_pass)?;
        pass_resources.set_clear_value(
            0,
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
        );

        let layout = PipelineLayoutBuilder::new()
            .add_descriptor_set_layout(&present_descriptor_set_layout)
            .build(&ctx)?;

        if shader_database.shader("fullscreen_quad_vert").is_err() {
            shader_database.register_shader(
                "fullscreen_quad_vert",
                Shader::from_spirv(&ctx, fullscreen_vertex_spirv, vk::ShaderStageFlags::VERTEX)?,
            )?;
        }
        shader_database.register_shader(
            "present_frag",
            Shader::from_spirv(&ctx, fragment_spirv, vk::ShaderStageFlags::FRAGMENT)?,
        )?;

        let pipeline_builder =
            GraphicsPipelineBuilder::new(layout, pass_resources.render_pass())
                .viewport_scissor_extent(ctx.swapchain_extent())
                .color_blend_attachments(vec![
                    GraphicsPipelineBuilder::opaque_color_blend_attachment(),
                ]);

        let pso = shader_database.create_graphics_pipeline(
            "present_pipeline",
            &["fullscreen_quad_vert", "present_frag"],
            &pipeline_builder,
        )?;

        Ok(Self {
            pass_input_sampler,
            present_descriptor_set_layout,
            present_descriptor_sets,
            pass_resources,
            layout,
            pso,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    /// Points the present input at the final color image of the active render
    /// mode. Called by the renderer each frame before commands are recorded.
    pub fn prepare_inputs(
        &mut self,
        frame_slot_index: u32,
        render_result_view: vk::ImageView,
    ) -> Result<()> {
        let set = &mut self.present_descriptor_sets[frame_slot_index as usize];
        set.write_image(
            0,
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image_view(render_result_view)
                .sampler(self.pass_input_sampler.raw()),
        );
        set.flush()?;

        Ok(())
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, _common: &CommonResources) {
        let device = self.ctx.device();

        self.pass_resources.begin_render_pass(frame);
        self.debug.cmd_begin_label(frame.command_buffer, "Present pass");

        unsafe {
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                self.pso.bind_point,
                self.layout,
                0,
                &[self.present_descriptor_sets[frame.current_frame_index as usize].set()],
                &[],
            );
            device.cmd_bind_pipeline(frame.command_buffer, self.pso.bind_point, self.pso.pipeline);
            device.cmd_draw(frame.command_buffer, 3, 1, 0, 0);
        }

        self.debug.cmd_end_label(frame.command_buffer);
        self.pass_resources.end_render_pass(frame);
    }

    pub fn recreate_resources(&mut self) -> Result<()> {
        self.pass_resources.recreate()
    }
}

impl Drop for PresentPass {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}
