//! Stochastic G-buffer sampling: reads both LOD G-buffer copies and the RNG
//! image, blending them per sample into a single sampled G-buffer.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use nalgebra::Vector2;

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    descriptor::{DescriptorSetAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetManager},
    frame::ActiveFrame,
    passes::{push_constant_bytes, CommonResources},
    render_pass::{AttachmentType, RenderAttachmentConfig, RenderPassBuilder, RenderPassResourceManager},
    resource::{ImageSampler, ImageSamplerDescriptor},
    shader_database::{GraphicsPipelineBuilder, PipelineLayoutBuilder, PipelineStateObject, Shader, ShaderDatabase},
};

#[repr(C)]
#[derive(Clone, Copy)]
struct GBufferSamplePushConstants {
    resolution: Vector2<f32>,
}

/// Attachment order of the sampled G-buffer: albedo, emission, specular,
/// transmittance, normal, depth folded into a color target.
pub const GBUFFER_SAMPLE_ATTACHMENT_COUNT: usize = 6;

pub struct GBufferSamplePass {
    pub pass_input_sampler: ImageSampler,
    pub rng_descriptor_set_layout: DescriptorSetLayout,
    pub gbuffer_descriptor_set_layout: DescriptorSetLayout,
    pub rng_descriptor_sets: Vec<DescriptorSetManager>,
    pub far_lod_descriptor_sets: Vec<DescriptorSetManager>,
    pub near_lod_descriptor_sets: Vec<DescriptorSetManager>,
    pub pass_resources: RenderPassResourceManager,
    layout: vk::PipelineLayout,
    pso: PipelineStateObject,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl GBufferSamplePass {
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

        let rng_descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            )
            .build(&ctx)?;

        let mut gbuffer_layout_builder = DescriptorSetLayoutBuilder::new();
        for binding in 0..7 {
            gbuffer_layout_builder = gbuffer_layout_builder.add_binding(
                binding,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            );
        }
        let gbuffer_descriptor_set_layout = gbuffer_layout_builder.build(&ctx)?;

        let rng_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &rng_descriptor_set_layout)?;
        let far_lod_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &gbuffer_descriptor_set_layout)?;
        let near_lod_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &gbuffer_descriptor_set_layout)?;

        let extent = ctx.swapchain_extent();
        let pass_resources = Self::create_pass_resources(ctx.clone(), extent)?;

        let layout = PipelineLayoutBuilder::new()
            .add_push_constant(
                std::mem::size_of::<GBufferSamplePushConstants>(),
                vk::ShaderStageFlags::FRAGMENT,
            )
            .add_descriptor_set_layout(&rng_descriptor_set_layout)
            .add_descriptor_set_layout(&gbuffer_descriptor_set_layout)
            .add_descriptor_set_layout(&gbuffer_descriptor_set_layout)
            .build(&ctx)?;

        if shader_database.shader("fullscreen_quad_vert").is_err() {
            shader_database.register_shader(
                "fullscreen_quad_vert",
                Shader::from_spirv(&ctx, fullscreen_vertex_spirv, vk::ShaderStageFlags::VERTEX)?,
            )?;
        }
        shader_database.register_shader(
            "gbuffer_sample_frag",
            Shader::from_spirv(&ctx, fragment_spirv, vk::ShaderStageFlags::FRAGMENT)?,
        )?;

        let blend_attachments = vec![
            GraphicsPipelineBuilder::opaque_color_blend_attachment();
            GBUFFER_SAMPLE_ATTACHMENT_COUNT
        ];
        let pipeline_builder = GraphicsPipelineBuilder::new(layout, pass_resources.render_pass())
            .viewport_scissor_extent(extent)
            .color_blend_attachments(blend_attachments);

        let pso = shader_database.create_graphics_pipeline(
            "gbuffer_sample_pipeline",
            &["fullscreen_quad_vert", "gbuffer_sample_frag"],
            &pipeline_builder,
        )?;

        Ok(Self {
            pass_input_sampler,
            rng_descriptor_set_layout,
            gbuffer_descriptor_set_layout,
            rng_descriptor_sets,
            far_lod_descriptor_sets,
            near_lod_descriptor_sets,
            pass_resources,
            layout,
            pso,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    /// Rewrites the input descriptors from the producing passes' attachment
    /// views. Called by the renderer each frame before commands are recorded.
    pub fn prepare_inputs(
        &mut self,
        frame_slot_index: u32,
        rng_view: vk::ImageView,
        far_lod_views: &[vk::ImageView],
        near_lod_views: &[vk::ImageView],
    ) -> Result<()> {
        let sampler = self.pass_input_sampler.raw();
        let slot = frame_slot_index as usize;

        let rng_set = &mut self.rng_descriptor_sets[slot];
        rng_set.write_image(
            0,
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image_view(rng_view)
                .sampler(sampler),
        );
        rng_set.flush()?;

        for (set, views) in [
            (&mut self.far_lod_descriptor_sets[slot], far_lod_views),
            (&mut self.near_lod_descriptor_sets[slot], near_lod_views),
        ] {
            for (binding, view) in views.iter().enumerate() {
                set.write_image(
                    binding as u32,
                    vk::DescriptorImageInfo::default()
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .image_view(*view)
                        .sampler(sampler),
                );
            }
            set.flush()?;
        }

        Ok(())
    }

    /// Views of the sampled G-buffer attachments, for downstream passes.
    pub fn attachment_views(&self) -> Vec<vk::ImageView> {
        (0..self.pass_resources.attachment_count())
            .map(|index| self.pass_resources.attachment(index).view())
            .collect()
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, _common: &CommonResources) {
        let device = self.ctx.device();
        let extent = self.pass_resources.extent();

        self.pass_resources.begin_render_pass(frame);
        self.debug.cmd_begin_label(frame.command_buffer, "G-buffer sample pass");

        let push_constants = GBufferSamplePushConstants {
            resolution: Vector2::new(extent.width as f32, extent.height as f32),
        };

        unsafe {
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                self.pso.bind_point,
                self.layout,
                0,
                &[
                    self.rng_descriptor_sets[frame.current_frame_index as usize].set(),
                    self.far_lod_descriptor_sets[frame.current_frame_index as usize].set(),
                    self.near_lod_descriptor_sets[frame.current_frame_index as usize].set(),
                ],
                &[],
            );
            device.cmd_push_constants(
                frame.command_buffer,
                self.layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                push_constant_bytes(&push_constants),
            );
            device.cmd_bind_pipeline(frame.command_buffer, self.pso.bind_point, self.pso.pipeline);
            device.cmd_draw(frame.command_buffer, 3, 1, 0, 0);
        }

        self.debug.cmd_end_label(frame.command_buffer);
        self.pass_resources.end_render_pass(frame);

        // The sampled G-buffer is read by ray generation and fragment work.
        let memory_barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(
                vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            )
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
        let formats = [
            vk::Format::R8G8B8A8_SNORM,       // Albedo
            vk::Format::R32G32B32A32_SFLOAT,  // Emission
            vk::Format::R32G32B32A32_SFLOAT,  // Specular
            vk::Format::R32G32B32A32_SFLOAT,  // Transmittance
            vk::Format::R32G32B32A32_SFLOAT,  // Normal
            vk::Format::R32_SFLOAT,           // Depth, resolved to a color target
        ];

        let mut builder = RenderPassBuilder::new();
        for format in formats {
            builder = builder.add_attachment(
                format,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
            );
        }
        for index in 0..formats.len() {
            builder = builder.set_attachment_reference(
                AttachmentType::Color,
                vk::AttachmentReference {
                    attachment: index as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                },
            );
        }
        let render_pass = builder.build(&ctx)?;

        let attachment_configs = formats
            .iter()
            .map(|format| RenderAttachmentConfig::sampled_color(*format))
            .collect();

        let mut resources =
            RenderPassResourceManager::new(ctx, render_pass, attachment_configs, extent)?;
        for index in 0..formats.len() {
            resources.set_clear_value(
                index,
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 0.0],
                    },
                },
            );
        }

        Ok(resources)
    }
}

impl Drop for GBufferSamplePass {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}
