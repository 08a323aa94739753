//! Ray-traced direct illumination. Ray generation reads the sampled
//! G-buffer's surface attributes, traces shadow/light rays into the TLAS and
//! writes the illumination result for the deferred shading pass.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    descriptor::{DescriptorSetAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetManager},
    frame::ActiveFrame,
    passes::CommonResources,
    raytracing::{RayTracingContext, RayTracingPipelineBuilder, ShaderBindingTable},
    resource::{ImageResource, ImageResourceDescriptor, ImageSampler, ImageSamplerDescriptor},
    shader_database::{PipelineLayoutBuilder, PipelineStateObject, Shader, ShaderDatabase},
};

pub struct DirectIlluminationPass {
    pub pass_input_sampler: ImageSampler,
    pub gbuffer_data_descriptor_set_layout: DescriptorSetLayout,
    pub rt_descriptor_set_layout: DescriptorSetLayout,
    pub gbuffer_data_descriptor_sets: Vec<DescriptorSetManager>,
    pub rt_descriptor_sets: Vec<DescriptorSetManager>,
    pub render_result: ImageResource,
    rt: Arc<RayTracingContext>,
    layout: vk::PipelineLayout,
    pso: PipelineStateObject,
    sbt: ShaderBindingTable,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl DirectIlluminationPass {
    pub fn new(
        ctx: Arc<RenderContext>,
        rt: Arc<RayTracingContext>,
        shader_database: &mut ShaderDatabase,
        descriptor_allocator: &mut DescriptorSetAllocator,
        raygen_spirv: &[u8],
        miss_spirv: &[u8],
        closest_hit_spirv: &[u8],
    ) -> Result<Self> {
        let pass_input_sampler = ctx.create_sampler(ImageSamplerDescriptor::new(
            vk::Filter::NEAREST,
            vk::Filter::NEAREST,
            vk::SamplerMipmapMode::NEAREST,
        ))?;

        let mut gbuffer_layout_builder = DescriptorSetLayoutBuilder::new();
        for binding in 0..6 {
            gbuffer_layout_builder = gbuffer_layout_builder.add_binding(
                binding,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            );
        }
        let gbuffer_data_descriptor_set_layout = gbuffer_layout_builder.build(&ctx)?;

        let rt_descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            )
            .add_binding(
                1,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            )
            .build(&ctx)?;

        let gbuffer_data_descriptor_sets = DescriptorSetManager::new_per_frame(
            &ctx,
            descriptor_allocator,
            &gbuffer_data_descriptor_set_layout,
        )?;
        let rt_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &rt_descriptor_set_layout)?;

        let render_result = Self::create_render_result(&ctx, ctx.swapchain_extent())?;

        let layout = PipelineLayoutBuilder::new()
            .add_descriptor_set_layout(&gbuffer_data_descriptor_set_layout)
            .add_descriptor_set_layout(&rt_descriptor_set_layout)
            .build(&ctx)?;

        shader_database.register_shader(
            "direct_illumination_rgen",
            Shader::from_spirv(&ctx, raygen_spirv, vk::ShaderStageFlags::RAYGEN_KHR)?,
        )?;
        shader_database.register_shader(
            "direct_illumination_rmiss",
            Shader::from_spirv(&ctx, miss_spirv, vk::ShaderStageFlags::MISS_KHR)?,
        )?;
        shader_database.register_shader(
            "direct_illumination_rchit",
            Shader::from_spirv(&ctx, closest_hit_spirv, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?,
        )?;

        let pipeline_builder = RayTracingPipelineBuilder::new()
            .add_shader_stage(
                vk::ShaderStageFlags::RAYGEN_KHR,
                shader_database.shader("direct_illumination_rgen")?.module,
            )
            .add_shader_stage(
                vk::ShaderStageFlags::MISS_KHR,
                shader_database.shader("direct_illumination_rmiss")?.module,
            )
            .add_shader_stage(
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                shader_database.shader("direct_illumination_rchit")?.module,
            )
            .add_general_group(0)
            .add_general_group(1)
            .add_triangles_hit_group(2, vk::SHADER_UNUSED_KHR)
            .layout(layout);

        let pipeline = pipeline_builder.build(&rt, shader_database.pipeline_cache())?;
        let pso = shader_database.register_pipeline(
            "direct_illumination_pipeline",
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline,
        )?;
        let sbt = ShaderBindingTable::new(&ctx, &rt, pso.pipeline, &pipeline_builder)?;

        Ok(Self {
            pass_input_sampler,
            gbuffer_data_descriptor_set_layout,
            rt_descriptor_set_layout,
            gbuffer_data_descriptor_sets,
            rt_descriptor_sets,
            render_result,
            rt,
            layout,
            pso,
            sbt,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    pub fn prepare_frame(&mut self, common: &CommonResources) -> Result<()> {
        let rt_set = &mut self.rt_descriptor_sets[common.frame_slot_index as usize];
        rt_set.write_acceleration_structure(0, common.tlas.raw());
        rt_set.write_image(
            1,
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::GENERAL)
                .image_view(self.render_result.view()),
        );
        rt_set.flush()?;

        Ok(())
    }

    /// Rewrites the sampled G-buffer input descriptors. Called by the
    /// renderer each frame before commands are recorded.
    pub fn prepare_inputs(
        &mut self,
        frame_slot_index: u32,
        sampled_gbuffer_views: &[vk::ImageView],
    ) -> Result<()> {
        let sampler = self.pass_input_sampler.raw();
        let set = &mut self.gbuffer_data_descriptor_sets[frame_slot_index as usize];
        for (binding, view) in sampled_gbuffer_views.iter().enumerate() {
            set.write_image(
                binding as u32,
                vk::DescriptorImageInfo::default()
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .image_view(*view)
                    .sampler(sampler),
            );
        }
        set.flush()?;

        Ok(())
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, _common: &CommonResources) {
        let device = self.ctx.device();

        self.debug
            .cmd_begin_label(frame.command_buffer, "Direct illumination pass");

        let to_general = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
            .src_access_mask(vk::AccessFlags2::MEMORY_READ)
            .dst_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
            .dst_access_mask(vk::AccessFlags2::SHADER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .image(self.render_result.raw())
            .subresource_range(ImageResource::subresource_range(vk::ImageAspectFlags::COLOR));
        frame.pipeline_image_barrier(&[to_general], vk::DependencyFlags::empty());

        unsafe {
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                self.pso.bind_point,
                self.layout,
                0,
                &[
                    self.gbuffer_data_descriptor_sets[frame.current_frame_index as usize].set(),
                    self.rt_descriptor_sets[frame.current_frame_index as usize].set(),
                ],
                &[],
            );
            device.cmd_bind_pipeline(frame.command_buffer, self.pso.bind_point, self.pso.pipeline);
        }

        self.rt.cmd_trace_rays(
            frame.command_buffer,
            &self.sbt,
            vk::Extent2D {
                width: self.render_result.extent.width,
                height: self.render_result.extent.height,
            },
        );

        let to_shader_read = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
            .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image(self.render_result.raw())
            .subresource_range(ImageResource::subresource_range(vk::ImageAspectFlags::COLOR));
        frame.pipeline_image_barrier(&[to_shader_read], vk::DependencyFlags::empty());

        self.debug.cmd_end_label(frame.command_buffer);
    }

    pub fn recreate_resources(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.render_result = Self::create_render_result(&self.ctx, extent)?;
        Ok(())
    }

    fn create_render_result(ctx: &RenderContext, extent: vk::Extent2D) -> Result<ImageResource> {
        let mut image = ctx.create_image(ImageResourceDescriptor::new_2d(
            extent,
            vk::Format::R32G32B32A32_SFLOAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
        ))?;
        image.create_view(
            vk::ImageViewType::TYPE_2D,
            ImageResource::default_component_mapping(),
            ImageResource::subresource_range(vk::ImageAspectFlags::COLOR),
        )?;
        Ok(image)
    }
}

impl Drop for DirectIlluminationPass {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}
