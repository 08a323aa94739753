//! White-noise RNG source generation, seeding the stochastic G-buffer
//! sample pass.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    descriptor::{DescriptorSetAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetManager},
    frame::ActiveFrame,
    passes::{push_constant_bytes, CommonResources},
    resource::{ImageResource, ImageResourceDescriptor},
    shader_database::{PipelineLayoutBuilder, PipelineStateObject, Shader, ShaderDatabase},
};

#[repr(C)]
#[derive(Clone, Copy)]
struct RngPushConstants {
    frame_index: u32,
}

/// Computes a screen-sized white-noise image, reseeded from the frame index
/// every frame.
pub struct RngGenerationPass {
    pub rng_descriptor_set_layout: DescriptorSetLayout,
    pub rng_descriptor_sets: Vec<DescriptorSetManager>,
    pub rng_source: ImageResource,
    layout: vk::PipelineLayout,
    pso: PipelineStateObject,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl RngGenerationPass {
    pub fn new(
        ctx: Arc<RenderContext>,
        shader_database: &mut ShaderDatabase,
        descriptor_allocator: &mut DescriptorSetAllocator,
        compute_spirv: &[u8],
    ) -> Result<Self> {
        let rng_source = Self::create_rng_source(&ctx, ctx.swapchain_extent())?;

        let rng_descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ShaderStageFlags::COMPUTE,
                1,
            )
            .build(&ctx)?;
        let rng_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &rng_descriptor_set_layout)?;

        let layout = PipelineLayoutBuilder::new()
            .add_push_constant(
                std::mem::size_of::<RngPushConstants>(),
                vk::ShaderStageFlags::COMPUTE,
            )
            .add_descriptor_set_layout(&rng_descriptor_set_layout)
            .build(&ctx)?;

        shader_database.register_shader(
            "rng_gen_compute",
            Shader::from_spirv(&ctx, compute_spirv, vk::ShaderStageFlags::COMPUTE)?,
        )?;
        let pso = shader_database.create_compute_pipeline("rng_gen_pipeline", "rng_gen_compute", layout)?;

        Ok(Self {
            rng_descriptor_set_layout,
            rng_descriptor_sets,
            rng_source,
            layout,
            pso,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    pub fn prepare_frame(&mut self, common: &CommonResources) -> Result<()> {
        let rng_source_info = vk::DescriptorImageInfo::default()
            .image_layout(vk::ImageLayout::GENERAL)
            .image_view(self.rng_source.view());

        let set = &mut self.rng_descriptor_sets[common.frame_slot_index as usize];
        set.write_image(0, rng_source_info);
        set.flush()?;

        Ok(())
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, common: &CommonResources) {
        let device = self.ctx.device();

        self.debug.cmd_begin_label(frame.command_buffer, "RNG generation pass");

        let to_general = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .image(self.rng_source.raw())
            .subresource_range(ImageResource::subresource_range(vk::ImageAspectFlags::COLOR));
        frame.pipeline_image_barrier(&[to_general], vk::DependencyFlags::empty());

        let push_constants = RngPushConstants {
            frame_index: common.frame_index,
        };

        unsafe {
            device.cmd_bind_pipeline(frame.command_buffer, self.pso.bind_point, self.pso.pipeline);
            device.cmd_push_constants(
                frame.command_buffer,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constant_bytes(&push_constants),
            );
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                self.pso.bind_point,
                self.layout,
                0,
                &[self.rng_descriptor_sets[frame.current_frame_index as usize].set()],
                &[],
            );
            device.cmd_dispatch(
                frame.command_buffer,
                self.rng_source.extent.width,
                self.rng_source.extent.height,
                1,
            );
        }

        let to_shader_read = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
            .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image(self.rng_source.raw())
            .subresource_range(ImageResource::subresource_range(vk::ImageAspectFlags::COLOR));
        frame.pipeline_image_barrier(&[to_shader_read], vk::DependencyFlags::empty());

        self.debug.cmd_end_label(frame.command_buffer);
    }

    pub fn recreate_resources(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.rng_source = Self::create_rng_source(&self.ctx, extent)?;
        Ok(())
    }

    fn create_rng_source(ctx: &RenderContext, extent: vk::Extent2D) -> Result<ImageResource> {
        let mut image = ctx.create_image(ImageResourceDescriptor::new_2d(
            extent,
            vk::Format::R32_SFLOAT,
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

impl Drop for RngGenerationPass {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}
