//! Path-traced reference mode with temporal accumulation. Two render result
//! images alternate as write target and previous-frame source; the ping-pong
//! flag flips after every recorded frame.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    descriptor::{DescriptorSetAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetManager},
    frame::ActiveFrame,
    passes::{push_constant_bytes, CommonResources},
    raytracing::{RayTracingContext, RayTracingPipelineBuilder, ShaderBindingTable},
    resource::{ImageResource, ImageResourceDescriptor},
    shader_database::{PipelineLayoutBuilder, PipelineStateObject, Shader, ShaderDatabase},
};

#[repr(C)]
#[derive(Clone, Copy)]
struct PathTracingPushConstants {
    frame_index: u32,
    sub_frame_index: u32,
}

/// Selects which of the two render result images is written this frame. The
/// inverse is read as the previous frame's result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PingPong {
    current: bool,
}

impl PingPong {
    fn write_index(self) -> usize {
        self.current as usize
    }

    fn read_index(self) -> usize {
        (!self.current) as usize
    }

    fn flip(&mut self) {
        self.current = !self.current;
    }
}

pub struct PathTracingPass {
    pub scene_descriptor_set_layout: DescriptorSetLayout,
    pub rt_descriptor_set_layout: DescriptorSetLayout,
    pub scene_descriptor_sets: Vec<DescriptorSetManager>,
    pub rt_descriptor_sets: Vec<DescriptorSetManager>,
    render_results: Vec<ImageResource>,
    pub reproject_history: ImageResource,
    ping_pong: PingPong,
    rt: Arc<RayTracingContext>,
    layout: vk::PipelineLayout,
    pso: PipelineStateObject,
    sbt: ShaderBindingTable,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl PathTracingPass {
    pub fn new(
        ctx: Arc<RenderContext>,
        rt: Arc<RayTracingContext>,
        shader_database: &mut ShaderDatabase,
        descriptor_allocator: &mut DescriptorSetAllocator,
        raygen_spirv: &[u8],
        miss_spirv: &[u8],
        closest_hit_spirv: &[u8],
    ) -> Result<Self> {
        let extent = ctx.swapchain_extent();
        let render_results = Self::create_render_results(&ctx, extent)?;
        let reproject_history = Self::create_storage_image(&ctx, extent)?;

        let scene_descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            )
            .add_binding(
                1,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            )
            .add_binding(
                2,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                1,
            )
            .add_binding(
                3,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                1,
            )
            .build(&ctx)?;

        let rt_descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                1,
            )
            .add_binding(
                1,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            )
            .add_binding(
                2,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            )
            .add_binding(
                3,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
            )
            .build(&ctx)?;

        let scene_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &scene_descriptor_set_layout)?;
        let rt_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &rt_descriptor_set_layout)?;

        let layout = PipelineLayoutBuilder::new()
            .add_push_constant(
                std::mem::size_of::<PathTracingPushConstants>(),
                vk::ShaderStageFlags::RAYGEN_KHR,
            )
            .add_descriptor_set_layout(&scene_descriptor_set_layout)
            .add_descriptor_set_layout(&rt_descriptor_set_layout)
            .build(&ctx)?;

        shader_database.register_shader(
            "path_tracing_rgen",
            Shader::from_spirv(&ctx, raygen_spirv, vk::ShaderStageFlags::RAYGEN_KHR)?,
        )?;
        shader_database.register_shader(
            "path_tracing_rmiss",
            Shader::from_spirv(&ctx, miss_spirv, vk::ShaderStageFlags::MISS_KHR)?,
        )?;
        shader_database.register_shader(
            "path_tracing_rchit",
            Shader::from_spirv(&ctx, closest_hit_spirv, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?,
        )?;

        let pipeline_builder = RayTracingPipelineBuilder::new()
            .add_shader_stage(
                vk::ShaderStageFlags::RAYGEN_KHR,
                shader_database.shader("path_tracing_rgen")?.module,
            )
            .add_shader_stage(
                vk::ShaderStageFlags::MISS_KHR,
                shader_database.shader("path_tracing_rmiss")?.module,
            )
            .add_shader_stage(
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                shader_database.shader("path_tracing_rchit")?.module,
            )
            .add_general_group(0)
            .add_general_group(1)
            .add_triangles_hit_group(2, vk::SHADER_UNUSED_KHR)
            .layout(layout);

        let pipeline = pipeline_builder.build(&rt, shader_database.pipeline_cache())?;
        let pso = shader_database.register_pipeline(
            "path_tracing_pipeline",
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline,
        )?;
        let sbt = ShaderBindingTable::new(&ctx, &rt, pso.pipeline, &pipeline_builder)?;

        Ok(Self {
            scene_descriptor_set_layout,
            rt_descriptor_set_layout,
            scene_descriptor_sets,
            rt_descriptor_sets,
            render_results,
            reproject_history,
            ping_pong: PingPong::default(),
            rt,
            layout,
            pso,
            sbt,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    /// The view of this frame's render result. Valid for sampling after this
    /// pass's `draw_frame` has recorded; the selection is stable from
    /// `prepare_frame` until the ping-pong flips at the end of `draw_frame`.
    pub fn render_result_view(&self) -> vk::ImageView {
        self.render_results[self.ping_pong.write_index()].view()
    }

    pub fn prepare_frame(&mut self, common: &CommonResources) -> Result<()> {
        let slot = common.frame_slot_index as usize;

        let scene_set = &mut self.scene_descriptor_sets[slot];
        scene_set.write_buffer(0, CommonResources::buffer_info(common.camera_ubo));
        scene_set.write_buffer(1, CommonResources::buffer_info(common.prev_camera_ubo));
        scene_set.write_buffer(2, CommonResources::buffer_info(common.instance_ssbo));
        scene_set.write_buffer(3, CommonResources::buffer_info(common.material_ssbo));
        scene_set.flush()?;

        let rt_set = &mut self.rt_descriptor_sets[slot];
        rt_set.write_acceleration_structure(0, common.tlas.raw());
        rt_set.write_image(
            1,
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::GENERAL)
                .image_view(self.render_results[self.ping_pong.write_index()].view()),
        );
        rt_set.write_image(
            2,
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::GENERAL)
                .image_view(self.render_results[self.ping_pong.read_index()].view()),
        );
        rt_set.write_image(
            3,
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::GENERAL)
                .image_view(self.reproject_history.view()),
        );
        rt_set.flush()?;

        Ok(())
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, common: &CommonResources) {
        let device = self.ctx.device();

        self.debug.cmd_begin_label(frame.command_buffer, "Path tracing pass");

        let general_barrier = |image: &ImageResource| {
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
                .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
                .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .image(image.raw())
                .subresource_range(ImageResource::subresource_range(vk::ImageAspectFlags::COLOR))
        };

        frame.pipeline_image_barrier(
            &[
                general_barrier(&self.render_results[self.ping_pong.read_index()]),
                general_barrier(&self.render_results[self.ping_pong.write_index()]),
                general_barrier(&self.reproject_history),
            ],
            vk::DependencyFlags::empty(),
        );

        let push_constants = PathTracingPushConstants {
            frame_index: common.frame_index,
            sub_frame_index: common.sub_frame_index,
        };

        unsafe {
            device.cmd_push_constants(
                frame.command_buffer,
                self.layout,
                vk::ShaderStageFlags::RAYGEN_KHR,
                0,
                push_constant_bytes(&push_constants),
            );
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                self.pso.bind_point,
                self.layout,
                0,
                &[
                    self.scene_descriptor_sets[frame.current_frame_index as usize].set(),
                    self.rt_descriptor_sets[frame.current_frame_index as usize].set(),
                ],
                &[],
            );
            device.cmd_bind_pipeline(frame.command_buffer, self.pso.bind_point, self.pso.pipeline);
        }

        let extent = self.ctx.swapchain_extent();
        self.rt.cmd_trace_rays(frame.command_buffer, &self.sbt, extent);

        let write_target = &self.render_results[self.ping_pong.write_index()];
        let to_shader_read = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
            .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image(write_target.raw())
            .subresource_range(ImageResource::subresource_range(vk::ImageAspectFlags::COLOR));
        frame.pipeline_image_barrier(&[to_shader_read], vk::DependencyFlags::empty());

        self.debug.cmd_end_label(frame.command_buffer);

        self.ping_pong.flip();
    }

    pub fn recreate_resources(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.render_results = Self::create_render_results(&self.ctx, extent)?;
        self.reproject_history = Self::create_storage_image(&self.ctx, extent)?;
        Ok(())
    }

    fn create_render_results(
        ctx: &RenderContext,
        extent: vk::Extent2D,
    ) -> Result<Vec<ImageResource>> {
        (0..2).map(|_| Self::create_storage_image(ctx, extent)).collect()
    }

    fn create_storage_image(ctx: &RenderContext, extent: vk::Extent2D) -> Result<ImageResource> {
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

impl Drop for PathTracingPass {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong_flip_direction() {
        let mut ping_pong = PingPong::default();

        // The image written in frame N is read as "previous" in frame N + 1,
        // so accumulation survives the flip at the end of each frame.
        for _ in 0..8 {
            let written = ping_pong.write_index();
            ping_pong.flip();
            assert_eq!(ping_pong.read_index(), written);
        }
    }

    #[test]
    fn test_ping_pong_indices_are_disjoint() {
        let mut ping_pong = PingPong::default();
        for _ in 0..4 {
            assert_ne!(ping_pong.write_index(), ping_pong.read_index());
            assert!(ping_pong.write_index() < 2);
            assert!(ping_pong.read_index() < 2);
            ping_pong.flip();
        }
    }

    #[test]
    fn test_ping_pong_alternates_write_target() {
        let mut ping_pong = PingPong::default();
        let first = ping_pong.write_index();
        ping_pong.flip();
        let second = ping_pong.write_index();
        ping_pong.flip();

        assert_ne!(first, second);
        assert_eq!(ping_pong.write_index(), first);
    }
}
