//! G-buffer layout generation. Runs the scene geometry twice, once over the
//! far-LOD mesh set and once over the near-LOD set, into two independent
//! attachment sets sharing an identical layout. The shader consults the
//! pushed LOD mask to decide write or discard per sample.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use nalgebra::Matrix4;

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    descriptor::{DescriptorSetAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetManager},
    frame::ActiveFrame,
    passes::{push_constant_bytes, CommonResources},
    render_pass::{AttachmentType, RenderAttachmentConfig, RenderPassBuilder, RenderPassResourceManager},
    scene::{lod_mask, Vertex, VALID_LOD_MASK},
    shader_database::{GraphicsPipelineBuilder, PipelineLayoutBuilder, PipelineStateObject, Shader, ShaderDatabase},
};

/// Which LOD mesh set a G-buffer invocation rasterizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LodMode {
    Near,
    Far,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GBufferLayoutPushConstants {
    instance_id: u32,
    lod_mask: u32,
    model_matrix: Matrix4<f32>,
}

pub struct GBufferLayoutPass {
    pub scene_descriptor_set_layout: DescriptorSetLayout,
    pub scene_descriptor_sets: Vec<DescriptorSetManager>,
    pub far_lod_pass_resources: RenderPassResourceManager,
    pub near_lod_pass_resources: RenderPassResourceManager,
    layout: vk::PipelineLayout,
    pso: PipelineStateObject,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl GBufferLayoutPass {
    pub fn new(
        ctx: Arc<RenderContext>,
        shader_database: &mut ShaderDatabase,
        descriptor_allocator: &mut DescriptorSetAllocator,
        vertex_spirv: &[u8],
        fragment_spirv: &[u8],
    ) -> Result<Self> {
        let scene_descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
                1,
            )
            .add_binding(
                1,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            )
            .add_binding(
                2,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            )
            .build(&ctx)?;
        let scene_descriptor_sets =
            DescriptorSetManager::new_per_frame(&ctx, descriptor_allocator, &scene_descriptor_set_layout)?;

        let extent = ctx.swapchain_extent();
        let pass_builder = Self::render_pass_builder();
        let far_lod_pass_resources = Self::create_pass_resources(
            ctx.clone(),
            pass_builder.clone().build(&ctx)?,
            extent,
        )?;
        let near_lod_pass_resources =
            Self::create_pass_resources(ctx.clone(), pass_builder.build(&ctx)?, extent)?;

        let layout = PipelineLayoutBuilder::new()
            .add_push_constant(
                std::mem::size_of::<GBufferLayoutPushConstants>(),
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            )
            .add_descriptor_set_layout(&scene_descriptor_set_layout)
            .build(&ctx)?;

        shader_database.register_shader(
            "static_vert",
            Shader::from_spirv(&ctx, vertex_spirv, vk::ShaderStageFlags::VERTEX)?,
        )?;
        shader_database.register_shader(
            "gbuffer_layout_frag",
            Shader::from_spirv(&ctx, fragment_spirv, vk::ShaderStageFlags::FRAGMENT)?,
        )?;

        // One blend attachment per color target; the depth target has none.
        let blend_attachments =
            vec![GraphicsPipelineBuilder::opaque_color_blend_attachment(); 6];

        let pipeline_builder =
            GraphicsPipelineBuilder::new(layout, far_lod_pass_resources.render_pass())
                .vertex_input(Vertex::input_bindings(), Vertex::input_attributes())
                .viewport_scissor_extent(extent)
                .depth_stencil(GraphicsPipelineBuilder::depth_stencil_state(
                    true,
                    true,
                    vk::CompareOp::LESS,
                ))
                .color_blend_attachments(blend_attachments);

        let pso = shader_database.create_graphics_pipeline(
            "gbuffer_layout_pipeline",
            &["static_vert", "gbuffer_layout_frag"],
            &pipeline_builder,
        )?;

        Ok(Self {
            scene_descriptor_set_layout,
            scene_descriptor_sets,
            far_lod_pass_resources,
            near_lod_pass_resources,
            layout,
            pso,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    /// Views of one G-buffer copy's attachments, for the sample pass.
    pub fn attachment_views(&self, mode: LodMode) -> Vec<vk::ImageView> {
        let resources = match mode {
            LodMode::Far => &self.far_lod_pass_resources,
            LodMode::Near => &self.near_lod_pass_resources,
        };
        (0..resources.attachment_count())
            .map(|index| resources.attachment(index).view())
            .collect()
    }

    pub fn prepare_frame(&mut self, common: &CommonResources) -> Result<()> {
        let set = &mut self.scene_descriptor_sets[common.frame_slot_index as usize];
        set.write_buffer(0, CommonResources::buffer_info(common.camera_ubo));
        set.write_buffer(1, CommonResources::buffer_info(common.instance_ssbo));
        set.write_buffer(2, CommonResources::buffer_info(common.material_ssbo));
        set.flush()?;

        Ok(())
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, common: &CommonResources) {
        self.execute_gbuffer_pass(frame, common, LodMode::Far);
        self.execute_gbuffer_pass(frame, common, LodMode::Near);

        // Make both G-buffer copies visible to the sample pass.
        let memory_barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ);
        frame.pipeline_barrier(&[memory_barrier], vk::DependencyFlags::empty());
    }

    pub fn recreate_resources(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.far_lod_pass_resources.recreate(extent)?;
        self.near_lod_pass_resources.recreate(extent)?;
        Ok(())
    }

    fn execute_gbuffer_pass(&self, frame: &ActiveFrame, common: &CommonResources, mode: LodMode) {
        let resources = match mode {
            LodMode::Far => &self.far_lod_pass_resources,
            LodMode::Near => &self.near_lod_pass_resources,
        };

        resources.begin_render_pass(frame);
        self.debug.cmd_begin_label(
            frame.command_buffer,
            match mode {
                LodMode::Near => "G-buffer layout LOD near",
                LodMode::Far => "G-buffer layout LOD far",
            },
        );

        let device = self.ctx.device();
        unsafe {
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                self.pso.bind_point,
                self.layout,
                0,
                &[self.scene_descriptor_sets[frame.current_frame_index as usize].set()],
                &[],
            );
            device.cmd_bind_pipeline(frame.command_buffer, self.pso.bind_point, self.pso.pipeline);
        }

        let use_near_lod = mode == LodMode::Near;
        for instance in &common.scene.instances {
            let instance_id = if use_near_lod {
                instance.mesh_lod_near
            } else {
                instance.mesh_lod_far
            };
            let mask = lod_mask(instance.lod_blend);
            let mask = if use_near_lod {
                (!mask) & VALID_LOD_MASK
            } else {
                mask & VALID_LOD_MASK
            };

            let push_constants = GBufferLayoutPushConstants {
                instance_id,
                lod_mask: mask,
                model_matrix: instance.model_matrix,
            };

            let mesh = &common.scene.meshes[instance_id as usize];
            unsafe {
                device.cmd_push_constants(
                    frame.command_buffer,
                    self.layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    push_constant_bytes(&push_constants),
                );
                device.cmd_bind_vertex_buffers(
                    frame.command_buffer,
                    0,
                    &[mesh.vertex_buffer.raw()],
                    &[0],
                );
                device.cmd_bind_index_buffer(
                    frame.command_buffer,
                    mesh.index_buffer.raw(),
                    0,
                    vk::IndexType::UINT32,
                );
                device.cmd_draw_indexed(frame.command_buffer, mesh.index_count, 1, 0, 0, 0);
            }
        }

        self.debug.cmd_end_label(frame.command_buffer);
        resources.end_render_pass(frame);
    }

    fn render_pass_builder() -> RenderPassBuilder {
        let mut builder = RenderPassBuilder::new();
        for format in [
            vk::Format::R8G8B8A8_SNORM,       // Albedo
            vk::Format::R32G32B32A32_SFLOAT,  // Emission
            vk::Format::R32G32B32A32_SFLOAT,  // Specular
            vk::Format::R32G32B32A32_SFLOAT,  // Transmittance
            vk::Format::R32G32B32A32_SFLOAT,  // Normal
            vk::Format::R32_SFLOAT,           // LOD mask
        ] {
            builder = builder.add_attachment(
                format,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
            );
        }
        builder = builder.add_attachment(
            vk::Format::D32_SFLOAT,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
        );

        for index in 0..6 {
            builder = builder.set_attachment_reference(
                AttachmentType::Color,
                vk::AttachmentReference {
                    attachment: index,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                },
            );
        }
        builder.set_attachment_reference(
            AttachmentType::DepthStencil,
            vk::AttachmentReference {
                attachment: 6,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            },
        )
    }

    fn create_pass_resources(
        ctx: Arc<RenderContext>,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<RenderPassResourceManager> {
        let attachment_configs = vec![
            RenderAttachmentConfig::sampled_color(vk::Format::R8G8B8A8_SNORM),
            RenderAttachmentConfig::sampled_color(vk::Format::R32G32B32A32_SFLOAT),
            RenderAttachmentConfig::sampled_color(vk::Format::R32G32B32A32_SFLOAT),
            RenderAttachmentConfig::sampled_color(vk::Format::R32G32B32A32_SFLOAT),
            RenderAttachmentConfig::sampled_color(vk::Format::R32G32B32A32_SFLOAT),
            RenderAttachmentConfig::sampled_color(vk::Format::R32_SFLOAT),
            RenderAttachmentConfig::sampled_depth(vk::Format::D32_SFLOAT),
        ];

        let mut resources =
            RenderPassResourceManager::new(ctx, render_pass, attachment_configs, extent)?;
        for index in 0..6 {
            resources.set_clear_value(
                index,
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 0.0],
                    },
                },
            );
        }
        resources.set_clear_value(
            6,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        );

        Ok(resources)
    }
}

impl Drop for GBufferLayoutPass {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}
