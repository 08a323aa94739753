/*! Top-level renderer: owns the frame core, shader database, descriptor
 * allocator and the pass set, sequences the passes in dependency order each
 * frame and feeds them their shared per-frame resources.
 */

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use crate::{
    camera::{Camera, CameraShaderData},
    context::{RenderContext, SwapchainProperties, VSyncMode},
    descriptor::DescriptorSetAllocator,
    frame::RenderCore,
    passes::{
        CommonResources, DeferredShadingPass, DirectIlluminationPass, GBufferLayoutPass,
        GBufferSamplePass, LodMode, PathTracingPass, PresentPass, RenderMode, RngGenerationPass,
        ScenePass, UiDrawData, UiPass,
    },
    raytracing::{instance_transform, AccelerationStructure, RayTracingContext},
    resource::{BufferResource, BufferResourceDescriptor},
    scene::SceneGraph,
    shader_database::ShaderDatabase,
};
use gpu_allocator::MemoryLocation;

const PASS_RNG: usize = 0;
const PASS_GBUFFER_LAYOUT: usize = 1;
const PASS_GBUFFER_SAMPLE: usize = 2;
const PASS_DIRECT_ILLUMINATION: usize = 3;
const PASS_PATH_TRACING: usize = 4;
const PASS_DEFERRED_SHADING: usize = 5;
const PASS_PRESENT: usize = 6;
const PASS_UI: usize = 7;

/// SPIR-V bytecode for the pass pipelines. Loading the bytes from disk is
/// the caller's responsibility; the core only consumes opaque slices.
pub struct RendererShaders<'a> {
    pub fullscreen_quad_vert: &'a [u8],
    pub rng_gen_comp: &'a [u8],
    pub gbuffer_layout_vert: &'a [u8],
    pub gbuffer_layout_frag: &'a [u8],
    pub gbuffer_sample_frag: &'a [u8],
    pub direct_illumination_rgen: &'a [u8],
    pub direct_illumination_rmiss: &'a [u8],
    pub direct_illumination_rchit: &'a [u8],
    pub path_tracing_rgen: &'a [u8],
    pub path_tracing_rmiss: &'a [u8],
    pub path_tracing_rchit: &'a [u8],
    pub deferred_shading_frag: &'a [u8],
    pub present_frag: &'a [u8],
}

pub struct RendererDescriptor<'a> {
    pub render_mode: RenderMode,
    pub shaders: RendererShaders<'a>,
    /// Pipeline cache blob persisted by a previous run, if any.
    pub pipeline_cache_data: Option<&'a [u8]>,
}

/// Advances the temporal accumulation counter: resets on camera motion,
/// increments while the camera is static.
fn next_sub_frame_index(camera_moved: bool, current: u32) -> u32 {
    if camera_moved {
        0
    } else {
        current.wrapping_add(1)
    }
}

pub struct Renderer {
    passes: Vec<ScenePass>,

    camera_ubos: Vec<BufferResource>,
    prev_camera_ubos: Vec<BufferResource>,
    instance_ssbo: BufferResource,
    material_ssbo: BufferResource,
    blas_list: Vec<AccelerationStructure>,
    tlas_per_slot: Vec<AccelerationStructure>,
    scene: SceneGraph,

    render_mode: RenderMode,
    frame_index: u32,
    sub_frame_index: u32,
    previous_camera_data: CameraShaderData,
    swap_invalidated: Arc<Mutex<Option<SwapchainProperties>>>,

    rt: Arc<RayTracingContext>,
    shader_database: ShaderDatabase,
    descriptor_allocator: DescriptorSetAllocator,
    core: RenderCore,
    ctx: Arc<RenderContext>,
}

impl Renderer {
    pub fn new(
        ctx: Arc<RenderContext>,
        scene: SceneGraph,
        camera: &Camera,
        descriptor: RendererDescriptor,
    ) -> Result<Self> {
        let mut core = RenderCore::new(ctx.clone())?;
        let rt = Arc::new(RayTracingContext::new(&ctx));
        let mut shader_database = ShaderDatabase::new(&ctx, descriptor.pipeline_cache_data)?;
        let mut descriptor_allocator = DescriptorSetAllocator::new(&ctx)?;

        let shaders = &descriptor.shaders;
        let passes = vec![
            ScenePass::RngGen(RngGenerationPass::new(
                ctx.clone(),
                &mut shader_database,
                &mut descriptor_allocator,
                shaders.rng_gen_comp,
            )?),
            ScenePass::GBufferLayout(GBufferLayoutPass::new(
                ctx.clone(),
                &mut shader_database,
                &mut descriptor_allocator,
                shaders.gbuffer_layout_vert,
                shaders.gbuffer_layout_frag,
            )?),
            ScenePass::GBufferSample(GBufferSamplePass::new(
                ctx.clone(),
                &mut shader_database,
                &mut descriptor_allocator,
                shaders.fullscreen_quad_vert,
                shaders.gbuffer_sample_frag,
            )?),
            ScenePass::DirectIllumination(DirectIlluminationPass::new(
                ctx.clone(),
                rt.clone(),
                &mut shader_database,
                &mut descriptor_allocator,
                shaders.direct_illumination_rgen,
                shaders.direct_illumination_rmiss,
                shaders.direct_illumination_rchit,
            )?),
            ScenePass::PathTracing(PathTracingPass::new(
                ctx.clone(),
                rt.clone(),
                &mut shader_database,
                &mut descriptor_allocator,
                shaders.path_tracing_rgen,
                shaders.path_tracing_rmiss,
                shaders.path_tracing_rchit,
            )?),
            ScenePass::DeferredShading(DeferredShadingPass::new(
                ctx.clone(),
                &mut shader_database,
                &mut descriptor_allocator,
                shaders.fullscreen_quad_vert,
                shaders.deferred_shading_frag,
            )?),
            ScenePass::Present(PresentPass::new(
                ctx.clone(),
                &mut shader_database,
                &mut descriptor_allocator,
                shaders.fullscreen_quad_vert,
                shaders.present_frag,
            )?),
            ScenePass::Ui(UiPass::new(ctx.clone())?),
        ];

        let frames_in_flight = RenderCore::frames_in_flight();
        let camera_ubo_size = std::mem::size_of::<CameraShaderData>() as u64;
        let camera_ubos = (0..frames_in_flight)
            .map(|_| {
                ctx.create_buffer(BufferResourceDescriptor::new(
                    camera_ubo_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let prev_camera_ubos = (0..frames_in_flight)
            .map(|_| {
                ctx.create_buffer(BufferResourceDescriptor::new(
                    camera_ubo_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let instance_ssbo = ctx.create_buffer(BufferResourceDescriptor::new(
            scene.instance_buffer_size(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        ))?;
        let material_ssbo = ctx.create_buffer(BufferResourceDescriptor::new(
            scene.material_buffer_size(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        ))?;

        let blas_list = scene
            .meshes
            .iter()
            .map(|mesh| AccelerationStructure::build_blas(&ctx, &rt, mesh))
            .collect::<Result<Vec<_>>>()?;

        let instances = Self::tlas_instance_data(&scene, &blas_list);
        let tlas_per_slot = (0..frames_in_flight)
            .map(|_| AccelerationStructure::build_tlas(&ctx, &rt, &instances))
            .collect::<Result<Vec<_>>>()?;

        let swap_invalidated = Arc::new(Mutex::new(None));
        {
            let invalidated = swap_invalidated.clone();
            core.set_on_swapchain_invalidate(Box::new(move |properties| {
                *invalidated.lock() = Some(*properties);
            }));
        }

        Ok(Self {
            passes,
            camera_ubos,
            prev_camera_ubos,
            instance_ssbo,
            material_ssbo,
            blas_list,
            tlas_per_slot,
            scene,
            render_mode: descriptor.render_mode,
            frame_index: 0,
            sub_frame_index: 0,
            previous_camera_data: camera.shader_data(),
            swap_invalidated,
            rt,
            shader_database,
            descriptor_allocator,
            core,
            ctx,
        })
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    pub fn scene(&self) -> &SceneGraph {
        &self.scene
    }

    /// Mutable access to the active scene. Instance and material counts are
    /// bounded by the buffers sized at construction.
    pub fn scene_mut(&mut self) -> &mut SceneGraph {
        &mut self.scene
    }

    /// The descriptor allocator backing the pass descriptor sets, for
    /// callers that allocate additional sets of their own.
    pub fn descriptor_allocator_mut(&mut self) -> &mut DescriptorSetAllocator {
        &mut self.descriptor_allocator
    }

    /// Switches between hybrid rendering and the path-traced reference mode.
    /// Takes effect on the next frame.
    pub fn set_render_mode(&mut self, render_mode: RenderMode) {
        self.render_mode = render_mode;
    }

    /// Changes the VSync mode; pass resources recreate when the swapchain is
    /// rebuilt. Setting the active mode again does nothing.
    pub fn set_vsync_mode(&mut self, vsync_mode: VSyncMode) -> Result<()> {
        if self.ctx.vsync_mode() == vsync_mode {
            return Ok(());
        }

        self.ctx.set_vsync_mode(vsync_mode)?;
        let extent = self.ctx.swapchain_extent();
        self.recreate_swap_dependent_resources(extent)
    }

    /// The pipeline cache blob, for persisting at shutdown.
    pub fn pipeline_cache_data(&self) -> Result<Vec<u8>> {
        self.shader_database.pipeline_cache_data()
    }

    /// Renders one frame: schedules the frame slot, updates shared per-frame
    /// resources, prepares the passes in dependency order and records them.
    /// Frames hitting an invalidated swapchain are dropped silently.
    pub fn draw_frame(&mut self, camera: &Camera, ui_draw_data: Option<UiDrawData>) -> Result<()> {
        self.core.start_frame()?;

        let invalidated_properties = self.swap_invalidated.lock().take();
        if let Some(properties) = invalidated_properties {
            self.recreate_swap_dependent_resources(properties.extent)?;
        }

        if self.core.is_swapchain_invalid() {
            // The swapchain must be rebuilt before any image can be
            // presented; drop this frame without submission.
            self.core.end_frame()?;
            return Ok(());
        }

        let camera_data = camera.shader_data();
        let camera_moved = camera_data != self.previous_camera_data;
        self.sub_frame_index = next_sub_frame_index(camera_moved, self.sub_frame_index);

        let slot = self.core.active_frame().current_frame_index as usize;
        self.camera_ubos[slot].copy_to_buffer(&[camera_data], 0)?;
        self.prev_camera_ubos[slot].copy_to_buffer(&[self.previous_camera_data], 0)?;
        self.instance_ssbo
            .copy_to_buffer(&self.scene.instance_shader_data(), 0)?;
        self.material_ssbo
            .copy_to_buffer(&self.scene.material_shader_data(), 0)?;

        // The slot's fence has signaled, so its previous TLAS is no longer
        // referenced by in-flight work and can be replaced.
        let instances = Self::tlas_instance_data(&self.scene, &self.blas_list);
        self.tlas_per_slot[slot] = AccelerationStructure::build_tlas(&self.ctx, &self.rt, &instances)?;

        if let Some(draw_data) = ui_draw_data {
            match &mut self.passes[PASS_UI] {
                ScenePass::Ui(pass) => pass.set_draw_data(draw_data)?,
                _ => unreachable!("pass list order is fixed"),
            }
        }

        let render_mode = self.render_mode;
        let frame_index = self.frame_index;
        let sub_frame_index = self.sub_frame_index;

        let Self {
            passes,
            camera_ubos,
            prev_camera_ubos,
            instance_ssbo,
            material_ssbo,
            blas_list,
            tlas_per_slot,
            scene,
            core,
            ..
        } = self;

        let common = CommonResources {
            frame_index,
            sub_frame_index,
            frame_slot_index: slot as u32,
            scene,
            camera_ubo: &camera_ubos[slot],
            prev_camera_ubo: &prev_camera_ubos[slot],
            instance_ssbo,
            material_ssbo,
            blas_list,
            tlas: &tlas_per_slot[slot],
        };

        for pass in passes.iter_mut() {
            if pass.records_in_mode(render_mode) {
                pass.prepare_frame(&common)?;
            }
        }
        Self::wire_pass_inputs(passes, render_mode, slot as u32)?;

        let frame = core.active_frame();
        frame.begin_commands()?;
        for pass in passes.iter_mut() {
            if pass.records_in_mode(render_mode) {
                pass.draw_frame(&frame, &common);
            }
        }
        frame.end_commands()?;

        core.end_frame()?;

        self.frame_index = self.frame_index.wrapping_add(1);
        self.previous_camera_data = camera_data;

        Ok(())
    }

    /// Blocks until all in-flight frames have finished on the GPU.
    pub fn await_all_frames(&self) -> Result<()> {
        for index in 0..RenderCore::frames_in_flight() {
            self.core.await_frame_finished_at(index)?;
        }
        Ok(())
    }

    /// Threads the producing passes' attachment views into the consuming
    /// passes' input descriptors for this frame.
    fn wire_pass_inputs(
        passes: &mut [ScenePass],
        render_mode: RenderMode,
        frame_slot_index: u32,
    ) -> Result<()> {
        let rng_view = match &passes[PASS_RNG] {
            ScenePass::RngGen(pass) => pass.rng_source.view(),
            _ => unreachable!("pass list order is fixed"),
        };
        let (far_views, near_views) = match &passes[PASS_GBUFFER_LAYOUT] {
            ScenePass::GBufferLayout(pass) => (
                pass.attachment_views(LodMode::Far),
                pass.attachment_views(LodMode::Near),
            ),
            _ => unreachable!("pass list order is fixed"),
        };

        let sampled_views = match &mut passes[PASS_GBUFFER_SAMPLE] {
            ScenePass::GBufferSample(pass) => {
                pass.prepare_inputs(frame_slot_index, rng_view, &far_views, &near_views)?;
                pass.attachment_views()
            }
            _ => unreachable!("pass list order is fixed"),
        };

        let final_color_view = match render_mode {
            RenderMode::Hybrid => {
                let illumination_view = match &mut passes[PASS_DIRECT_ILLUMINATION] {
                    ScenePass::DirectIllumination(pass) => {
                        pass.prepare_inputs(frame_slot_index, &sampled_views)?;
                        pass.render_result.view()
                    }
                    _ => unreachable!("pass list order is fixed"),
                };
                match &mut passes[PASS_DEFERRED_SHADING] {
                    ScenePass::DeferredShading(pass) => {
                        pass.prepare_inputs(frame_slot_index, &sampled_views, illumination_view)?;
                        pass.render_result_view()
                    }
                    _ => unreachable!("pass list order is fixed"),
                }
            }
            RenderMode::PathTraced => match &passes[PASS_PATH_TRACING] {
                ScenePass::PathTracing(pass) => pass.render_result_view(),
                _ => unreachable!("pass list order is fixed"),
            },
        };

        match &mut passes[PASS_PRESENT] {
            ScenePass::Present(pass) => pass.prepare_inputs(frame_slot_index, final_color_view)?,
            _ => unreachable!("pass list order is fixed"),
        }

        Ok(())
    }

    /// Recreates every size-dependent pass resource in dependency order
    /// after the swapchain was rebuilt.
    fn recreate_swap_dependent_resources(&mut self, extent: vk::Extent2D) -> Result<()> {
        log::debug!(
            "Recreating pass resources at {} x {}",
            extent.width,
            extent.height
        );

        for pass in self.passes.iter_mut() {
            pass.recreate_resources(extent)?;
        }

        Ok(())
    }

    fn tlas_instance_data(
        scene: &SceneGraph,
        blas_list: &[AccelerationStructure],
    ) -> Vec<vk::AccelerationStructureInstanceKHR> {
        scene
            .instances
            .iter()
            .enumerate()
            .map(|(index, instance)| vk::AccelerationStructureInstanceKHR {
                transform: instance_transform(&instance.model_matrix),
                instance_custom_index_and_mask: vk::Packed24_8::new(index as u32, 0xFF),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    0,
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: blas_list[instance.mesh_lod_near as usize].device_address(),
                },
            })
            .collect()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Await all in-flight frames before any shared resource is dropped.
        for index in 0..RenderCore::frames_in_flight() {
            let _ = self.core.await_frame_finished_at(index);
        }

        // Drop the passes in reverse dependency order; the remaining fields
        // (shader database, descriptor allocator, core, context) follow in
        // declaration order.
        while self.passes.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_frame_index_accumulates_while_static() {
        let mut sub_frame = 0;
        for expected in 1..32 {
            sub_frame = next_sub_frame_index(false, sub_frame);
            assert_eq!(sub_frame, expected);
        }
    }

    #[test]
    fn test_sub_frame_index_resets_on_motion() {
        let mut sub_frame = 0;
        for _ in 0..8 {
            sub_frame = next_sub_frame_index(false, sub_frame);
        }
        assert_eq!(sub_frame, 8);

        sub_frame = next_sub_frame_index(true, sub_frame);
        assert_eq!(sub_frame, 0);

        // Accumulation restarts once the camera settles again.
        sub_frame = next_sub_frame_index(false, sub_frame);
        assert_eq!(sub_frame, 1);
    }
}
