/*! The render pass set. Every pass implements the same per-frame contract:
 * `prepare_frame` runs before command recording and flushes descriptor
 * writes, `draw_frame` records commands into the active frame. Passes do not
 * share mutable state; cross-pass information flows through
 * [`CommonResources`] or through image layout transitions observable to the
 * next pass.
 */

use anyhow::Result;
use ash::vk;

use crate::{
    frame::ActiveFrame,
    raytracing::AccelerationStructure,
    resource::BufferResource,
    scene::SceneGraph,
};

mod deferred_shading;
mod direct_illumination;
mod gbuffer_layout;
mod gbuffer_sample;
mod path_tracing;
mod present;
mod rng;
mod ui;

pub use deferred_shading::DeferredShadingPass;
pub use direct_illumination::DirectIlluminationPass;
pub use gbuffer_layout::{GBufferLayoutPass, LodMode};
pub use gbuffer_sample::GBufferSamplePass;
pub use path_tracing::PathTracingPass;
pub use present::PresentPass;
pub use rng::RngGenerationPass;
pub use ui::{UiDrawData, UiPass};

/// Which passes record in a frame: hybrid rendering (direct illumination +
/// deferred shading) or the path-traced reference mode. The modes are
/// mutually exclusive within one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Hybrid,
    PathTraced,
}

/// Common render resources shared by all passes for one frame.
pub struct CommonResources<'a> {
    pub frame_index: u32,
    pub sub_frame_index: u32,
    /// The active frame slot, indexing per-slot descriptor sets and buffers.
    pub frame_slot_index: u32,
    pub scene: &'a SceneGraph,
    pub camera_ubo: &'a BufferResource,
    pub prev_camera_ubo: &'a BufferResource,
    pub instance_ssbo: &'a BufferResource,
    pub material_ssbo: &'a BufferResource,
    pub blas_list: &'a [AccelerationStructure],
    pub tlas: &'a AccelerationStructure,
}

impl CommonResources<'_> {
    pub(crate) fn buffer_info(buffer: &BufferResource) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(buffer.raw())
            .offset(0)
            .range(buffer.size())
    }
}

/// Reinterprets a push constant struct as the byte slice handed to the
/// pipeline. `T` must be `#[repr(C)]` without padding requirements beyond
/// its fields.
pub(crate) fn push_constant_bytes<T: Copy>(data: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts((data as *const T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

/// The statically known pass list as a tagged variant, dispatching the
/// prepare/draw contract without a vtable.
pub enum ScenePass {
    RngGen(RngGenerationPass),
    GBufferLayout(GBufferLayoutPass),
    GBufferSample(GBufferSamplePass),
    DirectIllumination(DirectIlluminationPass),
    PathTracing(PathTracingPass),
    DeferredShading(DeferredShadingPass),
    Present(PresentPass),
    Ui(UiPass),
}

impl ScenePass {
    /// Runs once per frame before command recording begins.
    pub fn prepare_frame(&mut self, common: &CommonResources) -> Result<()> {
        match self {
            Self::RngGen(pass) => pass.prepare_frame(common),
            Self::GBufferLayout(pass) => pass.prepare_frame(common),
            Self::GBufferSample(_) => Ok(()),
            Self::DirectIllumination(pass) => pass.prepare_frame(common),
            Self::PathTracing(pass) => pass.prepare_frame(common),
            Self::DeferredShading(_) => Ok(()),
            Self::Present(_) => Ok(()),
            Self::Ui(_) => Ok(()),
        }
    }

    /// Records the pass's commands into the active frame.
    pub fn draw_frame(&mut self, frame: &ActiveFrame, common: &CommonResources) {
        match self {
            Self::RngGen(pass) => pass.draw_frame(frame, common),
            Self::GBufferLayout(pass) => pass.draw_frame(frame, common),
            Self::GBufferSample(pass) => pass.draw_frame(frame, common),
            Self::DirectIllumination(pass) => pass.draw_frame(frame, common),
            Self::PathTracing(pass) => pass.draw_frame(frame, common),
            Self::DeferredShading(pass) => pass.draw_frame(frame, common),
            Self::Present(pass) => pass.draw_frame(frame, common),
            Self::Ui(pass) => pass.draw_frame(frame, common),
        }
    }

    /// Rebuilds size-dependent pass resources after swapchain invalidation.
    pub fn recreate_resources(&mut self, extent: vk::Extent2D) -> Result<()> {
        match self {
            Self::RngGen(pass) => pass.recreate_resources(extent),
            Self::GBufferLayout(pass) => pass.recreate_resources(extent),
            Self::GBufferSample(pass) => pass.recreate_resources(extent),
            Self::DirectIllumination(pass) => pass.recreate_resources(extent),
            Self::PathTracing(pass) => pass.recreate_resources(extent),
            Self::DeferredShading(pass) => pass.recreate_resources(extent),
            Self::Present(pass) => pass.recreate_resources(),
            Self::Ui(pass) => pass.recreate_resources(),
        }
    }

    /// Whether this pass records commands in the given render mode.
    pub fn records_in_mode(&self, mode: RenderMode) -> bool {
        match self {
            Self::DirectIllumination(_) | Self::DeferredShading(_) => mode == RenderMode::Hybrid,
            Self::PathTracing(_) => mode == RenderMode::PathTraced,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constant_bytes_layout() {
        #[repr(C)]
        #[derive(Clone, Copy)]
        struct PushConstants {
            a: u32,
            b: u32,
        }

        let data = PushConstants {
            a: 0x04030201,
            b: 0x08070605,
        };
        let bytes = push_constant_bytes(&data);
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0..4], [1, 2, 3, 4]);
        assert_eq!(bytes[4..8], [5, 6, 7, 8]);
    }
}
