/*! Frame-in-flight state machine and command submission protocol. The render
 * core rotates FRAMES_IN_FLIGHT frame slots, each with its own fence,
 * semaphore pair and command pool, and reacts to swapchain invalidation by
 * deferred recreation at the start of the next frame.
 */

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::context::{RenderContext, SwapchainProperties};

/// Number of frame slots rotated by the render core.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Callback invoked on the host thread inside `start_frame` after the
/// swapchain has been rebuilt and before the frame proceeds.
pub type OnSwapchainInvalidateFn = Box<dyn FnMut(&SwapchainProperties)>;

/// Outcome of a swapchain acquire or present operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapchainState {
    Success,
    Suboptimal,
    OutOfDate,
}

impl SwapchainState {
    /// Classifies a swapchain operation result. Out-of-date and suboptimal
    /// surfaces are recoverable; any other non-success result is fatal.
    fn classify(result: vk::Result) -> Result<Self> {
        match result {
            vk::Result::SUCCESS => Ok(Self::Success),
            vk::Result::SUBOPTIMAL_KHR => Ok(Self::Suboptimal),
            vk::Result::ERROR_OUT_OF_DATE_KHR => Ok(Self::OutOfDate),
            other => Err(anyhow::anyhow!("Fatal swapchain operation result: {other}")),
        }
    }

    fn requires_recreation(self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Advances a frame slot index modulo FRAMES_IN_FLIGHT.
fn next_frame_index(current: usize) -> usize {
    (current + 1) % FRAMES_IN_FLIGHT
}

/// Per-slot synchronization and command state.
struct FrameState {
    frame_ready: vk::Fence,
    image_available: vk::Semaphore,
    rendering_finished: vk::Semaphore,
    graphics_command_pool: vk::CommandPool,
    graphics_command_buffer: vk::CommandBuffer,
}

impl FrameState {
    fn new(ctx: &RenderContext) -> Result<Self> {
        let device = ctx.device();

        // The fence starts signaled so the first wait on a fresh slot passes.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let frame_ready = unsafe { device.create_fence(&fence_info, None)? };

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None)? };
        let rendering_finished = unsafe { device.create_semaphore(&semaphore_info, None)? };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.queues.graphics.family_index);
        let graphics_command_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(graphics_command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let graphics_command_buffer =
            unsafe { device.allocate_command_buffers(&allocate_info)?[0] };

        Ok(Self {
            frame_ready,
            image_available,
            rendering_finished,
            graphics_command_pool,
            graphics_command_buffer,
        })
    }

    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            // Never destroy a slot whose submission may still be running.
            let _ = device.wait_for_fences(&[self.frame_ready], true, u64::MAX);

            device.destroy_fence(self.frame_ready, None);
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.rendering_finished, None);
            device.destroy_command_pool(self.graphics_command_pool, None);
        }
    }
}

/// Frame state relevant for recording graphics commands. Valid only between
/// `start_frame` and `end_frame`.
pub struct ActiveFrame {
    pub active_swap_image_index: u32,
    pub current_frame_index: u32,
    pub command_buffer: vk::CommandBuffer,
    device: ash::Device,
}

impl ActiveFrame {
    pub fn begin_commands(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)?;
        }
        Ok(())
    }

    pub fn end_commands(&self) -> Result<()> {
        unsafe {
            self.device.end_command_buffer(self.command_buffer)?;
        }
        Ok(())
    }

    /// Inserts a global memory pipeline barrier in the frame.
    pub fn pipeline_barrier(
        &self,
        memory_barriers: &[vk::MemoryBarrier2],
        flags: vk::DependencyFlags,
    ) {
        let dependency_info = vk::DependencyInfo::default()
            .dependency_flags(flags)
            .memory_barriers(memory_barriers);
        unsafe {
            self.device
                .cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
    }

    /// Inserts image layout transition barriers in the frame.
    pub fn pipeline_image_barrier(
        &self,
        image_memory_barriers: &[vk::ImageMemoryBarrier2],
        flags: vk::DependencyFlags,
    ) {
        let dependency_info = vk::DependencyInfo::default()
            .dependency_flags(flags)
            .image_memory_barriers(image_memory_barriers);
        unsafe {
            self.device
                .cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
    }

    pub(crate) fn set_viewport_scissor(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport::default()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let scissor = vk::Rect2D::default()
            .offset(vk::Offset2D { x: 0, y: 0 })
            .extent(extent);

        unsafe {
            self.device
                .cmd_set_viewport(self.command_buffer, 0, std::slice::from_ref(&viewport));
            self.device
                .cmd_set_scissor(self.command_buffer, 0, std::slice::from_ref(&scissor));
        }
    }
}

/// The render core handles frame state and work submission: it tracks frame
/// slots, acquires swap images, submits recorded command buffers and presents,
/// and reacts to out-of-date or suboptimal surfaces by deferred swapchain
/// recreation.
pub struct RenderCore {
    frames: Vec<FrameState>,
    previous_frame: usize,
    current_frame: usize,
    active_swap_image: u32,
    recreate_swapchain: bool,
    on_swapchain_invalidate: Option<OnSwapchainInvalidateFn>,
    ctx: Arc<RenderContext>,
}

impl RenderCore {
    pub fn new(ctx: Arc<RenderContext>) -> Result<Self> {
        let frames = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameState::new(&ctx))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            frames,
            previous_frame: 0,
            current_frame: 0,
            active_swap_image: 0,
            recreate_swapchain: false,
            on_swapchain_invalidate: None,
            ctx,
        })
    }

    pub const fn frames_in_flight() -> usize {
        FRAMES_IN_FLIGHT
    }

    /// Starts a new frame: waits for the slot to become ready, performs any
    /// deferred swapchain recreation, and acquires the next swap image. A
    /// zero-extent surface (minimized window) skips acquisition and leaves
    /// the recreate flag set so the loop stays stable.
    pub fn start_frame(&mut self) -> Result<()> {
        let device = self.ctx.device();
        let frame = &self.frames[self.current_frame];

        unsafe {
            device.wait_for_fences(&[frame.frame_ready], true, u64::MAX)?;
        }

        if self.recreate_swapchain {
            let surface_extent = self.ctx.surface_extent()?;
            if surface_extent.width == 0 || surface_extent.height == 0 {
                return Ok(());
            }

            self.ctx.recreate_swapchain()?;

            let properties = self.ctx.swapchain_properties();
            if let Some(callback) = &mut self.on_swapchain_invalidate {
                callback(&properties);
            }
            self.recreate_swapchain = false;
        } else {
            let surface_extent = self.ctx.surface_extent()?;
            if surface_extent.width == 0 || surface_extent.height == 0 {
                self.recreate_swapchain = true;
                return Ok(());
            }
        }

        let acquire_result = self
            .ctx
            .swapchain
            .lock()
            .acquire_next_image(frame.image_available);

        let state = match acquire_result {
            Ok((image_index, suboptimal)) => {
                self.active_swap_image = image_index;
                if suboptimal {
                    SwapchainState::Suboptimal
                } else {
                    SwapchainState::Success
                }
            }
            Err(result) => SwapchainState::classify(result)?,
        };

        if state.requires_recreation() {
            self.recreate_swapchain = true;
        }

        Ok(())
    }

    /// Ends the currently active frame, submitting recorded work to the GPU
    /// and presenting the swap image. When the recreate flag is set the frame
    /// is dropped without submission.
    pub fn end_frame(&mut self) -> Result<()> {
        if self.recreate_swapchain {
            return Ok(());
        }

        let device = self.ctx.device();
        let frame = &self.frames[self.current_frame];

        unsafe {
            device.reset_fences(&[frame.frame_ready])?;
        }

        let wait_semaphore_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.image_available)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let signal_semaphore_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.rendering_finished)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let command_buffer_info =
            vk::CommandBufferSubmitInfo::default().command_buffer(frame.graphics_command_buffer);

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(std::slice::from_ref(&wait_semaphore_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_semaphore_info))
            .command_buffer_infos(std::slice::from_ref(&command_buffer_info));

        unsafe {
            device.queue_submit2(
                self.ctx.queues.graphics.raw,
                std::slice::from_ref(&submit_info),
                frame.frame_ready,
            )?;
        }

        let present_result = self.ctx.swapchain.lock().queue_present(
            self.ctx.queues.present.raw,
            &[frame.rendering_finished],
            self.active_swap_image,
        );

        let state = match present_result {
            Ok(suboptimal) => {
                if suboptimal {
                    SwapchainState::Suboptimal
                } else {
                    SwapchainState::Success
                }
            }
            Err(result) => SwapchainState::classify(result)?,
        };
        if state.requires_recreation() {
            self.recreate_swapchain = true;
        }

        self.previous_frame = self.current_frame;
        self.current_frame = next_frame_index(self.current_frame);

        Ok(())
    }

    /// Whether the swapchain is pending recreation; when set the current
    /// frame must be dropped without recording.
    pub fn is_swapchain_invalid(&self) -> bool {
        self.recreate_swapchain
    }

    /// The currently active frame's data.
    pub fn active_frame(&self) -> ActiveFrame {
        let frame = &self.frames[self.current_frame];
        ActiveFrame {
            active_swap_image_index: self.active_swap_image,
            current_frame_index: self.current_frame as u32,
            command_buffer: frame.graphics_command_buffer,
            device: self.ctx.device().clone(),
        }
    }

    /// Awaits the finish of the last submitted frame.
    pub fn await_frame_finished(&self) -> Result<()> {
        self.await_frame_finished_at(self.previous_frame)
    }

    /// Awaits the finish of a specific frame slot.
    pub fn await_frame_finished_at(&self, index: usize) -> Result<()> {
        assert!(index < FRAMES_IN_FLIGHT);

        unsafe {
            self.ctx
                .device()
                .wait_for_fences(&[self.frames[index].frame_ready], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Registers a callback for swapchain invalidation, returning the
    /// previously registered callback if any.
    pub fn set_on_swapchain_invalidate(
        &mut self,
        callback: OnSwapchainInvalidateFn,
    ) -> Option<OnSwapchainInvalidateFn> {
        self.on_swapchain_invalidate.replace(callback)
    }
}

impl Drop for RenderCore {
    fn drop(&mut self) {
        let device = self.ctx.device().clone();
        for frame in &mut self.frames {
            frame.destroy(&device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_swapchain_results() {
        assert_eq!(
            SwapchainState::classify(vk::Result::SUCCESS).unwrap(),
            SwapchainState::Success
        );
        assert_eq!(
            SwapchainState::classify(vk::Result::SUBOPTIMAL_KHR).unwrap(),
            SwapchainState::Suboptimal
        );
        assert_eq!(
            SwapchainState::classify(vk::Result::ERROR_OUT_OF_DATE_KHR).unwrap(),
            SwapchainState::OutOfDate
        );
        assert!(SwapchainState::classify(vk::Result::ERROR_DEVICE_LOST).is_err());
    }

    #[test]
    fn test_recreation_required_states() {
        assert!(!SwapchainState::Success.requires_recreation());
        assert!(SwapchainState::Suboptimal.requires_recreation());
        assert!(SwapchainState::OutOfDate.requires_recreation());
    }

    #[test]
    fn test_frame_index_cycles_through_slots() {
        let mut index = 0;
        let mut visited = Vec::new();
        for _ in 0..FRAMES_IN_FLIGHT * 3 {
            visited.push(index);
            index = next_frame_index(index);
        }

        // Every slot is visited exactly once per cycle, in order.
        for (i, slot) in visited.iter().enumerate() {
            assert_eq!(*slot, i % FRAMES_IN_FLIGHT);
        }
        assert!(visited.iter().all(|slot| *slot < FRAMES_IN_FLIGHT));
    }
}
