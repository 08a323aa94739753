//! UI overlay pass: loads the swap image after the present pass and records
//! the egui draw list over it, transitioning to the present layout.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use egui_ash_renderer::{Options, Renderer};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::{
    context::RenderContext,
    debug::DebugLabelHandler,
    frame::ActiveFrame,
    passes::CommonResources,
    render_pass::{AttachmentType, RenderPassBuilder, SwapchainPassResourceManager},
};

/// One frame's UI output, handed to the renderer by the application.
pub struct UiDrawData {
    pub pixels_per_point: f32,
    pub primitives: Vec<egui::ClippedPrimitive>,
    pub textures_delta: egui::TexturesDelta,
}

pub struct UiPass {
    pub pass_resources: SwapchainPassResourceManager,
    renderer: Renderer,
    draw_data: Option<UiDrawData>,
    texture_command_pool: vk::CommandPool,
    debug: DebugLabelHandler,
    ctx: Arc<RenderContext>,
}

impl UiPass {
    pub fn new(ctx: Arc<RenderContext>) -> Result<Self> {
        // Loads the already-presented color output; stores it ready for
        // presentation.
        let render_pass = RenderPassBuilder::new()
            .add_attachment_full(
                ctx.swapchain_format(),
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AttachmentLoadOp::LOAD,
                vk::AttachmentStoreOp::STORE,
                vk::AttachmentLoadOp::DONT_CARE,
                vk::AttachmentStoreOp::DONT_CARE,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )
            .set_attachment_reference(
                AttachmentType::Color,
                vk::AttachmentReference {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                },
            )
            .build(&ctx)?;

        let pass_resources = SwapchainPassResourceManager::new(ctx.clone(), render_pass)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.shared.instance.raw.clone(),
            device: ctx.shared.raw.clone(),
            physical_device: ctx.shared.physical_device.raw,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let renderer = Renderer::with_gpu_allocator(
            Arc::new(Mutex::new(allocator)),
            ctx.shared.raw.clone(),
            pass_resources.render_pass(),
            Options {
                srgb_framebuffer: true,
                ..Default::default()
            },
        )?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(ctx.queues.graphics.family_index);
        let texture_command_pool = unsafe { ctx.device().create_command_pool(&pool_info, None)? };

        Ok(Self {
            pass_resources,
            renderer,
            draw_data: None,
            texture_command_pool,
            debug: DebugLabelHandler::new(&ctx),
            ctx,
        })
    }

    /// Stores the UI draw list for the coming frame and applies any texture
    /// changes it carries.
    pub fn set_draw_data(&mut self, draw_data: UiDrawData) -> Result<()> {
        if !draw_data.textures_delta.set.is_empty() {
            self.renderer.set_textures(
                self.ctx.queues.graphics.raw,
                self.texture_command_pool,
                &draw_data.textures_delta.set,
            )?;
        }
        if !draw_data.textures_delta.free.is_empty() {
            self.renderer
                .free_textures(&draw_data.textures_delta.free)?;
        }

        self.draw_data = Some(draw_data);
        Ok(())
    }

    pub fn draw_frame(&mut self, frame: &ActiveFrame, _common: &CommonResources) {
        self.pass_resources.begin_render_pass(frame);
        self.debug.cmd_begin_label(frame.command_buffer, "UI pass");

        if let Some(draw_data) = &self.draw_data {
            if let Err(error) = self.renderer.cmd_draw(
                frame.command_buffer,
                self.ctx.swapchain_extent(),
                draw_data.pixels_per_point,
                &draw_data.primitives,
            ) {
                log::error!("UI draw failed: {error}");
            }
        }

        self.debug.cmd_end_label(frame.command_buffer);
        self.pass_resources.end_render_pass(frame);
    }

    pub fn recreate_resources(&mut self) -> Result<()> {
        self.pass_resources.recreate()
    }
}

impl Drop for UiPass {
    fn drop(&mut self) {
        unsafe {
            self.ctx
                .device()
                .destroy_command_pool(self.texture_command_pool, None);
        }
    }
}
