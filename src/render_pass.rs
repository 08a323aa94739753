/*! Render pass construction and the per-pass attachment resource managers.
 * The offscreen manager owns its attachment images; the swapchain manager
 * binds to swap views and rebuilds its framebuffers on invalidation.
 */

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    context::RenderContext,
    frame::ActiveFrame,
    resource::{ImageResource, ImageResourceDescriptor},
};

#[derive(Debug, Clone, Copy)]
pub enum AttachmentType {
    Color,
    DepthStencil,
}

#[derive(Clone, Default)]
struct SubpassData {
    color_attachments: Vec<vk::AttachmentReference>,
    depth_stencil_attachment: Option<vk::AttachmentReference>,
}

/// Fluent builder for render passes: attachment list, per-subpass attachment
/// references, subpasses. `build` consumes the builder.
#[derive(Clone)]
pub struct RenderPassBuilder {
    attachments: Vec<vk::AttachmentDescription>,
    subpasses: Vec<SubpassData>,
}

impl RenderPassBuilder {
    pub fn new() -> Self {
        Self {
            attachments: Vec::new(),
            // The first subpass is always present.
            subpasses: vec![SubpassData::default()],
        }
    }

    pub fn add_attachment(
        self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        final_layout: vk::ImageLayout,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
    ) -> Self {
        self.add_attachment_full(
            format,
            samples,
            final_layout,
            load_op,
            store_op,
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_attachment_full(
        mut self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        final_layout: vk::ImageLayout,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        stencil_load_op: vk::AttachmentLoadOp,
        stencil_store_op: vk::AttachmentStoreOp,
        initial_layout: vk::ImageLayout,
    ) -> Self {
        self.attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(samples)
                .load_op(load_op)
                .store_op(store_op)
                .stencil_load_op(stencil_load_op)
                .stencil_store_op(stencil_store_op)
                .initial_layout(initial_layout)
                .final_layout(final_layout),
        );
        self
    }

    pub fn next_subpass(mut self) -> Self {
        self.subpasses.push(SubpassData::default());
        self
    }

    pub fn set_attachment_reference(
        mut self,
        attachment_type: AttachmentType,
        reference: vk::AttachmentReference,
    ) -> Self {
        let current_subpass = self.subpasses.last_mut().unwrap();
        match attachment_type {
            AttachmentType::Color => current_subpass.color_attachments.push(reference),
            AttachmentType::DepthStencil => {
                current_subpass.depth_stencil_attachment = Some(reference)
            }
        }
        self
    }

    pub fn build(self, ctx: &RenderContext) -> Result<vk::RenderPass> {
        let subpasses = self
            .subpasses
            .iter()
            .map(|subpass| {
                let mut description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&subpass.color_attachments);
                if let Some(depth_stencil) = &subpass.depth_stencil_attachment {
                    description = description.depth_stencil_attachment(depth_stencil);
                }
                description
            })
            .collect::<Vec<_>>();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&self.attachments)
            .subpasses(&subpasses);

        let render_pass = unsafe { ctx.device().create_render_pass(&create_info, None)? };
        Ok(render_pass)
    }
}

impl Default for RenderPassBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of a single offscreen attachment.
#[derive(Debug, Clone, Copy)]
pub struct RenderAttachmentConfig {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl RenderAttachmentConfig {
    pub fn new(
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            usage,
            aspect,
        }
    }

    pub fn sampled_color(format: vk::Format) -> Self {
        Self::new(
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )
    }

    pub fn sampled_depth(format: vk::Format) -> Self {
        Self::new(
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
        )
    }
}

/// Owns a render pass, the attachment images matching its configuration, a
/// framebuffer and the clear values used when the pass begins. Recreatable at
/// a new extent; the render pass itself is preserved across recreation.
pub struct RenderPassResourceManager {
    render_pass: vk::RenderPass,
    attachment_configs: Vec<RenderAttachmentConfig>,
    attachments: Vec<ImageResource>,
    framebuffer: vk::Framebuffer,
    clear_values: Vec<vk::ClearValue>,
    extent: vk::Extent2D,
    ctx: Arc<RenderContext>,
}

impl RenderPassResourceManager {
    pub fn new(
        ctx: Arc<RenderContext>,
        render_pass: vk::RenderPass,
        attachment_configs: Vec<RenderAttachmentConfig>,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let (attachments, framebuffer) =
            Self::create_attachments(&ctx, render_pass, &attachment_configs, extent)?;
        let clear_values = vec![vk::ClearValue::default(); attachment_configs.len()];

        Ok(Self {
            render_pass,
            attachment_configs,
            attachments,
            framebuffer,
            clear_values,
            extent,
            ctx,
        })
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn set_clear_value(&mut self, attachment_index: usize, clear_value: vk::ClearValue) {
        self.clear_values[attachment_index] = clear_value;
    }

    pub fn attachment(&self, index: usize) -> &ImageResource {
        &self.attachments[index]
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Begins the render pass: binds the framebuffer, issues load ops with
    /// the stored clear values and sets dynamic viewport/scissor state to the
    /// attachment extent.
    pub fn begin_render_pass(&self, frame: &ActiveFrame) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(&self.clear_values);

        unsafe {
            self.ctx.device().cmd_begin_render_pass(
                frame.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        frame.set_viewport_scissor(self.extent);
    }

    pub fn end_render_pass(&self, frame: &ActiveFrame) {
        unsafe {
            self.ctx.device().cmd_end_render_pass(frame.command_buffer);
        }
    }

    /// Drops and rebuilds images, views and the framebuffer at a new extent.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        unsafe {
            self.ctx.device().destroy_framebuffer(self.framebuffer, None);
        }
        self.attachments.clear();

        let (attachments, framebuffer) = Self::create_attachments(
            &self.ctx,
            self.render_pass,
            &self.attachment_configs,
            extent,
        )?;
        self.attachments = attachments;
        self.framebuffer = framebuffer;
        self.extent = extent;

        Ok(())
    }

    fn create_attachments(
        ctx: &RenderContext,
        render_pass: vk::RenderPass,
        configs: &[RenderAttachmentConfig],
        extent: vk::Extent2D,
    ) -> Result<(Vec<ImageResource>, vk::Framebuffer)> {
        let attachments = configs
            .iter()
            .map(|config| {
                let mut image = ctx.create_image(ImageResourceDescriptor {
                    samples: config.samples,
                    ..ImageResourceDescriptor::new_2d(extent, config.format, config.usage)
                })?;
                image.create_view(
                    vk::ImageViewType::TYPE_2D,
                    ImageResource::default_component_mapping(),
                    ImageResource::subresource_range(config.aspect),
                )?;
                Ok(image)
            })
            .collect::<Result<Vec<_>>>()?;

        let views = attachments
            .iter()
            .map(|attachment| attachment.view())
            .collect::<Vec<_>>();

        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { ctx.device().create_framebuffer(&framebuffer_info, None)? };

        Ok((attachments, framebuffer))
    }
}

impl Drop for RenderPassResourceManager {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_framebuffer(self.framebuffer, None);
            self.ctx.device().destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Owns a render pass plus one framebuffer per swap image. On swapchain
/// invalidation the framebuffers are rebuilt from the new swap views.
pub struct SwapchainPassResourceManager {
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    clear_values: Vec<vk::ClearValue>,
    extent: vk::Extent2D,
    ctx: Arc<RenderContext>,
}

impl SwapchainPassResourceManager {
    pub fn new(ctx: Arc<RenderContext>, render_pass: vk::RenderPass) -> Result<Self> {
        let (framebuffers, extent) = Self::create_framebuffers(&ctx, render_pass)?;

        Ok(Self {
            render_pass,
            framebuffers,
            clear_values: vec![vk::ClearValue::default()],
            extent,
            ctx,
        })
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn set_clear_value(&mut self, attachment_index: usize, clear_value: vk::ClearValue) {
        if self.clear_values.len() <= attachment_index {
            self.clear_values
                .resize(attachment_index + 1, vk::ClearValue::default());
        }
        self.clear_values[attachment_index] = clear_value;
    }

    /// Begins the render pass over the swap image acquired for this frame.
    pub fn begin_render_pass(&self, frame: &ActiveFrame) {
        let framebuffer = self.framebuffers[frame.active_swap_image_index as usize];

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(&self.clear_values);

        unsafe {
            self.ctx.device().cmd_begin_render_pass(
                frame.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        frame.set_viewport_scissor(self.extent);
    }

    pub fn end_render_pass(&self, frame: &ActiveFrame) {
        unsafe {
            self.ctx.device().cmd_end_render_pass(frame.command_buffer);
        }
    }

    /// Destroys and rebuilds the framebuffers from the current swap views.
    pub fn recreate(&mut self) -> Result<()> {
        self.destroy_framebuffers();

        let (framebuffers, extent) = Self::create_framebuffers(&self.ctx, self.render_pass)?;
        self.framebuffers = framebuffers;
        self.extent = extent;

        Ok(())
    }

    fn create_framebuffers(
        ctx: &RenderContext,
        render_pass: vk::RenderPass,
    ) -> Result<(Vec<vk::Framebuffer>, vk::Extent2D)> {
        let swapchain = ctx.swapchain.lock();
        let extent = swapchain.extent;

        let framebuffers = swapchain
            .image_views_raw
            .iter()
            .map(|view| {
                let framebuffer_info = vk::FramebufferCreateInfo::default()
                    .render_pass(render_pass)
                    .attachments(std::slice::from_ref(view))
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                Ok(unsafe { ctx.device().create_framebuffer(&framebuffer_info, None)? })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((framebuffers, extent))
    }

    fn destroy_framebuffers(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.ctx.device().destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

impl Drop for SwapchainPassResourceManager {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        unsafe {
            self.ctx.device().destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pass_builder_accumulates_state() {
        let builder = RenderPassBuilder::new()
            .add_attachment(
                vk::Format::R8G8B8A8_SNORM,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
            )
            .add_attachment(
                vk::Format::D32_SFLOAT,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
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
            .set_attachment_reference(
                AttachmentType::DepthStencil,
                vk::AttachmentReference {
                    attachment: 1,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                },
            );

        assert_eq!(builder.attachments.len(), 2);
        assert_eq!(builder.subpasses.len(), 1);
        assert_eq!(builder.subpasses[0].color_attachments.len(), 1);
        assert!(builder.subpasses[0].depth_stencil_attachment.is_some());

        let builder = builder.next_subpass();
        assert_eq!(builder.subpasses.len(), 2);
        assert!(builder.subpasses[1].color_attachments.is_empty());
    }

    #[test]
    fn test_attachment_defaults_keep_stencil_dont_care() {
        let builder = RenderPassBuilder::new().add_attachment(
            vk::Format::B8G8R8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
        );

        let attachment = builder.attachments[0];
        assert_eq!(attachment.stencil_load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(attachment.stencil_store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::UNDEFINED);
    }
}
