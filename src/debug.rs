/*! Debug-utils helpers for annotating recorded command ranges. */

use std::ffi::CString;

use ash::{ext::debug_utils, vk};

use crate::context::RenderContext;

/// Wraps a pass's recorded commands in debug-utils labels so captures group
/// them per pass.
pub struct DebugLabelHandler {
    device: debug_utils::Device,
}

impl DebugLabelHandler {
    pub fn new(ctx: &RenderContext) -> Self {
        Self {
            device: ctx.shared.debug_utils_device.clone(),
        }
    }

    pub fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, name: &str) {
        let name = CString::new(name).unwrap();
        let label = vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str());
        unsafe {
            self.device.cmd_begin_debug_utils_label(command_buffer, &label);
        }
    }

    pub fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_end_debug_utils_label(command_buffer);
        }
    }
}
