/*! Hotaru graphics — a GPU-driven hybrid renderer core.
 *
 * Combines rasterized G-buffer generation at two levels of detail with
 * hardware ray tracing for direct illumination, plus a path-traced
 * reference mode. The crate owns the per-frame scheduler, GPU resources,
 * descriptor and pipeline state, and the dependency-ordered pass set;
 * window systems, asset loading and UI state live with the embedding
 * application.
 */

pub mod camera;
pub mod context;
pub mod debug;
pub mod descriptor;
pub mod frame;
pub mod passes;
pub mod raytracing;
pub mod render_pass;
pub mod renderer;
pub mod resource;
pub mod scene;
pub mod shader_database;

/// External dependencies exposed outside of the current crate.
pub use ash::{self, vk};
pub use egui_ash_renderer;
pub use gpu_allocator;
pub use raw_window_handle;
