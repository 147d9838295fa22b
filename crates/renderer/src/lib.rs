//! Frame orchestration.
//!
//! This crate drives rendering on top of `kiln-rhi`:
//! - Frame pacing across a fixed number of frames in flight
//! - The Vulkan frame backend (swapchain and command submission)
//! - The [`Renderer`] facade owning textures, buffers and the frame loop

pub mod backend;
pub mod frame_pacer;
pub mod render_graph;
mod renderer;

pub use backend::VulkanFrameBackend;
pub use frame_pacer::{FrameBackend, FrameContext, FramePacer, FrameStatus, PacingConfig};
pub use render_graph::RenderGraph;
pub use renderer::Renderer;
