//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation
//! - Swapchain management
//! - Command buffer recording
//! - Texture and buffer resources with image-state tracking
//! - Synchronization primitives

mod error;

pub mod buffer;
pub mod command;
pub mod device;
pub mod instance;
pub mod physical_device;
pub mod program;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::{Buffer, BufferUsage};
pub use error::{RhiError, RhiResult};
pub use program::BoundProgram;
pub use swapchain::{AcquireOutcome, PresentOutcome};
pub use texture::{ImageState, StateTransition, Texture, TextureDesc, TextureOps};

// Re-export ash types that users might need
pub use ash::vk;
