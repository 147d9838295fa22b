//! Platform abstraction layer.
//!
//! Window management via winit, and Vulkan surface creation from the window's
//! raw handles.

mod window;

pub use window::{Surface, Window};

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
