//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

use crate::texture::ImageState;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The device stopped responding; every object created from it is unusable
    #[error("Device lost during {0}")]
    DeviceLost(&'static str),

    /// A frame fence did not signal within the configured bound
    #[error("Fence wait timed out after {timeout_ms} ms")]
    FenceTimeout { timeout_ms: u64 },

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Requested image-state transition is not allowed
    #[error("Illegal transition {from:?} -> {to:?}")]
    IllegalTransition { from: ImageState, to: ImageState },

    /// Operation requires the image to be in a different state
    #[error("{op} requires {expected}, image is in {actual:?}")]
    InvalidImageState {
        op: &'static str,
        expected: &'static str,
        actual: ImageState,
    },

    /// Invalid construction parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RhiError {
    /// Classify a raw Vulkan result returned by `op`.
    ///
    /// Device loss gets its own variant so callers can tell it apart from
    /// ordinary API failures.
    pub fn from_vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost(op),
            other => Self::VulkanError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
