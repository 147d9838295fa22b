//! Error types shared by the engine crates.

use thiserror::Error;

/// Engine-level error type.
///
/// GPU-specific failures live in `kiln_rhi::RhiError`; this type covers
/// configuration, windowing and surface setup.
#[derive(Error, Debug)]
pub enum Error {
    /// Vulkan-related errors outside the RHI (surface creation)
    #[error("Vulkan error: {0}")]
    Vulkan(String),

    /// Window creation or management errors
    #[error("Window error: {0}")]
    Window(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;
