//! Core building blocks for the Kiln engine.
//!
//! This crate provides foundational types used across the engine:
//! - The stable-handle resource [`Registry`]
//! - Error types and result aliases
//! - Logging initialization
//! - Configuration loading
//! - Frame timing

pub mod config;
mod error;
mod logging;
pub mod registry;
mod timer;

pub use config::{EngineConfig, RendererConfig, WindowConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use registry::{Registry, Release, Rid};
pub use timer::Timer;
