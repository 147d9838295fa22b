//! Engine configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration:
//!
//! ```toml
//! [window]
//! width = 1600
//! height = 800
//!
//! [renderer]
//! frames_in_flight = 2
//! fence_timeout_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable naming the config file the app loads.
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Config file used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "kiln.toml";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub renderer: RendererConfig,
}

/// Window creation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 800,
            title: "Kiln".to_string(),
            resizable: true,
        }
    }
}

/// Renderer and frame pacing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    /// Maximum frames the CPU may record ahead of the GPU.
    pub frames_in_flight: u32,
    /// Upper bound on a single frame-fence wait before the device is
    /// considered hung.
    pub fence_timeout_ms: u64,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    /// Initial capacity of the resource registries.
    pub registry_capacity: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ms: 5000,
            validation: cfg!(debug_assertions),
            registry_capacity: 2000,
        }
    }
}

impl RendererConfig {
    /// Fence wait timeout as a [`Duration`].
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the configuration at `path`, or the defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load from the path in `KILN_CONFIG`, falling back to `kiln.toml`.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_or_default(path)
    }

    /// Reject settings the renderer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config(format!(
                "window extent must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        if self.renderer.frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".to_string()));
        }
        if self.renderer.fence_timeout_ms == 0 {
            return Err(Error::Config("fence_timeout_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.window.width, 1600);
        assert_eq!(config.window.height, 800);
        assert_eq!(config.renderer.frames_in_flight, 2);
        assert_eq!(config.renderer.fence_timeout(), Duration::from_secs(5));
        assert_eq!(config.renderer.registry_capacity, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [window]
            title = "demo"

            [renderer]
            frames_in_flight = 3
            validation = false
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.width, 1600);
        assert_eq!(config.renderer.frames_in_flight, 3);
        assert!(!config.renderer.validation);
        assert_eq!(config.renderer.fence_timeout_ms, 5000);
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let result = EngineConfig::from_toml_str("[renderer]\nframes_in_flight = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_extent_rejected() {
        let result = EngineConfig::from_toml_str("[window]\nwidth = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = EngineConfig::from_toml_str("[renderer]\nfence_timeout_ms = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = EngineConfig::from_toml_str("[renderer]\nframes = 2\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let path = std::env::temp_dir().join("kiln-config-that-does-not-exist.toml");
        let config = EngineConfig::load_or_default(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("kiln-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[window]\nwidth = 640\nheight = 480\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 480);
    }
}
