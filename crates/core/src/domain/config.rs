//! Configuration for the mixing engine
//!
//! Settings are read from a TOML file, usually
//! `~/.config/mixdown/config.toml`. Missing keys fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine-wide settings shared by every device owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Hardware period in frames
    pub buffer_frames: u32,

    /// Control loop heartbeat in milliseconds
    pub heartbeat_ms: u64,

    /// Buffers a source queue holds before producers block
    pub queue_capacity: usize,

    /// Rate used for a device nobody configured yet
    pub default_sample_rate: u32,

    /// Stream name reported to the audio system
    pub stream_name: String,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            buffer_frames: 1024,
            heartbeat_ms: 50,
            queue_capacity: 32,
            default_sample_rate: 48000,
            stream_name: "Mixdown Audio Output".to_string(),
        }
    }
}

impl MixerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.buffer_frames == 0 {
            return Err(ConfigError::Invalid("buffer_frames must be positive".to_string()));
        }
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_ms must be positive".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".to_string()));
        }
        if self.default_sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "default_sample_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Default location of the config file
    ///
    /// Returns `~/.config/mixdown/config.toml` on Linux,
    /// `%APPDATA%\mixdown\config.toml` on Windows
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("mixdown").join("config.toml"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    /// Load configuration from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Save configuration to a TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;
        Ok(())
    }
}
