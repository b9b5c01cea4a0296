//! Configuration management for Patchbay
//!
//! This module provides:
//! - The channel layout every routing graph is built with
//! - Partial overrides deep-merged over the process-wide defaults
//! - The on-disk application configuration with TOML serialization

use crate::domain::channels::{map_channels, ChannelId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

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

/// Channel count of one side of a routing graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub channels: u16,
}

impl ChannelLayout {
    pub fn new(channels: u16) -> Self {
        Self { channels }
    }
}

/// Input/output layout shared by every routing graph of a router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub input: ChannelLayout,
    pub output: ChannelLayout,
}

impl Default for RouterConfig {
    /// Stereo in, stereo out
    fn default() -> Self {
        Self {
            input: ChannelLayout::new(2),
            output: ChannelLayout::new(2),
        }
    }
}

impl RouterConfig {
    pub fn new(input_channels: u16, output_channels: u16) -> Result<Self> {
        let config = Self {
            input: ChannelLayout::new(input_channels),
            output: ChannelLayout::new(output_channels),
        };
        config.validate()?;
        Ok(config)
    }

    /// Merge `overrides` field by field over the defaults
    pub fn from_overrides(overrides: &RoutingOverride) -> Result<Self> {
        Self::default().merged(overrides)
    }

    /// Merge `overrides` field by field over `self`
    pub fn merged(&self, overrides: &RoutingOverride) -> Result<Self> {
        let mut merged = *self;
        if let Some(channels) = overrides.input.as_ref().and_then(|l| l.channels) {
            merged.input.channels = channels;
        }
        if let Some(channels) = overrides.output.as_ref().and_then(|l| l.channels) {
            merged.output.channels = channels;
        }
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.channels == 0 {
            return Err(ConfigError::Invalid(
                "input.channels must be at least 1".to_string(),
            ));
        }
        if self.output.channels == 0 {
            return Err(ConfigError::Invalid(
                "output.channels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Identifiers of the input channels (`[1..=input.channels]`)
    pub fn input_channels(&self) -> Vec<ChannelId> {
        map_channels(self.input.channels)
    }

    /// Identifiers of the output channels (`[1..=output.channels]`)
    pub fn output_channels(&self) -> Vec<ChannelId> {
        map_channels(self.output.channels)
    }
}

/// Partial channel layout; absent fields keep their default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LayoutOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
}

/// Partial [`RouterConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoutingOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<LayoutOverride>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<LayoutOverride>,
}

impl RoutingOverride {
    pub fn with_input_channels(mut self, channels: u16) -> Self {
        self.input = Some(LayoutOverride {
            channels: Some(channels),
        });
        self
    }

    pub fn with_output_channels(mut self, channels: u16) -> Self {
        self.output = Some(LayoutOverride {
            channels: Some(channels),
        });
        self
    }
}

impl From<RouterConfig> for RoutingOverride {
    fn from(config: RouterConfig) -> Self {
        Self::default()
            .with_input_channels(config.input.channels)
            .with_output_channels(config.output.channels)
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Sample rate of the software engine when no output device dictates one
    pub sample_rate: u32,

    /// `tracing` filter directive used when `RUST_LOG` is not set
    pub log_filter: String,

    /// Group the CLI monitor registers its instance under
    pub group: String,

    /// Track the CLI monitor registers its instance under
    pub track: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            log_filter: "info".to_string(),
            group: "local".to_string(),
            track: "monitor".to_string(),
        }
    }
}

/// Complete Patchbay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatchbayConfig {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub routing: RoutingOverride,
}

impl PatchbayConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Reject a zero sample rate or channel count
    pub fn validate(&self) -> Result<()> {
        if self.app.sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "app.sample_rate must be at least 1".to_string(),
            ));
        }
        self.router_config().map(|_| ())
    }

    /// The routing overrides merged over the defaults
    pub fn router_config(&self) -> Result<RouterConfig> {
        RouterConfig::from_overrides(&self.routing)
    }
}

/// Owns the main configuration file at `~/.config/patchbay/config.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");

        Self {
            config_dir,
            config_path,
        }
    }

    /// `~/.config/patchbay` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("patchbay"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// A missing file yields the defaults. A corrupt file is backed up next to
    /// the original with a `.toml.corrupt` extension and the defaults are used.
    #[instrument(skip(self))]
    pub async fn load(&self) -> PatchbayConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, using defaults"
            );
            return PatchbayConfig::default();
        }

        match PatchbayConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                PatchbayConfig::default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &PatchbayConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;

        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
