//! Configuration data structures

use crate::flow::cancellation::PollPolicy;
use crate::flows::downscale::DownscaleSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest detach batch the provider accepts in one call
pub const MAX_DETACH_BATCH_SIZE: usize = 20;

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// Location of the JSON state store; the data directory is used when unset
    pub store_path: Option<PathBuf>,
    /// Instances detached from an autoscaling group per provider call
    pub detach_batch_size: usize,
    /// Delay between two termination status polls
    pub termination_poll_interval_ms: u64,
    /// Polls before waiting for termination gives up
    pub termination_max_attempts: u32,
    /// Drain unfinished chains found in the store at startup
    pub chain_resume_on_start: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            store_path: None,
            detach_batch_size: MAX_DETACH_BATCH_SIZE,
            termination_poll_interval_ms: 5000,
            termination_max_attempts: 120, // 10 minutes at the default interval
            chain_resume_on_start: true,
        }
    }
}

impl Configuration {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Configuration = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("flowchain").join("config.toml"))
    }

    /// Store location, falling back to the XDG data directory
    pub fn resolved_store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => {
                let data_dir = dirs::data_dir().context("Could not determine data directory")?;
                Ok(data_dir.join("flowchain").join("store.json"))
            }
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.termination_poll_interval_ms),
            max_attempts: self.termination_max_attempts,
        }
    }

    pub fn downscale_settings(&self) -> DownscaleSettings {
        DownscaleSettings {
            detach_batch_size: self.detach_batch_size,
            poll: self.poll_policy(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.detach_batch_size == 0 || self.detach_batch_size > MAX_DETACH_BATCH_SIZE {
            errors.push(format!(
                "detach_batch_size must be between 1 and {}",
                MAX_DETACH_BATCH_SIZE
            ));
        }

        if self.termination_poll_interval_ms == 0 {
            errors.push("termination_poll_interval_ms must be greater than 0".to_string());
        }

        if self.termination_max_attempts == 0 {
            errors.push("termination_max_attempts must be greater than 0".to_string());
        }

        if let Some(path) = &self.store_path {
            if path.as_os_str().is_empty() {
                errors.push("store_path cannot be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
