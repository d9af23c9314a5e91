//! Configuration management for wasmhost.
//!
//! Handles loading configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::{ManagerOptions, DEFAULT_LOG_CAPACITY};

/// Local config file name, looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "wasmhost.toml";

/// Host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Plugin directory and sandbox limits
    pub plugins: PluginsConfig,

    /// Bearer tokens accepted by the API
    pub auth: AuthConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,
}

/// Plugin settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory holding plugin modules and packages
    pub dir: PathBuf,

    /// Maximum time a single plugin call may run
    pub call_timeout_secs: u64,

    /// Linear memory limit per plugin, in MiB
    pub memory_limit_mb: usize,

    /// Number of execution log entries kept in memory
    pub log_capacity: usize,

    /// Largest accepted upload, in MiB
    pub max_upload_mb: usize,

    /// Keep enable/disable choices across restarts
    pub persist_state: bool,
}

/// Token authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
}

/// A bearer token and the principal it authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub user: String,
    #[serde(default)]
    pub admin: bool,
    /// Preferred language for plugin calls made with this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8080".to_string() }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            call_timeout_secs: 30,
            memory_limit_mb: 16,
            log_capacity: DEFAULT_LOG_CAPACITY,
            max_upload_mb: 32,
            persist_state: false,
        }
    }
}

impl PluginsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// Options for the plugin manager built from this section.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            call_timeout: self.call_timeout(),
            memory_limit: self.memory_limit_mb.saturating_mul(1024 * 1024),
            log_capacity: self.log_capacity,
            persist_state: self.persist_state,
        }
    }
}

impl HostConfig {
    /// Load configuration.
    ///
    /// Looks for config in:
    /// 1. `explicit`, when given (must exist)
    /// 2. `wasmhost.toml` in current directory
    /// 3. `~/.config/wasmhost/config.toml`
    /// 4. Falls back to defaults
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        // Try local config first
        let local_config = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        // Try global config
        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("wasmhost"))
    }
}
