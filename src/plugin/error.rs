//! Plugin system error types.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur during plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin with this name is loaded or discovered.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Plugin is loaded but disabled.
    #[error("Plugin '{0}' is disabled")]
    Disabled(String),

    /// Manifest bytes are not a well-formed manifest document.
    #[error("Malformed plugin manifest: {0}")]
    ManifestParse(String),

    /// Manifest is well-formed but violates a manifest rule.
    #[error("Invalid plugin manifest: {0}")]
    ManifestInvalid(String),

    /// Module binary failed to compile or instantiate.
    #[error("Failed to compile plugin '{plugin}': {reason}")]
    Compile { plugin: String, reason: String },

    /// Uploaded file or package archive was rejected.
    #[error("Invalid plugin package: {0}")]
    Packaging(String),

    /// A lazy load failed. The same error is shared by every caller that
    /// raced on the load.
    #[error("Failed to load plugin '{plugin}': {source}")]
    LoadFailed {
        plugin: String,
        #[source]
        source: Arc<PluginError>,
    },

    /// The manifest names a handler the module does not export.
    #[error("Plugin '{plugin}' does not export handler '{handler}'")]
    MissingExport { plugin: String, handler: String },

    /// The requested function is not exported by the plugin.
    #[error("Plugin '{plugin}' has no function '{function}'")]
    FunctionNotFound { plugin: String, function: String },

    /// The requested widget is not declared by the plugin.
    #[error("Plugin '{plugin}' has no widget '{widget}'")]
    WidgetNotFound { plugin: String, widget: String },

    /// The plugin returned a response the host cannot use.
    #[error("Plugin '{plugin}' returned an invalid response from '{function}': {reason}")]
    InvalidResponse { plugin: String, function: String, reason: String },

    /// Plugin execution trapped or faulted.
    #[error("Plugin '{plugin}' failed in '{function}': {reason}")]
    Execution { plugin: String, function: String, reason: String },

    /// Plugin timed out.
    #[error("Plugin '{plugin}' timed out in '{function}' after {millis} ms")]
    Timeout { plugin: String, function: String, millis: u64 },

    /// Plugin version incompatible.
    #[error("Plugin '{name}' requires API version {required}, but host provides {available}")]
    IncompatibleVersion { name: String, required: String, available: String },

    /// Module store path does not exist or is not usable.
    #[error("Plugin directory unavailable: {0}")]
    StoreUnavailable(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PluginError {
    /// Stable error class, used in log entries and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Disabled(_) => "disabled",
            Self::ManifestParse(_) => "manifest_parse",
            Self::ManifestInvalid(_) => "manifest_invalid",
            Self::Compile { .. } => "compile",
            Self::Packaging(_) => "packaging",
            Self::LoadFailed { source, .. } => source.kind(),
            Self::MissingExport { .. } => "missing_export",
            Self::FunctionNotFound { .. } => "function_not_found",
            Self::WidgetNotFound { .. } => "widget_not_found",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::IncompatibleVersion { .. } => "incompatible_version",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::FunctionNotFound { .. } | Self::WidgetNotFound { .. } => 404,
            Self::LoadFailed { source, .. } if source.is_not_found() => 404,
            Self::Disabled(_) => 403,
            Self::Packaging(_) => 400,
            _ => 500,
        }
    }

    /// Whether this is the "unknown plugin" error, looking through shared load errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::LoadFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub(crate) fn compile(plugin: &str, reason: impl std::fmt::Display) -> Self {
        Self::Compile { plugin: plugin.to_string(), reason: reason.to_string() }
    }

    pub(crate) fn execution(plugin: &str, function: &str, reason: impl std::fmt::Display) -> Self {
        Self::Execution {
            plugin: plugin.to_string(),
            function: function.to_string(),
            reason: reason.to_string(),
        }
    }
}
