//! Core plugin types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::manifest::{JobSpec, MenuItemSpec, RouteSpec, WidgetSpec};

/// Plugin API version.
pub const PLUGIN_API_VERSION: &str = "0.1.0";

/// Plugin module file extension.
pub const PLUGIN_EXTENSION: &str = "wasm";

/// Plugin package file extension.
pub const PACKAGE_EXTENSION: &str = "zip";

/// Manifest file names recognized inside a package.
pub const MANIFEST_FILES: [&str; 2] = ["plugin.json", "plugin.toml"];

/// Magic bytes at the start of every WebAssembly binary.
pub const WASM_MAGIC: [u8; 4] = *b"\0asm";

/// Per-call environment passed into a plugin invocation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Language of the inbound request, exposed to the guest through `host_call("language")`.
    pub language: Option<String>,
    /// Caller deadline. The effective timeout is the smaller of this and the host limit.
    pub timeout: Option<Duration>,
    /// Plugins waiting on this call through `plugin_call`, outermost first.
    pub callers: Vec<String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Context for a call made by `plugin` on behalf of this one.
    pub fn nested(&self, plugin: &str, timeout: Option<Duration>) -> Self {
        let mut callers = self.callers.clone();
        callers.push(plugin.to_string());
        Self { language: self.language.clone(), timeout, callers }
    }

    /// The plugin that issued this call, if it came from another plugin.
    pub fn caller(&self) -> Option<&str> {
        self.callers.last().map(String::as_str)
    }
}

/// Listing entry for a plugin, loaded or merely discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub enabled: bool,
    pub loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub menu_items: Vec<MenuItemSpec>,
}

impl PluginInfo {
    /// Placeholder entry for a plugin that has been discovered but not compiled.
    pub fn discovered(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: String::new(),
            description: "Not loaded (lazy loading enabled)".to_string(),
            author: None,
            license: None,
            enabled: false,
            loaded: false,
            checksum: None,
            loaded_at: None,
            routes: Vec::new(),
            widgets: Vec::new(),
            jobs: Vec::new(),
            menu_items: Vec::new(),
        }
    }
}

/// A widget declaration bound to the plugin that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundWidget {
    pub plugin_name: String,
    #[serde(flatten)]
    pub widget: WidgetSpec,
}

/// A widget together with the HTML its handler produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedWidget {
    pub plugin_name: String,
    #[serde(flatten)]
    pub widget: WidgetSpec,
    pub html: String,
}

/// A route declaration bound to the plugin that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundRoute {
    pub plugin_name: String,
    #[serde(flatten)]
    pub route: RouteSpec,
}

/// A menu entry bound to the plugin that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundMenuItem {
    pub plugin_name: String,
    #[serde(flatten)]
    pub item: MenuItemSpec,
}

/// A background job declaration bound to the plugin that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundJob {
    pub plugin_name: String,
    #[serde(flatten)]
    pub job: JobSpec,
}

/// The `html` field of a call result, when the result is a JSON object carrying one.
pub fn html_fragment(result: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(result).ok()?;
    value.get("html")?.as_str().map(str::to_string)
}
