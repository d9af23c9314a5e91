//! Plugin manifest parsing and validation.
//!
//! A manifest describes a plugin's identity and the capabilities it exposes to
//! the host: HTTP routes, dashboard widgets, background jobs and menu entries.
//! Standalone modules return it as JSON from `gk_register`; packages carry it
//! as `plugin.json` or `plugin.toml`. Every source goes through [`Manifest::validate`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{PluginError, PluginResult, PLUGIN_API_VERSION};

/// HTTP methods a plugin route may declare.
pub const ROUTE_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// Plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Plugin name (unique identifier, stable across versions).
    #[serde(default)]
    pub name: String,
    /// Plugin version.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Minimum host API version required.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Whether the plugin starts enabled after loading.
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default, alias = "menuItems")]
    pub menu_items: Vec<MenuItemSpec>,
    /// Plugin-owned translations, keyed by language then message key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub i18n: BTreeMap<String, BTreeMap<String, String>>,
    /// Static configuration readable by the guest through `host_call("config_get")`.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_api_version() -> String {
    PLUGIN_API_VERSION.to_string()
}

fn default_enabled() -> bool {
    true
}

/// An HTTP route served by a plugin handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub method: String,
    pub path: String,
    /// Exported function invoked for this route.
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered middleware tokens, see [`Middleware`].
    #[serde(default)]
    pub middleware: Vec<String>,
}

/// A dashboard widget rendered by a plugin handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSpec {
    /// Unique within the plugin.
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Exported function returning `{ "html": string }`.
    pub handler: String,
    #[serde(default = "default_widget_location")]
    pub location: String,
    #[serde(default = "default_widget_size")]
    pub size: String,
    #[serde(default)]
    pub refreshable: bool,
    #[serde(default, alias = "refresh_sec", skip_serializing_if = "Option::is_none")]
    pub refresh_interval_seconds: Option<u32>,
}

fn default_widget_location() -> String {
    "dashboard".to_string()
}

fn default_widget_size() -> String {
    "medium".to_string()
}

/// A background job the host scheduler may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub handler: String,
    /// Schedule expression, interpreted by the host scheduler.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A navigation entry contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItemSpec {
    pub id: String,
    pub label: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default = "default_menu_location")]
    pub location: String,
    #[serde(default)]
    pub order: i32,
}

fn default_menu_location() -> String {
    "main".to_string()
}

/// Route guard named by a middleware token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Middleware {
    /// Requires an authenticated session.
    Auth,
    /// Requires an authenticated session with the admin capability.
    Admin,
}

impl Middleware {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Middleware {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Ok(Self::Auth),
            "admin" => Ok(Self::Admin),
            other => {
                Err(PluginError::ManifestInvalid(format!("unknown middleware token '{other}'")))
            }
        }
    }
}

impl fmt::Display for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RouteSpec {
    /// Parse the middleware tokens into guards, in declaration order.
    pub fn guards(&self) -> PluginResult<Vec<Middleware>> {
        self.middleware.iter().map(|token| token.parse()).collect()
    }
}

impl Manifest {
    /// Parse and validate a JSON manifest.
    pub fn from_json(bytes: &[u8]) -> PluginResult<Self> {
        let mut manifest: Self =
            serde_json::from_slice(bytes).map_err(|e| PluginError::ManifestParse(e.to_string()))?;
        manifest.normalize();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate a TOML manifest.
    pub fn from_toml(content: &str) -> PluginResult<Self> {
        let mut manifest: Self =
            toml::from_str(content).map_err(|e| PluginError::ManifestParse(e.to_string()))?;
        manifest.normalize();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest file, choosing the format by extension.
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }

    /// Parse manifest bytes that came from `path` (inside a package or on disk).
    pub fn from_bytes(bytes: &[u8], path: &Path) -> PluginResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                let content = std::str::from_utf8(bytes)
                    .map_err(|e| PluginError::ManifestParse(e.to_string()))?;
                Self::from_toml(content)
            }
            _ => Self::from_json(bytes),
        }
    }

    pub fn to_json(&self) -> PluginResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| PluginError::ManifestParse(e.to_string()))
    }

    pub fn to_toml(&self) -> PluginResult<String> {
        toml::to_string_pretty(self).map_err(|e| PluginError::ManifestParse(e.to_string()))
    }

    fn normalize(&mut self) {
        for route in &mut self.routes {
            route.method = route.method.trim().to_ascii_uppercase();
            for token in &mut route.middleware {
                *token = token.trim().to_ascii_lowercase();
            }
        }
    }

    /// Validate the manifest.
    pub fn validate(&self) -> PluginResult<()> {
        validate_name(&self.name)?;

        if !self.version.is_empty() && self.version.split('.').count() < 2 {
            return Err(invalid(format!(
                "version '{}' must be in semver format (e.g., 1.0.0)",
                self.version
            )));
        }

        for route in &self.routes {
            if !ROUTE_METHODS.contains(&route.method.as_str()) {
                return Err(invalid(format!(
                    "route {} has unsupported method '{}'",
                    route.path, route.method
                )));
            }
            validate_route_path(&route.path)?;
            require_handler(&route.handler, || format!("route {} {}", route.method, route.path))?;
            route.guards().map_err(|e| {
                invalid(format!("route {} {}: {}", route.method, route.path, inner_reason(&e)))
            })?;
        }

        let mut widget_ids = HashSet::new();
        for widget in &self.widgets {
            if widget.id.trim().is_empty() {
                return Err(invalid("widget id is required"));
            }
            if !widget_ids.insert(widget.id.as_str()) {
                return Err(invalid(format!("duplicate widget id '{}'", widget.id)));
            }
            require_handler(&widget.handler, || format!("widget '{}'", widget.id))?;
            if widget.refresh_interval_seconds.is_some() && !widget.refreshable {
                return Err(invalid(format!(
                    "widget '{}' sets refresh_interval_seconds but is not refreshable",
                    widget.id
                )));
            }
        }

        let mut job_ids = HashSet::new();
        for job in &self.jobs {
            if !job_ids.insert(job.id.as_str()) {
                return Err(invalid(format!("duplicate job id '{}'", job.id)));
            }
            require_handler(&job.handler, || format!("job '{}'", job.id))?;
            if job.schedule.trim().is_empty() {
                return Err(invalid(format!("job '{}' has an empty schedule", job.id)));
            }
        }

        let mut menu_ids = HashSet::new();
        for item in &self.menu_items {
            if !menu_ids.insert(item.id.as_str()) {
                return Err(invalid(format!("duplicate menu item id '{}'", item.id)));
            }
        }

        Ok(())
    }

    /// Reject a manifest whose name differs from the artifact it was loaded from.
    pub fn ensure_identity(&self, artifact_name: &str) -> PluginResult<()> {
        if self.name == artifact_name {
            Ok(())
        } else {
            Err(invalid(format!(
                "manifest name '{}' does not match plugin artifact '{}'",
                self.name, artifact_name
            )))
        }
    }

    /// Check if this manifest is compatible with the given API version.
    pub fn is_compatible_with(&self, host_api_version: &str) -> bool {
        // Major version must match, and available minor must be >= required
        let required: Vec<u32> = self.api_version.split('.').filter_map(|s| s.parse().ok()).collect();
        let available: Vec<u32> =
            host_api_version.split('.').filter_map(|s| s.parse().ok()).collect();

        if required.is_empty() || available.is_empty() {
            return false;
        }

        required[0] == available[0]
            && (available.len() < 2 || required.len() < 2 || available[1] >= required[1])
    }

    /// Every handler name declared by routes, widgets and jobs.
    pub fn handlers(&self) -> BTreeSet<&str> {
        self.routes
            .iter()
            .map(|r| r.handler.as_str())
            .chain(self.widgets.iter().map(|w| w.handler.as_str()))
            .chain(self.jobs.iter().map(|j| j.handler.as_str()))
            .collect()
    }

    pub fn widget(&self, id: &str) -> Option<&WidgetSpec> {
        self.widgets.iter().find(|w| w.id == id)
    }

    /// Look up a plugin message for `language`, falling back to English.
    pub fn translate(&self, language: Option<&str>, key: &str) -> Option<&str> {
        language
            .and_then(|lang| self.i18n.get(lang))
            .and_then(|messages| messages.get(key))
            .or_else(|| self.i18n.get("en").and_then(|messages| messages.get(key)))
            .map(String::as_str)
    }
}

fn invalid(reason: impl Into<String>) -> PluginError {
    PluginError::ManifestInvalid(reason.into())
}

fn inner_reason(err: &PluginError) -> String {
    match err {
        PluginError::ManifestInvalid(reason) => reason.clone(),
        other => other.to_string(),
    }
}

fn require_handler(handler: &str, owner: impl FnOnce() -> String) -> PluginResult<()> {
    if handler.trim().is_empty() {
        return Err(invalid(format!("{} has no handler", owner())));
    }
    if handler.starts_with("gk_") {
        return Err(invalid(format!("{} uses reserved handler name '{handler}'", owner())));
    }
    Ok(())
}

/// Plugin names double as file names, so they are restricted to a safe charset.
pub fn validate_name(name: &str) -> PluginResult<()> {
    if name.is_empty() {
        return Err(invalid("plugin name is required"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(invalid(format!(
            "plugin name '{name}' must contain only alphanumeric characters, hyphens, and underscores"
        )));
    }
    Ok(())
}

fn validate_route_path(path: &str) -> PluginResult<()> {
    if !path.starts_with('/') {
        return Err(invalid(format!("route path '{path}' must start with '/'")));
    }
    if path == "/" {
        return Ok(());
    }

    let segments: Vec<&str> = path[1..].split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        let is_last = i + 1 == segments.len();
        if segment.is_empty() {
            if is_last {
                break;
            }
            return Err(invalid(format!("route path '{path}' has an empty segment")));
        }
        if let Some(param) = segment.strip_prefix(':').or_else(|| segment.strip_prefix('*')) {
            if param.is_empty() || !param.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid(format!("route path '{path}' has a bad parameter '{segment}'")));
            }
            if segment.starts_with('*') && !is_last {
                return Err(invalid(format!(
                    "route path '{path}' has a wildcard before the last segment"
                )));
            }
            continue;
        }
        if segment.chars().any(|c| c.is_whitespace() || matches!(c, ':' | '*' | '{' | '}')) {
            return Err(invalid(format!("route path '{path}' has a bad segment '{segment}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS_MANIFEST: &str = r#"{
        "name": "stats",
        "version": "1.1.0",
        "description": "Ticket statistics and analytics",
        "author": "Support Team",
        "license": "Apache-2.0",
        "routes": [
            {"method": "get", "path": "/api/plugins/stats/overview", "handler": "overview", "middleware": ["auth"]},
            {"method": "POST", "path": "/api/plugins/stats/:range", "handler": "by_range", "middleware": ["Auth", "admin"]}
        ],
        "widgets": [
            {"id": "stats_overview", "title": "Ticket Overview", "handler": "widget_overview", "size": "medium", "refreshable": true, "refresh_sec": 30},
            {"id": "stats_chart", "title": "Ticket Chart", "handler": "widget_chart", "location": "reports", "size": "large"}
        ],
        "jobs": [{"id": "rollup", "handler": "nightly_rollup", "schedule": "0 2 * * *"}],
        "menuItems": [{"id": "stats", "label": "Statistics", "path": "/stats", "order": 3}],
        "i18n": {"en": {"stats.title": "Statistics"}, "de": {"stats.title": "Statistiken"}}
    }"#;

    #[test]
    fn test_parse_json_manifest() {
        let manifest = Manifest::from_json(STATS_MANIFEST.as_bytes()).unwrap();

        assert_eq!(manifest.name, "stats");
        assert_eq!(manifest.routes[0].method, "GET");
        assert_eq!(manifest.routes[1].guards().unwrap(), vec![Middleware::Auth, Middleware::Admin]);
        assert_eq!(manifest.widgets[0].refresh_interval_seconds, Some(30));
        assert_eq!(manifest.widgets[0].location, "dashboard");
        assert_eq!(manifest.widgets[1].location, "reports");
        assert_eq!(manifest.menu_items.len(), 1);
        assert!(manifest.default_enabled);
        assert_eq!(
            manifest.handlers().into_iter().collect::<Vec<_>>(),
            vec!["by_range", "nightly_rollup", "overview", "widget_chart", "widget_overview"]
        );
    }

    #[test]
    fn test_parse_toml_manifest() {
        let toml = r#"
name = "greeter"
version = "0.2.0"
default_enabled = false

[[widgets]]
id = "hello"
title = "Hello"
handler = "render"

[config]
greeting = "hi"
"#;
        let manifest = Manifest::from_toml(toml).unwrap();
        assert_eq!(manifest.name, "greeter");
        assert!(!manifest.default_enabled);
        assert_eq!(manifest.config.get("greeting").and_then(|v| v.as_str()), Some("hi"));
    }

    #[test]
    fn test_malformed_is_parse_error() {
        let err = Manifest::from_json(b"{\"name\": ").unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse(_)));

        let err = Manifest::from_json(br#"{"name": "x", "routes": {}}"#).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse(_)));
    }

    #[test]
    fn test_missing_or_empty_name_is_invalid() {
        let err = Manifest::from_json(br#"{"version": "1.0.0"}"#).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid(_)));

        let err = Manifest::from_json(br#"{"name": ""}"#).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid(_)));

        let err = Manifest::from_json(br#"{"name": "../etc"}"#).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid(_)));
    }

    #[test]
    fn test_unknown_middleware_is_rejected() {
        let json = r#"{"name": "x", "routes": [
            {"method": "GET", "path": "/x", "handler": "h", "middleware": ["auth", "public"]}
        ]}"#;
        let err = Manifest::from_json(json.as_bytes()).unwrap_err();
        match err {
            PluginError::ManifestInvalid(reason) => assert!(reason.contains("public")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_route_validation() {
        let bad = [
            r#"{"name": "x", "routes": [{"method": "TRACE", "path": "/x", "handler": "h"}]}"#,
            r#"{"name": "x", "routes": [{"method": "GET", "path": "x", "handler": "h"}]}"#,
            r#"{"name": "x", "routes": [{"method": "GET", "path": "/a//b", "handler": "h"}]}"#,
            r#"{"name": "x", "routes": [{"method": "GET", "path": "/*rest/b", "handler": "h"}]}"#,
            r#"{"name": "x", "routes": [{"method": "GET", "path": "/x", "handler": ""}]}"#,
            r#"{"name": "x", "routes": [{"method": "GET", "path": "/x", "handler": "gk_call"}]}"#,
        ];
        for json in bad {
            assert!(
                matches!(Manifest::from_json(json.as_bytes()), Err(PluginError::ManifestInvalid(_))),
                "expected invalid: {json}"
            );
        }

        let ok = r#"{"name": "x", "routes": [{"method": "GET", "path": "/files/:id/*rest", "handler": "h"}]}"#;
        assert!(Manifest::from_json(ok.as_bytes()).is_ok());
    }

    #[test]
    fn test_widget_validation() {
        let duplicate = r#"{"name": "x", "widgets": [
            {"id": "a", "title": "A", "handler": "h"},
            {"id": "a", "title": "B", "handler": "h"}
        ]}"#;
        assert!(Manifest::from_json(duplicate.as_bytes()).is_err());

        let interval_without_refresh = r#"{"name": "x", "widgets": [
            {"id": "a", "title": "A", "handler": "h", "refresh_interval_seconds": 10}
        ]}"#;
        assert!(Manifest::from_json(interval_without_refresh.as_bytes()).is_err());
    }

    #[test]
    fn test_identity() {
        let manifest = Manifest::from_json(STATS_MANIFEST.as_bytes()).unwrap();
        assert!(manifest.ensure_identity("stats").is_ok());
        assert!(matches!(manifest.ensure_identity("other"), Err(PluginError::ManifestInvalid(_))));
    }

    #[test]
    fn test_api_compatibility() {
        let mut manifest = Manifest::from_json(STATS_MANIFEST.as_bytes()).unwrap();
        manifest.api_version = "0.1.0".to_string();

        assert!(manifest.is_compatible_with("0.1.0"));
        assert!(manifest.is_compatible_with("0.2.0"));
        assert!(!manifest.is_compatible_with("1.0.0"));
    }

    #[test]
    fn test_translate_falls_back_to_english() {
        let manifest = Manifest::from_json(STATS_MANIFEST.as_bytes()).unwrap();
        assert_eq!(manifest.translate(Some("de"), "stats.title"), Some("Statistiken"));
        assert_eq!(manifest.translate(Some("fr"), "stats.title"), Some("Statistics"));
        assert_eq!(manifest.translate(None, "stats.missing"), None);
    }

    #[test]
    fn test_serialize_roundtrip_formats() {
        let manifest = Manifest::from_json(STATS_MANIFEST.as_bytes()).unwrap();
        let toml = manifest.to_toml().unwrap();
        assert_eq!(Manifest::from_toml(&toml).unwrap(), manifest);
    }
}
