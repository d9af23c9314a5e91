//! Plugin system.
//!
//! Plugins are WebAssembly modules run inside wasmtime. Each plugin declares,
//! through its manifest, the capabilities it contributes to the host:
//! HTTP routes, dashboard widgets, background jobs and menu entries.
//!
//! # Architecture
//!
//! - [`ModuleStore`] finds plugin artifacts on disk and handles uploads.
//! - [`PluginRuntime`] compiles and sandboxes modules.
//! - [`PluginManager`] owns discovery, lazy loading, enable/disable state and
//!   call dispatch. It is the only entry point the rest of the host uses.
//! - [`LogBuffer`] records the outcome of every plugin call.
//!
//! # Example Manifest
//!
//! ```toml
//! name = "stats"
//! version = "1.0.0"
//!
//! [[widgets]]
//! id = "overview"
//! title = "Ticket Overview"
//! handler = "widget_overview"
//! refreshable = true
//! refresh_interval_seconds = 30
//! ```

mod error;
pub mod host;
mod logs;
mod manager;
mod manifest;
pub mod package;
mod runtime;
pub mod store;
mod types;

pub use error::{PluginError, PluginResult};
pub use host::{HostDispatch, LogLevel};
pub use logs::{LogBuffer, LogEntry, DEFAULT_LOG_CAPACITY};
pub use manager::{ManagerOptions, PluginInstance, PluginManager, PluginState, STATE_FILE};
pub use manifest::{
    validate_name, JobSpec, Manifest, MenuItemSpec, Middleware, RouteSpec, WidgetSpec,
    ROUTE_METHODS,
};
pub use runtime::{CompiledPlugin, PluginRuntime};
pub use store::{Artifact, Installed, ModuleSource, ModuleStore};
pub use types::{
    html_fragment, BoundJob, BoundMenuItem, BoundRoute, BoundWidget, CallContext, PluginInfo,
    RenderedWidget, MANIFEST_FILES, PACKAGE_EXTENSION, PLUGIN_API_VERSION, PLUGIN_EXTENSION,
    WASM_MAGIC,
};
