//! # wasmhost
//!
//! Sandboxed WebAssembly extension host.
//!
//! wasmhost discovers plugin modules in a directory, loads them lazily into a
//! wasmtime sandbox, and exposes what their manifests declare (HTTP routes,
//! dashboard widgets, background jobs, menu entries) through an axum server.
//!
//! ## Features
//!
//! - **Lazy Loading**: Plugins compile on first use, exactly once per name
//! - **Sandboxing**: Memory limits and epoch-based execution timeouts
//! - **Packages**: `.zip` packages with a manifest, module and assets
//! - **Execution Log**: Bounded in-memory log of every plugin call
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the host against ./plugins
//! wasmhost serve --plugin-dir plugins
//!
//! # Call a plugin function once
//! wasmhost call greeter render --args '{}'
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::case_sensitive_file_extension_comparisons)]
#![allow(clippy::type_complexity)]

pub mod core;
pub mod plugin;
pub mod server;

pub use core::HostConfig;
pub use plugin::{
    CallContext, LogBuffer, LogEntry, LogLevel, Manifest, ModuleStore, PluginError, PluginInfo,
    PluginManager, PluginResult, PluginRuntime,
};
pub use server::AppState;

/// Version of wasmhost
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "wasmhost";
