//! HTTP host for the plugin system.
//!
//! Serves the plugin management API under `/plugins` and mounts every route
//! declared by plugin manifests. Manifest routes are registered once, when the
//! router is built; plugins installed afterwards contribute routes on restart.

pub mod api;
pub mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{middleware, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

use crate::core::HostConfig;
use crate::plugin::{BoundRoute, CallContext, LogBuffer, ModuleStore, PluginError, PluginManager};

pub use auth::{Authenticator, Principal, TokenAuthenticator};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PluginManager>,
    pub auth: Arc<dyn Authenticator>,
    /// Largest accepted upload body, in bytes.
    pub max_upload: usize,
}

impl AppState {
    pub fn new(manager: Arc<PluginManager>, auth: Arc<dyn Authenticator>) -> Self {
        Self { manager, auth, max_upload: 32 * 1024 * 1024 }
    }

    pub fn with_max_upload(mut self, bytes: usize) -> Self {
        self.max_upload = bytes;
        self
    }
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "error": self.to_string(), "kind": self.kind() }));
        (status, body).into_response()
    }
}

/// Call context for a request: the principal's language wins over `Accept-Language`.
pub(crate) fn call_context(principal: Option<&Principal>, headers: &HeaderMap) -> CallContext {
    let language = principal
        .and_then(|p| p.language.clone())
        .or_else(|| auth::accept_language(headers));
    CallContext { language, ..CallContext::default() }
}

/// Build the full router: management API plus the routes plugins declare.
///
/// Loads every discovered plugin to collect their routes.
pub async fn router(state: AppState) -> Router {
    let plugin_routes = state.manager.routes().await;
    build_router(state, &plugin_routes)
}

/// Build the router from an already collected route list.
pub fn build_router(state: AppState, plugin_routes: &[BoundRoute]) -> Router {
    let (plugin_router, registered) =
        routes::plugin_routes(plugin_routes, &api::MANAGEMENT_PATHS);
    tracing::info!(routes = registered, "Registered plugin routes");

    Router::new()
        .merge(api::router(&state))
        .merge(plugin_router)
        .layer(middleware::from_fn_with_state(state.clone(), auth::resolve_principal))
        .with_state(state)
}

/// Run the host until Ctrl-C.
pub async fn serve(config: HostConfig) -> anyhow::Result<()> {
    let store = ModuleStore::open(&config.plugins.dir)?;
    let options = config.plugins.manager_options();
    let logs = LogBuffer::global(options.log_capacity);
    let manager = PluginManager::with_logs(store, options, logs)?.into_shared();
    let state = AppState::new(manager.clone(), auth::shared(&config.auth))
        .with_max_upload(config.plugins.max_upload_bytes());

    let app = router(state).await;

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        plugin_dir = %config.plugins.dir.display(),
        "Plugin host listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down plugin host");
        })
        .await?;

    manager.shutdown();
    Ok(())
}
