//! Plugin management endpoints.
//!
//! ```text
//! GET    /plugins                      list plugins              (auth)
//! POST   /plugins/:name/call/:function call a plugin function    (auth)
//! GET    /plugins/widgets              widgets for a location    (auth)
//! GET    /plugins/menu                 menu entries              (auth)
//! GET    /plugins/:name/widgets/:id    render one widget         (auth)
//! POST   /plugins/:name/enable         enable a plugin           (admin)
//! POST   /plugins/:name/disable        disable a plugin          (admin)
//! POST   /plugins/upload               upload .wasm or .zip      (admin)
//! GET    /plugins/logs                 query the execution log   (admin)
//! DELETE /plugins/logs                 clear the execution log   (admin)
//! ```

use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::{require_admin, require_auth, Principal};
use super::{call_context, AppState};
use crate::plugin::{LogLevel, PluginError};

/// Entries returned by the log query when no filter or limit is given.
const DEFAULT_LOG_LIMIT: usize = 100;

/// Location used by the widget listing when none is given.
const DEFAULT_WIDGET_LOCATION: &str = "dashboard";

/// Every path mounted by [`router`]. Plugin routes are vetted against these.
pub(super) const MANAGEMENT_PATHS: [&str; 9] = [
    "/plugins",
    "/plugins/widgets",
    "/plugins/menu",
    "/plugins/:name/call/:function",
    "/plugins/:name/widgets/:id",
    "/plugins/:name/enable",
    "/plugins/:name/disable",
    "/plugins/upload",
    "/plugins/logs",
];

pub(super) fn router(state: &AppState) -> Router<AppState> {
    let user = Router::new()
        .route("/plugins", get(list_plugins))
        .route("/plugins/widgets", get(list_widgets))
        .route("/plugins/menu", get(list_menu))
        .route("/plugins/:name/call/:function", post(call_plugin))
        .route("/plugins/:name/widgets/:id", get(render_widget))
        .route_layer(middleware::from_fn(require_auth));

    let admin = Router::new()
        .route("/plugins/:name/enable", post(enable_plugin))
        .route("/plugins/:name/disable", post(disable_plugin))
        .route(
            "/plugins/upload",
            post(upload_plugin).layer(DefaultBodyLimit::max(state.max_upload)),
        )
        .route("/plugins/logs", get(query_logs).delete(clear_logs))
        .route_layer(middleware::from_fn(require_admin));

    user.merge(admin)
}

fn bad_request(message: impl Into<String>) -> Response {
    let body = Json(json!({ "error": message.into(), "kind": "bad_request" }));
    (StatusCode::BAD_REQUEST, body).into_response()
}

/// Raw call output as a JSON response. An empty result becomes `null`.
pub(super) fn json_bytes(output: Vec<u8>) -> Response {
    let body = if output.is_empty() { b"null".to_vec() } else { output };
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn principal_ref(principal: &Option<Extension<Principal>>) -> Option<&Principal> {
    principal.as_ref().map(|Extension(p)| p)
}

async fn list_plugins(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "plugins": state.manager.infos() }))
}

async fn call_plugin(
    State(state): State<AppState>,
    Path((name, function)): Path<(String, String)>,
    principal: Option<Extension<Principal>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !body.is_empty() && serde_json::from_slice::<Value>(&body).is_err() {
        return bad_request("request body must be JSON");
    }

    let ctx = call_context(principal_ref(&principal), &headers);
    match state.manager.call(&ctx, &name, &function, &body).await {
        Ok(output) => json_bytes(output),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct WidgetListQuery {
    location: Option<String>,
    #[serde(default)]
    render: bool,
}

async fn list_widgets(
    State(state): State<AppState>,
    Query(query): Query<WidgetListQuery>,
    principal: Option<Extension<Principal>>,
    headers: HeaderMap,
) -> Json<Value> {
    let location = query.location.as_deref().unwrap_or(DEFAULT_WIDGET_LOCATION);
    if query.render {
        let ctx = call_context(principal_ref(&principal), &headers);
        let widgets = state.manager.render_widgets(&ctx, Some(location)).await;
        Json(json!({ "widgets": widgets }))
    } else {
        let widgets = state.manager.all_widgets(Some(location)).await;
        Json(json!({ "widgets": widgets }))
    }
}

#[derive(Debug, Deserialize)]
struct MenuQuery {
    location: Option<String>,
}

async fn list_menu(State(state): State<AppState>, Query(query): Query<MenuQuery>) -> Json<Value> {
    Json(json!({ "menu_items": state.manager.menu_items(query.location.as_deref()) }))
}

#[derive(Debug, Deserialize)]
struct WidgetQuery {
    #[serde(default)]
    wrap: bool,
}

async fn render_widget(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(query): Query<WidgetQuery>,
    principal: Option<Extension<Principal>>,
    headers: HeaderMap,
) -> Result<Html<String>, PluginError> {
    let ctx = call_context(principal_ref(&principal), &headers);
    let rendered = state.manager.render_widget(&ctx, &name, &id).await?;

    if query.wrap {
        Ok(Html(card(&rendered.widget.title, &rendered.html)))
    } else {
        Ok(Html(rendered.html))
    }
}

/// Standard card shell around a widget fragment.
fn card(title: &str, body: &str) -> String {
    format!(
        r#"<div class="gk-card-header"><h3 class="gk-card-title">{}</h3></div><div class="gk-card-body">{}</div>"#,
        escape_html(title),
        body
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

async fn enable_plugin(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, PluginError> {
    state.manager.enable(&name).await?;
    Ok(Json(json!({ "status": "enabled" })))
}

async fn disable_plugin(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, PluginError> {
    state.manager.disable(&name).await?;
    Ok(Json(json!({ "status": "disabled" })))
}

/// Accepts a multipart form with the file in the `plugin` field.
async fn upload_plugin(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let (file_name, bytes) = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return bad_request("No file uploaded"),
            Err(e) => return e.into_response(),
        };
        if field.name() != Some("plugin") {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            return bad_request("Invalid filename");
        };
        match field.bytes().await {
            Ok(bytes) => break (file_name, bytes),
            Err(e) => return e.into_response(),
        }
    };

    match state.manager.install(&file_name, bytes.to_vec()).await {
        Ok(installed) => {
            tracing::info!(plugin = %installed.name, upload = %file_name, "Plugin uploaded");
            Json(json!({
                "message": "Plugin uploaded successfully",
                "name": installed.name,
                "path": installed.path,
            }))
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    plugin: Option<String>,
    level: Option<String>,
    limit: Option<String>,
}

/// Filters are exclusive: `plugin` wins over `level`, and `limit` only
/// applies when neither is given.
async fn query_logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    let logs = state.manager.logs();
    let plugin = query.plugin.filter(|p| !p.is_empty());
    let level = query.level.filter(|l| !l.is_empty());

    let entries = if let Some(plugin) = plugin {
        logs.by_plugin(&plugin)
    } else if let Some(level) = level {
        match LogLevel::from_str(&level) {
            Ok(level) => logs.by_level(level),
            Err(e) => return bad_request(e.to_string()),
        }
    } else {
        let limit = query
            .limit
            .and_then(|l| l.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_LOG_LIMIT);
        logs.recent(limit)
    };

    Json(json!({
        "count": entries.len(),
        "total": logs.len(),
        "logs": entries,
    }))
    .into_response()
}

async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    state.manager.logs().clear();
    tracing::info!("Plugin logs cleared");
    Json(json!({ "message": "Plugin logs cleared" }))
}
