//! Routes declared by plugin manifests.
//!
//! Each declared route becomes one axum route whose guards come from the
//! route's middleware tokens. A request is turned into a single JSON object
//! (path params, query params, then body fields, plus `_method` and `_path`)
//! and dispatched to the plugin handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::{middleware, Extension, Json, Router};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};

use super::api::json_bytes;
use super::auth::{require_admin, require_auth, Principal};
use super::{call_context, AppState};
use crate::plugin::{html_fragment, BoundRoute, Middleware};

/// Prefix owned by the management API. Plugins cannot register under it.
const RESERVED_PREFIX: &str = "/plugins";

#[derive(Debug)]
struct RouteBinding {
    plugin: String,
    handler: String,
}

/// Build a router holding every registrable plugin route.
///
/// Routes that cannot be mounted are skipped with a warning: paths under the
/// reserved prefix, a repeated method and path, or a path the router would
/// refuse next to `mounted` or an earlier plugin route. Returns the router and
/// the number of routes registered.
pub(super) fn plugin_routes(
    routes: &[BoundRoute],
    mounted: &[&str],
) -> (Router<AppState>, usize) {
    let mut router = Router::new();
    let mut matcher = matchit::Router::new();
    for path in mounted {
        if let Err(e) = matcher.insert(*path, ()) {
            tracing::debug!(path = %path, error = %e, "Mounted path rejected by route matcher");
        }
    }
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut paths: HashSet<String> = HashSet::new();
    let mut registered = 0;

    for bound in routes {
        let spec = &bound.route;
        let plugin = bound.plugin_name.as_str();

        let path = spec.path.clone();
        if let Err(reason) = check_params(&path) {
            tracing::warn!(plugin, path = %path, "Skipping plugin route: {}", reason);
            continue;
        }
        let reserved = path
            .strip_prefix(RESERVED_PREFIX)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if reserved {
            tracing::warn!(plugin, path = %path, "Skipping plugin route under reserved prefix");
            continue;
        }

        let method = spec.method.to_ascii_uppercase();
        let Some(filter) = method_filter(&method) else {
            tracing::warn!(plugin, method = %spec.method, "Skipping plugin route with unsupported method");
            continue;
        };
        let guards = match spec.guards() {
            Ok(guards) => guards,
            Err(e) => {
                tracing::warn!(plugin, path = %path, error = %e, "Skipping plugin route");
                continue;
            }
        };

        if seen.contains(&(method.clone(), path.clone())) {
            tracing::warn!(plugin, method = %method, path = %path, "Skipping duplicate plugin route");
            continue;
        }
        // axum panics on a path its matcher rejects, so try the insert first.
        if !paths.contains(&path) {
            if let Err(e) = matcher.insert(path.clone(), ()) {
                tracing::warn!(plugin, path = %path, error = %e, "Skipping conflicting plugin route");
                continue;
            }
            paths.insert(path.clone());
        }
        seen.insert((method.clone(), path.clone()));

        let binding = Arc::new(RouteBinding {
            plugin: plugin.to_string(),
            handler: spec.handler.clone(),
        });
        router = router.route(&path, guarded(on(filter, handler_for(binding)), &guards));

        tracing::debug!(plugin, method = %method, path = %path, handler = %spec.handler, "Registered plugin route");
        registered += 1;
    }

    (router, registered)
}

fn guarded(
    mut route: MethodRouter<AppState>,
    guards: &[Middleware],
) -> MethodRouter<AppState> {
    if guards.contains(&Middleware::Admin) {
        route = route.route_layer(middleware::from_fn(require_admin));
    } else if guards.contains(&Middleware::Auth) {
        route = route.route_layer(middleware::from_fn(require_auth));
    }
    route
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "DELETE" => Some(MethodFilter::DELETE),
        "PATCH" => Some(MethodFilter::PATCH),
        _ => None,
    }
}

/// Manifest validation already checks segment syntax. The router additionally
/// needs parameter names to be unique within a path.
fn check_params(path: &str) -> Result<(), &'static str> {
    let mut names = HashSet::new();
    for segment in path.split('/') {
        if let Some(name) = segment.strip_prefix(':').or_else(|| segment.strip_prefix('*')) {
            if !names.insert(name) {
                return Err("path parameters must be unique");
            }
        }
    }
    Ok(())
}

/// Request data a plugin route forwards to its handler.
struct Inbound {
    params: HashMap<String, String>,
    query: Vec<(String, String)>,
    principal: Option<Principal>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

fn handler_for(
    binding: Arc<RouteBinding>,
) -> impl Fn(
    State<AppState>,
    Option<Path<HashMap<String, String>>>,
    Query<Vec<(String, String)>>,
    Option<Extension<Principal>>,
    Method,
    Uri,
    HeaderMap,
    Bytes,
) -> BoxFuture<'static, Response>
       + Clone
       + Send
       + Sync
       + 'static {
    move |State(state), params, Query(query), principal, method, uri, headers, body| {
        let inbound = Inbound {
            params: params.map(|Path(p)| p).unwrap_or_default(),
            query,
            principal: principal.map(|Extension(p)| p),
            method,
            uri,
            headers,
            body,
        };
        dispatch(state, binding.clone(), inbound).boxed()
    }
}

async fn dispatch(state: AppState, binding: Arc<RouteBinding>, inbound: Inbound) -> Response {
    let args = match build_args(
        inbound.params,
        inbound.query,
        &inbound.body,
        &inbound.method,
        inbound.uri.path(),
    ) {
        Ok(args) => args,
        Err(response) => return response,
    };

    let ctx = call_context(inbound.principal.as_ref(), &inbound.headers);
    let args = args.to_string();
    match state.manager.call(&ctx, &binding.plugin, &binding.handler, args.as_bytes()).await {
        Ok(output) => match html_fragment(&output) {
            Some(html) => Html(html).into_response(),
            None => json_bytes(output),
        },
        Err(e) => e.into_response(),
    }
}

/// Merge request data into the call argument. Later sources win on key clashes.
fn build_args(
    params: HashMap<String, String>,
    query: Vec<(String, String)>,
    body: &[u8],
    method: &Method,
    path: &str,
) -> Result<Value, Response> {
    let mut args = Map::new();

    for (key, value) in params {
        args.insert(key, Value::String(value));
    }

    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in query {
        match grouped.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => grouped.push((key, vec![value])),
        }
    }
    for (key, mut values) in grouped {
        let value = if values.len() == 1 {
            Value::String(values.remove(0))
        } else {
            Value::Array(values.into_iter().map(Value::String).collect())
        };
        args.insert(key, value);
    }

    if !body.is_empty() {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => args.extend(fields),
            Ok(_) => {}
            Err(_) => {
                let body = Json(json!({ "error": "request body must be JSON", "kind": "bad_request" }));
                return Err((StatusCode::BAD_REQUEST, body).into_response());
            }
        }
    }

    args.insert("_method".to_string(), Value::String(method.as_str().to_string()));
    args.insert("_path".to_string(), Value::String(path.to_string()));
    Ok(Value::Object(args))
}
