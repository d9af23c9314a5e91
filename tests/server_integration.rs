//! HTTP API integration tests.
//!
//! Builds the full router over a temporary plugin directory and drives it
//! with `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{entries, greeter_module, install_dir, package_bytes, Guest, GREETER_MANIFEST};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use wasmhost::core::{AuthConfig, TokenConfig};
use wasmhost::plugin::ManagerOptions;
use wasmhost::server::{self, AppState, TokenAuthenticator};
use wasmhost::{ModuleStore, PluginManager};

const ADMIN: &str = "admin-token";
const USER: &str = "user-token";

struct Host {
    dir: TempDir,
    manager: Arc<PluginManager>,
    app: Router,
}

async fn host(setup: impl FnOnce(&std::path::Path)) -> Host {
    let dir = TempDir::new().unwrap();
    setup(dir.path());

    let manager = PluginManager::new(ModuleStore::new(dir.path()), ManagerOptions::default())
        .unwrap()
        .into_shared();
    let auth = AuthConfig {
        tokens: vec![
            TokenConfig { token: ADMIN.into(), user: "root".into(), admin: true, language: None },
            TokenConfig {
                token: USER.into(),
                user: "alice".into(),
                admin: false,
                language: Some("de".into()),
            },
        ],
    };
    let state = AppState::new(manager.clone(), Arc::new(TokenAuthenticator::from_config(&auth)))
        .with_max_upload(1024 * 1024);
    let app = server::router(state).await;
    Host { dir, manager, app }
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(body).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn get(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, String) {
    send(app, request(Method::GET, uri, token, Body::empty())).await
}

async fn post(app: &Router, uri: &str, token: Option<&str>, body: &str) -> (StatusCode, String) {
    send(app, request(Method::POST, uri, token, Body::from(body.to_string()))).await
}

fn multipart(field: &str, file_name: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let boundary = "wasmhost-test-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

async fn upload(app: &Router, token: &str, file_name: &str, bytes: &[u8]) -> (StatusCode, String) {
    let (content_type, body) = multipart("plugin", file_name, bytes);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/plugins/upload")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap();
    send(app, request).await
}

#[tokio::test]
async fn test_uploaded_package_renders_widget() {
    let host = host(|_| {}).await;

    let package = package_bytes(GREETER_MANIFEST, &greeter_module());
    let (status, body) = upload(&host.app, ADMIN, "greeter.zip", &package).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["message"], "Plugin uploaded successfully");
    assert_eq!(reply["name"], "greeter");

    let (status, body) = get(&host.app, "/plugins/greeter/widgets/hello", Some(USER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<b>hi</b>");
}

#[tokio::test]
async fn test_widget_wrap_shell() {
    let host = host(|dir| {
        install_dir(dir, GREETER_MANIFEST, &greeter_module());
    })
    .await;

    let (status, body) =
        get(&host.app, "/plugins/greeter/widgets/hello?wrap=true", Some(USER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        r#"<div class="gk-card-header"><h3 class="gk-card-title">Hello</h3></div><div class="gk-card-body"><b>hi</b></div>"#
    );

    let (status, _) = get(&host.app, "/plugins/greeter/widgets/missing", Some(USER)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disabled_plugin_call_is_forbidden() {
    let host = host(|dir| {
        install_dir(dir, GREETER_MANIFEST, &greeter_module());
    })
    .await;

    let (status, body) = post(&host.app, "/plugins/greeter/disable", Some(ADMIN), "").await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = post(&host.app, "/plugins/greeter/call/render", Some(USER), "{}").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["kind"], "disabled");

    let (status, _) = post(&host.app, "/plugins/greeter/enable", Some(ADMIN), "").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = post(&host.app, "/plugins/greeter/call/render", Some(USER), "{}").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"html":"<b>hi</b>"}"#);
}

#[tokio::test]
async fn test_upload_without_manifest_is_rejected() {
    let host = host(|_| {}).await;
    let before = entries(host.dir.path());

    let archive = {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("greeter.wasm", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&greeter_module()).unwrap();
        writer.finish().unwrap().into_inner()
    };

    let (status, body) = upload(&host.app, ADMIN, "greeter.zip", &archive).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(entries(host.dir.path()), before);
}

#[tokio::test]
async fn test_upload_rejects_other_extensions_and_fields() {
    let host = host(|_| {}).await;

    let (status, _) = upload(&host.app, ADMIN, "payload.sh", b"#!/bin/sh").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (content_type, body) = multipart("file", "greeter.wasm", &greeter_module());
    let request = Request::builder()
        .method(Method::POST)
        .uri("/plugins/upload")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN}"))
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(&host.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(entries(host.dir.path()).is_empty());
}

#[tokio::test]
async fn test_standalone_upload_strips_directories() {
    let host = host(|_| {}).await;
    let module = Guest::new()
        .register(r#"{"name": "echoer", "version": "1.0.0"}"#)
        .echo("echo")
        .build();

    let (status, body) = upload(&host.app, ADMIN, "../../echoer.wasm", &module).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(entries(host.dir.path()), vec!["echoer.wasm"]);

    let (status, body) = post(&host.app, "/plugins/echoer/call/echo", Some(USER), r#"{"a":1}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"a":1}"#);
}

#[tokio::test]
async fn test_authentication_required() {
    let host = host(|dir| {
        install_dir(dir, GREETER_MANIFEST, &greeter_module());
    })
    .await;

    let (status, _) = get(&host.app, "/plugins", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&host.app, "/plugins", Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post(&host.app, "/plugins/greeter/disable", Some(USER), "").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = get(&host.app, "/plugins/logs", Some(USER)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert_eq!(host.manager.is_enabled("greeter"), Some(true));
}

#[tokio::test]
async fn test_list_and_not_found() {
    let host = host(|dir| {
        install_dir(dir, GREETER_MANIFEST, &greeter_module());
    })
    .await;

    let (status, body) = get(&host.app, "/plugins", Some(USER)).await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_str(&body).unwrap();
    let plugins = reply["plugins"].as_array().unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0]["name"], "greeter");
    assert_eq!(plugins[0]["loaded"], true);
    assert_eq!(plugins[0]["enabled"], true);

    let (status, _) = post(&host.app, "/plugins/ghost/call/render", Some(USER), "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(&host.app, "/plugins/greeter/call/nope", Some(USER), "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(&host.app, "/plugins/greeter/call/render", Some(USER), "{oops").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_widget_listing() {
    let host = host(|dir| {
        install_dir(dir, GREETER_MANIFEST, &greeter_module());
    })
    .await;

    let (status, body) = get(&host.app, "/plugins/widgets", Some(USER)).await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["widgets"][0]["plugin_name"], "greeter");
    assert_eq!(reply["widgets"][0]["id"], "hello");

    let (_, body) = get(&host.app, "/plugins/widgets?location=sidebar", Some(USER)).await;
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert!(reply["widgets"].as_array().unwrap().is_empty());

    let (_, body) = get(&host.app, "/plugins/widgets?render=true", Some(USER)).await;
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["widgets"][0]["html"], "<b>hi</b>");
}

#[tokio::test]
async fn test_log_endpoints() {
    let host = host(|dir| {
        install_dir(dir, GREETER_MANIFEST, &greeter_module());
    })
    .await;

    post(&host.app, "/plugins/greeter/call/render", Some(USER), "{}").await;
    post(&host.app, "/plugins/greeter/call/nope", Some(USER), "{}").await;

    let (status, body) = get(&host.app, "/plugins/logs?plugin=greeter", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_str(&body).unwrap();
    let count = reply["count"].as_u64().unwrap();
    assert!(count >= 2);
    assert_eq!(reply["total"].as_u64().unwrap(), host.manager.logs().len() as u64);

    // The plugin filter wins over the level filter.
    let (_, body) = get(&host.app, "/plugins/logs?plugin=greeter&level=error", Some(ADMIN)).await;
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["count"].as_u64().unwrap(), count);

    let (_, body) = get(&host.app, "/plugins/logs?level=error", Some(ADMIN)).await;
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["count"], 1);
    assert_eq!(reply["logs"][0]["error_kind"], "function_not_found");

    let (_, body) = get(&host.app, "/plugins/logs?limit=1", Some(ADMIN)).await;
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["count"], 1);

    let (status, _) = get(&host.app, "/plugins/logs?level=loud", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        send(&host.app, request(Method::DELETE, "/plugins/logs", Some(ADMIN), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Plugin logs cleared"));
    assert!(host.manager.logs().is_empty());
}

const TICKETS_MANIFEST: &str = r#"{
    "name": "tickets",
    "version": "1.0.0",
    "routes": [
        {"method": "GET", "path": "/tickets/:id", "handler": "show"},
        {"method": "POST", "path": "/tickets/:id", "handler": "echo", "middleware": ["auth"]},
        {"method": "DELETE", "path": "/tickets/:id", "handler": "echo", "middleware": ["admin"]},
        {"method": "GET", "path": "/plugins/hijack", "handler": "show"}
    ]
}"#;

fn tickets_module() -> Vec<u8> {
    Guest::new().html("show", "<p>ticket</p>").echo("echo").build()
}

#[tokio::test]
async fn test_plugin_routes() {
    let host = host(|dir| {
        install_dir(dir, TICKETS_MANIFEST, &tickets_module());
    })
    .await;

    // Public route returning an html field is served as HTML.
    let response = host
        .app
        .clone()
        .oneshot(request(Method::GET, "/tickets/7", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));

    // Guarded route echoes the merged arguments as JSON.
    let (status, _) = post(&host.app, "/tickets/7?tag=a&tag=b", None, "{}").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) =
        post(&host.app, "/tickets/7?tag=a&tag=b", Some(USER), r#"{"note":"hi"}"#).await;
    assert_eq!(status, StatusCode::OK);
    let args: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(args["id"], "7");
    assert_eq!(args["tag"], serde_json::json!(["a", "b"]));
    assert_eq!(args["note"], "hi");
    assert_eq!(args["_method"], "POST");
    assert_eq!(args["_path"], "/tickets/7");

    let (status, _) =
        send(&host.app, request(Method::DELETE, "/tickets/7", Some(USER), Body::empty())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) =
        send(&host.app, request(Method::DELETE, "/tickets/7", Some(ADMIN), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);

    // Reserved prefix was not taken over.
    let (status, _) = get(&host.app, "/plugins/hijack", Some(USER)).await;
    assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_conflicting_plugin_routes_do_not_stop_the_host() {
    let host = host(|dir| {
        install_dir(dir, TICKETS_MANIFEST, &tickets_module());
        install_dir(
            dir,
            r#"{"name": "tracker", "routes": [
                {"method": "GET", "path": "/tickets/:ticket_id/notes", "handler": "show"},
                {"method": "GET", "path": "/notes/:id", "handler": "show"},
                {"method": "GET", "path": "/notes/*rest", "handler": "show"}
            ]}"#,
            &Guest::new().html("show", "<p>notes</p>").build(),
        );
    })
    .await;

    let (status, body) = get(&host.app, "/tickets/7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<p>ticket</p>");

    let (status, body) = get(&host.app, "/notes/3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<p>notes</p>");

    let (status, _) = get(&host.app, "/tickets/7/notes", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_that_cannot_load_keeps_current_version() {
    let host = host(|dir| {
        install_dir(dir, GREETER_MANIFEST, &greeter_module());
    })
    .await;
    let (status, _) = get(&host.app, "/plugins/greeter/widgets/hello", Some(USER)).await;
    assert_eq!(status, StatusCode::OK);

    // Declares `render` but exports something else.
    let v2 = GREETER_MANIFEST.replace("1.0.0", "2.0.0");
    let broken = package_bytes(&v2, &Guest::new().html("paint", "<i>v2</i>").build());
    let (status, body) = upload(&host.app, ADMIN, "greeter.zip", &broken).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, body) = get(&host.app, "/plugins/greeter/widgets/hello", Some(USER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<b>hi</b>");
    assert_eq!(host.manager.get("greeter").unwrap().manifest().version, "1.0.0");

    // A standalone module must register under its own file name.
    let misnamed = Guest::new().register(r#"{"name": "other"}"#).build();
    let (status, _) = upload(&host.app, ADMIN, "greeter.wasm", &misnamed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(entries(host.dir.path()), vec!["greeter"]);
}
