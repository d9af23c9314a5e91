//! Request authentication and the `auth`/`admin` route guards.
//!
//! A single outer layer resolves the bearer token of every request into a
//! [`Principal`] stored in the request extensions. Guards only inspect that
//! extension, so they can be stacked per route without re-authenticating.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::core::AuthConfig;

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub admin: bool,
    /// Preferred language, overriding `Accept-Language`.
    pub language: Option<String>,
}

/// Session layer: turns a bearer token into a principal.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Principal>;
}

/// Authenticator backed by the static token list of the configuration.
#[derive(Debug, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl TokenAuthenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .filter(|t| !t.token.is_empty())
            .map(|t| {
                let principal = Principal {
                    user: t.user.clone(),
                    admin: t.admin,
                    language: t.language.clone(),
                };
                (t.token.clone(), principal)
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).cloned()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim()).filter(|t| !t.is_empty())
}

/// Primary language tag of an `Accept-Language` header, e.g. `de` for `de-DE,de;q=0.9`.
pub(crate) fn accept_language(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::ACCEPT_LANGUAGE)?.to_str().ok()?;
    let first = value.split(',').next()?.split(';').next()?.trim();
    let primary = first.split('-').next()?.trim().to_ascii_lowercase();
    (!primary.is_empty() && primary != "*").then_some(primary)
}

/// Resolve the caller, if any. Never rejects.
pub async fn resolve_principal(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let principal = bearer_token(request.headers()).and_then(|t| state.auth.authenticate(t));
    if let Some(principal) = principal {
        request.extensions_mut().insert(principal);
    }
    next.run(request).await
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Require an authenticated session.
pub async fn require_auth(request: Request, next: Next) -> Response {
    if request.extensions().get::<Principal>().is_none() {
        return reject(StatusCode::UNAUTHORIZED, "authentication required");
    }
    next.run(request).await
}

/// Require an authenticated session with the admin capability.
pub async fn require_admin(request: Request, next: Next) -> Response {
    match request.extensions().get::<Principal>() {
        None => reject(StatusCode::UNAUTHORIZED, "authentication required"),
        Some(p) if !p.admin => {
            tracing::debug!(user = %p.user, path = %request.uri().path(), "Admin access denied");
            reject(StatusCode::FORBIDDEN, "admin access required")
        }
        Some(_) => next.run(request).await,
    }
}

pub(crate) fn shared(config: &AuthConfig) -> Arc<dyn Authenticator> {
    let auth = TokenAuthenticator::from_config(config);
    if auth.is_empty() {
        tracing::warn!("No API tokens configured; every protected endpoint will reject requests");
    }
    Arc::new(auth)
}
