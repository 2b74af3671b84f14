//! API-key middleware.
//!
//! Accepts the key from `X-API-Key`, then `Authorization: Bearer`, then the
//! `api_key` query parameter (for SSE clients that cannot set headers).
//! Health, metrics, and UI paths plus the configured skip list are always
//! allowed.  With no key configured, authentication is disabled entirely.

use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::response::unauthorized;

/// Path prefixes that never require a key.
const ALWAYS_ALLOWED: &[&str] = &["/healthz", "/readyz", "/metrics", "/ui"];

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub skip_paths: Vec<String>,
}

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth.api_key.as_deref() else {
        return next.run(request).await;
    };
    let path = request.uri().path();
    if is_allowed(path, &state.auth.skip_paths) {
        return next.run(request).await;
    }
    match presented_key(&request) {
        Some(key) if key == expected => next.run(request).await,
        _ => unauthorized("missing or invalid API key"),
    }
}

fn is_allowed(path: &str, skip_paths: &[String]) -> bool {
    ALWAYS_ALLOWED
        .iter()
        .any(|prefix| path.starts_with(prefix))
        || skip_paths.iter().any(|prefix| path.starts_with(prefix))
}

fn presented_key(request: &Request) -> Option<String> {
    if let Some(key) = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.to_owned());
    }
    if let Some(auth) = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_owned());
        }
    }
    query_param(request.uri().query()?, "api_key")
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_prefixes_skip_auth() {
        assert!(is_allowed("/healthz", &[]));
        assert!(is_allowed("/readyz", &[]));
        assert!(is_allowed("/metrics", &[]));
        assert!(is_allowed("/ui/dashboard", &[]));
        assert!(!is_allowed("/executions/summary", &[]));
        assert!(is_allowed("/docs/api", &["/docs".to_owned()]));
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param("api_key=secret-1&foo=bar", "api_key"),
            Some("secret-1".to_owned())
        );
        assert_eq!(
            query_param("foo=bar&api_key=secret-2", "api_key"),
            Some("secret-2".to_owned())
        );
        assert_eq!(query_param("foo=bar", "api_key"), None);
    }
}
