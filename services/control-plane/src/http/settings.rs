//! Observability webhook settings: config CRUD, forwarder status, redrive,
//! and dead-letter queue endpoints.

use crate::state::AppState;
use ap_protocol::{WebhookConfig, WebhookConfigView};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::response::{bad_request, internal_error, not_found, store_error};

/// Largest accepted DLQ page.
const MAX_DLQ_LIMIT: i64 = 1000;
const DEFAULT_DLQ_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// `GET /settings/observability-webhook`
pub async fn get_webhook(State(state): State<AppState>) -> Response {
    match state.store.lock().await.get_webhook() {
        Ok(Some(config)) => Json(WebhookConfigView::from(&config)).into_response(),
        Ok(None) => not_found("no observability webhook configured"),
        Err(e) => store_error(&e),
    }
}

/// `POST /settings/observability-webhook`: upsert the singleton config.
pub async fn set_webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Response {
    if request.url.is_empty() {
        return bad_request("webhook url must not be empty");
    }
    if !(request.url.starts_with("http://") || request.url.starts_with("https://")) {
        return bad_request("webhook url scheme must be http or https");
    }
    let now = Utc::now();
    let config = WebhookConfig {
        url: request.url,
        secret: request.secret,
        headers: request.headers,
        enabled: request.enabled,
        created_at: now,
        updated_at: now,
    };
    let stored = match state.store.lock().await.set_webhook(&config) {
        Ok(stored) => stored,
        Err(e) => return store_error(&e),
    };
    if let Err(e) = state.forwarder.reload_config().await {
        return internal_error(e);
    }
    Json(WebhookConfigView::from(&stored)).into_response()
}

/// `DELETE /settings/observability-webhook`
pub async fn delete_webhook(State(state): State<AppState>) -> Response {
    let existed = match state.store.lock().await.delete_webhook() {
        Ok(existed) => existed,
        Err(e) => return store_error(&e),
    };
    if let Err(e) = state.forwarder.reload_config().await {
        return internal_error(e);
    }
    if existed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found("no observability webhook configured")
    }
}

/// `GET /settings/observability-webhook/status`
pub async fn forwarder_status(State(state): State<AppState>) -> Response {
    match state.forwarder.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => store_error(&e),
    }
}

/// `POST /settings/observability-webhook/redrive`
pub async fn redrive(State(state): State<AppState>) -> Response {
    let report = state.forwarder.redrive(&state.shutdown).await;
    Json(report).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `GET /settings/observability-webhook/dlq?limit=N&offset=M`
pub async fn list_dlq(State(state): State<AppState>, Query(query): Query<DlqQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_DLQ_LIMIT).clamp(1, MAX_DLQ_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);
    let store = state.store.lock().await;
    let entries = match store.list_dlq(limit, offset) {
        Ok(entries) => entries,
        Err(e) => return store_error(&e),
    };
    let total = match store.count_dlq() {
        Ok(total) => total,
        Err(e) => return store_error(&e),
    };
    drop(store);
    Json(serde_json::json!({
        "entries": entries,
        "limit": limit,
        "offset": offset,
        "total": total,
    }))
    .into_response()
}

/// `DELETE /settings/observability-webhook/dlq`
pub async fn clear_dlq(State(state): State<AppState>) -> Response {
    match state.store.lock().await.clear_dlq() {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(e) => store_error(&e),
    }
}
