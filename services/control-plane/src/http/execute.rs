//! Execute endpoints: sync dispatch, async enqueue, completion callback,
//! execution retry, and webhook delivery retry.

use crate::controller::{headers, CallContext, ExecuteRequest, ExecutionJob};
use crate::state::AppState;
use ap_protocol::{ExecutionRecord, ExecutionStatus};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use super::executions::ExecutionView;
use super::response::{bad_request, controller_error, queue_saturated};

/// 502 envelope carrying the failed execution's id in `details`.
fn upstream_error_with_execution(execution_id: &str, message: String) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ap_protocol::HttpErrorEnvelope {
            error: "upstream_error".to_owned(),
            message: Some(message),
            details: Some(serde_json::json!({ "execution_id": execution_id })),
        }),
    )
        .into_response()
}

fn call_context(headers_map: &HeaderMap) -> CallContext {
    let header = |name: &str| {
        headers_map
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    CallContext {
        run_id: header(headers::RUN_ID),
        parent_execution_id: header(headers::PARENT_EXECUTION_ID),
        session_id: header(headers::SESSION_ID),
        actor_id: header(headers::ACTOR_ID),
    }
}

/// `POST /execute/{target}`: dispatch and wait for the outcome.
pub async fn execute_sync(
    State(state): State<AppState>,
    Path(target): Path<String>,
    headers_map: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let ctx = call_context(&headers_map);
    let prepared = match state.controller.prepare(&target, ctx, request).await {
        Ok(prepared) => prepared,
        Err(e) => return controller_error(&e),
    };
    match state.controller.dispatch(&prepared.plan).await {
        Ok(record) => sync_outcome_response(&state, record).await,
        Err(e) => controller_error(&e),
    }
}

async fn sync_outcome_response(state: &AppState, record: ExecutionRecord) -> Response {
    match record.status {
        ExecutionStatus::Succeeded | ExecutionStatus::Cancelled => {
            let result = state
                .controller
                .resolve_payload(record.result_payload.as_deref(), record.result_uri.as_deref())
                .await;
            Json(ExecutionView::from_record(&record, None, result)).into_response()
        }
        ExecutionStatus::Failed => {
            let message = record
                .error_message
                .clone()
                .unwrap_or_else(|| "execution failed".to_owned());
            upstream_error_with_execution(&record.execution_id, message)
        }
        // Still running after the wait window (or queued): async acknowledgement.
        ExecutionStatus::Pending | ExecutionStatus::Queued | ExecutionStatus::Running => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "execution_id": record.execution_id,
                "status": record.status,
            })),
        )
            .into_response(),
    }
}

/// `POST /execute/async/{target}`: enqueue onto the worker pool.
pub async fn execute_async(
    State(state): State<AppState>,
    Path(target): Path<String>,
    headers_map: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let ctx = call_context(&headers_map);
    let prepared = match state.controller.prepare(&target, ctx, request).await {
        Ok(prepared) => prepared,
        Err(e) => return controller_error(&e),
    };

    let execution_id = prepared.record.execution_id.clone();
    if !state.pool.submit(ExecutionJob {
        plan: prepared.plan,
    }) {
        let _ = state
            .controller
            .fail_execution(&execution_id, "async execution queue is full")
            .await;
        return queue_saturated("async execution queue is full");
    }

    let mut body = serde_json::json!({
        "execution_id": execution_id,
        "webhook_registered": prepared.record.webhook_registered,
    });
    if let Some(webhook_error) = &prepared.record.webhook_error {
        body["webhook_error"] = serde_json::Value::String(webhook_error.clone());
    }
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

/// Agent completion callback for async dispatches.
#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `POST /executions/{id}/callback`
pub async fn execution_callback(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(body): Json<CallbackRequest>,
) -> Response {
    let Some(status) = ExecutionStatus::parse(&body.status) else {
        return bad_request(format!("unknown status '{}'", body.status));
    };
    match state
        .controller
        .handle_callback(&execution_id, status, body.result, body.error)
        .await
    {
        Ok(record) => Json(serde_json::json!({
            "execution_id": record.execution_id,
            "status": record.status,
        }))
        .into_response(),
        Err(e) => controller_error(&e),
    }
}

/// `POST /executions/{id}/retry`: fresh dispatch of a terminal execution.
pub async fn retry_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Response {
    let (record, job) = match state.controller.retry_execution(&execution_id).await {
        Ok(outcome) => outcome,
        Err(e) => return controller_error(&e),
    };
    if !state.pool.submit(job) {
        let _ = state
            .controller
            .fail_execution(&record.execution_id, "async execution queue is full")
            .await;
        return queue_saturated("async execution queue is full");
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "execution_id": record.execution_id,
            "status": record.status,
            "retry_count": record.retry_count,
        })),
    )
        .into_response()
}

/// `POST /executions/{id}/webhook/retry`: re-enqueue webhook delivery.
pub async fn retry_webhook(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Response {
    match state.controller.retry_webhook(&execution_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "execution_id": execution_id,
                "status": "queued",
            })),
        )
            .into_response(),
        Err(e) => controller_error(&e),
    }
}
