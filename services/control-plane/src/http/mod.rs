//! HTTP surface: route table, handlers, auth middleware, error envelopes.

pub mod agents;
pub mod auth;
pub mod execute;
pub mod executions;
pub mod response;
pub mod settings;
pub mod sse;

use crate::state::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/execute/{target}", post(execute::execute_sync))
        .route("/execute/async/{target}", post(execute::execute_async))
        .route("/executions/summary", get(executions::list_summary))
        .route("/executions/stats", get(executions::stats))
        .route("/executions/enhanced", get(executions::list_enhanced))
        .route("/executions/events", get(sse::execution_events))
        .route("/executions/{id}", get(executions::get_execution))
        .route("/executions/{id}/retry", post(execute::retry_execution))
        .route(
            "/executions/{id}/webhook/retry",
            post(execute::retry_webhook),
        )
        .route("/executions/{id}/callback", post(execute::execution_callback))
        .route("/workflows/{id}/notes/events", get(sse::run_note_events))
        .route("/agents", get(agents::list_agents))
        .route("/agents/register", post(agents::register_agent))
        .route("/agents/{id}/heartbeat", post(agents::agent_heartbeat))
        .route("/agents/{id}/status", get(agents::agent_status))
        .route(
            "/agents/{id}/status/refresh",
            post(agents::refresh_agent_status),
        )
        .route(
            "/settings/observability-webhook",
            get(settings::get_webhook)
                .post(settings::set_webhook)
                .delete(settings::delete_webhook),
        )
        .route(
            "/settings/observability-webhook/status",
            get(settings::forwarder_status),
        )
        .route(
            "/settings/observability-webhook/redrive",
            post(settings::redrive),
        )
        .route(
            "/settings/observability-webhook/dlq",
            get(settings::list_dlq).delete(settings::clear_dlq),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
