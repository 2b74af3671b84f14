//! Agent node surface: registration, heartbeats, listing, and status reads.
//!
//! Registration and heartbeats feed the store and status manager, which in
//! turn broadcast node/reasoner lifecycle events on the buses.

use crate::state::AppState;
use crate::status::StatusUpdate;
use ap_protocol::{
    AgentNode, AgentState, CapabilityDescriptor, HealthStatus, LifecycleStatus, StatusSource,
};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;

use super::response::{bad_request, status_error, store_error};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub reasoners: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub skills: Vec<CapabilityDescriptor>,
}

/// `POST /agents/register`
pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    if request.node_id.is_empty() {
        return bad_request("node_id must not be empty");
    }
    if request.base_url.is_empty() {
        return bad_request("base_url must not be empty");
    }
    let node = AgentNode {
        node_id: request.node_id.clone(),
        team_id: request.team_id.unwrap_or_else(|| "default".to_owned()),
        base_url: request.base_url,
        version: request.version.unwrap_or_else(|| "unknown".to_owned()),
        last_heartbeat: Utc::now(),
        health_status: HealthStatus::Active,
        lifecycle_status: LifecycleStatus::Ready,
        reasoners: request.reasoners,
        skills: request.skills,
    };
    if let Err(e) = state.store.lock().await.register_agent(&node) {
        return store_error(&e);
    }
    // Broadcast the registration as a status change so subscribers see
    // node_online / reasoner_online when the node was previously offline.
    let update = StatusUpdate::new(AgentState::Active, StatusSource::Manual)
        .with_reason("agent registered");
    if let Err(e) = state.status.update_status(&node.node_id, update).await {
        return status_error(&e);
    }
    Json(serde_json::json!({
        "status": "registered",
        "node_id": node.node_id,
    }))
    .into_response()
}

/// `POST /agents/{id}/heartbeat`
pub async fn agent_heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Response {
    match state.status.record_heartbeat(&node_id).await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => status_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    pub team_id: Option<String>,
}

/// `GET /agents`
pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> Response {
    let nodes = match state.store.lock().await.list_agents(query.team_id.as_deref()) {
        Ok(nodes) => nodes,
        Err(e) => return store_error(&e),
    };
    let mut agents = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let status = state
            .status
            .get_status_snapshot(&node.node_id, Some(node))
            .await
            .ok();
        agents.push(serde_json::json!({
            "node": node,
            "status": status,
        }));
    }
    Json(serde_json::json!({ "agents": agents })).into_response()
}

/// `GET /agents/{id}/status`: probing read.
pub async fn agent_status(State(state): State<AppState>, Path(node_id): Path<String>) -> Response {
    match state.status.get_status(&node_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => status_error(&e),
    }
}

/// `POST /agents/{id}/status/refresh`: invalidate, re-probe, announce.
pub async fn refresh_agent_status(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Response {
    match state.status.refresh_status(&node_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => status_error(&e),
    }
}
