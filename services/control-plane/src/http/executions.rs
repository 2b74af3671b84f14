//! Execution read endpoints: detail, summary, stats, and enhanced views.

use crate::state::AppState;
use crate::store::{ExecutionFilter, ExecutionSort};
use ap_protocol::{ExecutionRecord, ExecutionStatus};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::response::{bad_request, controller_error, store_error};

/// Largest accepted page size.
const MAX_PAGE_SIZE: i64 = 200;
const DEFAULT_PAGE_SIZE: i64 = 50;

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Full execution view with lazily resolved payloads.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub execution_id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    pub node_id: String,
    pub reasoner_id: String,
    pub target_kind: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub webhook_registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_uri: Option<String>,
}

impl ExecutionView {
    pub fn from_record(
        record: &ExecutionRecord,
        input: Option<serde_json::Value>,
        result: Option<serde_json::Value>,
    ) -> Self {
        ExecutionView {
            execution_id: record.execution_id.clone(),
            run_id: record.run_id.clone(),
            parent_execution_id: record.parent_execution_id.clone(),
            node_id: record.target.node_id.clone(),
            reasoner_id: record.target.capability_id.clone(),
            target_kind: match record.target.kind {
                ap_protocol::TargetKind::Reasoner => "reasoner".to_owned(),
                ap_protocol::TargetKind::Skill => "skill".to_owned(),
            },
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_ms: record.duration_ms,
            error_message: record.error_message.clone(),
            retry_count: record.retry_count,
            webhook_registered: record.webhook_registered,
            webhook_error: record.webhook_error.clone(),
            input,
            result,
            input_uri: record.input_uri.clone(),
            result_uri: record.result_uri.clone(),
        }
    }
}

/// Flattened row for list endpoints (no payloads).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub run_id: String,
    pub node_id: String,
    pub reasoner_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i64,
}

impl From<&ExecutionRecord> for ExecutionSummary {
    fn from(record: &ExecutionRecord) -> Self {
        ExecutionSummary {
            execution_id: record.execution_id.clone(),
            run_id: record.run_id.clone(),
            node_id: record.target.node_id.clone(),
            reasoner_id: record.target.capability_id.clone(),
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_ms: record.duration_ms,
            error_message: record.error_message.clone(),
            retry_count: record.retry_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Query parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub node_id: Option<String>,
    pub run_id: Option<String>,
    pub status: Option<String>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub group_by: Option<String>,
}

struct ParsedQuery {
    filter: ExecutionFilter,
    page: i64,
    page_size: i64,
}

fn parse_query(query: &ListQuery) -> Result<ParsedQuery, Response> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let status = match &query.status {
        None => None,
        Some(text) => Some(
            ExecutionStatus::parse(text)
                .ok_or_else(|| bad_request(format!("unknown status '{text}'")))?,
        ),
    };
    let sort = match &query.sort {
        None => ExecutionSort::StartedAt,
        Some(text) => ExecutionSort::parse(text)
            .ok_or_else(|| bad_request(format!("unknown sort field '{text}'")))?,
    };
    let sort_descending = match query.order.as_deref() {
        None => true,
        Some("desc") => true,
        Some("asc") => false,
        Some(other) => return Err(bad_request(format!("order must be asc or desc, got '{other}'"))),
    };

    let filter = ExecutionFilter {
        node_id: query.node_id.clone(),
        run_id: query.run_id.clone(),
        status,
        session_id: query.session_id.clone(),
        actor_id: query.actor_id.clone(),
        start_time: parse_timestamp(query.start_time.as_deref(), "start_time")?,
        end_time: parse_timestamp(query.end_time.as_deref(), "end_time")?,
        sort,
        sort_descending,
        limit: Some(page_size),
        offset: Some((page - 1) * page_size),
    };
    Ok(ParsedQuery {
        filter,
        page,
        page_size,
    })
}

fn parse_timestamp(text: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>, Response> {
    match text {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| bad_request(format!("{field} is not RFC3339: {e}"))),
    }
}

fn total_pages(total: i64, page_size: i64) -> i64 {
    if total == 0 {
        0
    } else {
        (total + page_size - 1) / page_size
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Response {
    match state.controller.execution_detail(&execution_id).await {
        Ok((record, input, result)) => {
            Json(ExecutionView::from_record(&record, input, result)).into_response()
        }
        Err(e) => controller_error(&e),
    }
}

pub async fn list_summary(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let parsed = match parse_query(&query) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let store = state.store.lock().await;
    let records = match store.query_executions(&parsed.filter) {
        Ok(records) => records,
        Err(e) => return store_error(&e),
    };
    let total = match store.count_executions(&parsed.filter) {
        Ok(total) => total,
        Err(e) => return store_error(&e),
    };
    drop(store);

    let executions: Vec<ExecutionSummary> = records.iter().map(ExecutionSummary::from).collect();
    Json(serde_json::json!({
        "executions": executions,
        "page": parsed.page,
        "page_size": parsed.page_size,
        "total": total,
        "total_pages": total_pages(total, parsed.page_size),
    }))
    .into_response()
}

pub async fn stats(State(state): State<AppState>) -> Response {
    match state.store.lock().await.execution_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_error(&e),
    }
}

/// Allowed `group_by` keys for the enhanced view.  Anything else is a
/// validation error rather than an implicit catch-all bucket.
const GROUP_KEYS: &[&str] = &["run_id", "node_id", "status", "reasoner_id"];

pub async fn list_enhanced(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Some(group_by) = query.group_by.as_deref() {
        if !GROUP_KEYS.contains(&group_by) {
            return bad_request(format!(
                "unknown group_by '{group_by}' (expected one of: {})",
                GROUP_KEYS.join(", ")
            ));
        }
    }
    let parsed = match parse_query(&query) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let store = state.store.lock().await;
    let records = match store.query_executions(&parsed.filter) {
        Ok(records) => records,
        Err(e) => return store_error(&e),
    };
    let total = match store.count_executions(&parsed.filter) {
        Ok(total) => total,
        Err(e) => return store_error(&e),
    };
    drop(store);

    let views: Vec<ExecutionView> = records
        .iter()
        .map(|record| ExecutionView::from_record(record, None, None))
        .collect();

    let page_meta = serde_json::json!({
        "page": parsed.page,
        "page_size": parsed.page_size,
        "total": total,
        "total_pages": total_pages(total, parsed.page_size),
    });

    match query.group_by.as_deref() {
        None => {
            let mut body = serde_json::json!({ "executions": views });
            merge(&mut body, &page_meta);
            Json(body).into_response()
        }
        Some(group_by) => {
            let mut groups: BTreeMap<String, Vec<&ExecutionView>> = BTreeMap::new();
            for view in &views {
                let key = match group_by {
                    "run_id" => view.run_id.clone(),
                    "node_id" => view.node_id.clone(),
                    "status" => view.status.as_str().to_owned(),
                    "reasoner_id" => view.reasoner_id.clone(),
                    _ => unreachable!("validated above"),
                };
                groups.entry(key).or_default().push(view);
            }
            let mut body = serde_json::json!({ "groups": groups, "group_by": group_by });
            merge(&mut body, &page_meta);
            Json(body).into_response()
        }
    }
}

fn merge(target: &mut serde_json::Value, extra: &serde_json::Value) {
    if let (Some(target), Some(extra)) = (target.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
}
