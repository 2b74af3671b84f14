//! Execution controller: admission, dispatch to agent nodes, status
//! reconciliation, and result persistence.
//!
//! # Dispatch protocol
//! `POST {base_url}/reasoners/{id}` (or `/skills/{id}`) with the execution
//! context in `X-*` headers and `{"input": ...}` as the body.
//! - `2xx` with a body: the execution succeeds with that result.
//! - `202`: the agent acknowledged async work; the controller keeps the
//!   record `running` and waits on the execution bus for the terminal event
//!   (delivered by the agent's completion callback).
//! - `4xx`/`5xx`/transport error: the execution fails with a descriptive
//!   error message.  The controller never auto-retries an agent call.
//!
//! # State machine
//! `pending -> running -> succeeded | failed | cancelled`.  Terminal states
//! are immutable except for the explicit retry path, which increments
//! `retry_count` and creates a fresh transition back to `pending`.

use crate::bus::EventBus;
use crate::payload::{PayloadError, PayloadStore};
use crate::pool::JobRunner;
use crate::status::StatusManager;
use crate::store::{ExecutionWebhook, SharedStore, StoreError};
use ap_protocol::{
    is_corruption_sentinel, AgentNode, AgentState, ExecutionEvent, ExecutionRecord,
    ExecutionStatus, ExecutionTarget, TargetKind,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Config and request types
// ---------------------------------------------------------------------------

/// Maximum accepted webhook URL length.
const MAX_WEBHOOK_URL_LEN: usize = 4096;

/// How much of an agent error body is attached to the error message.
const ERROR_BODY_LIMIT: usize = 1024;

pub mod headers {
    pub const RUN_ID: &str = "X-Run-ID";
    pub const EXECUTION_ID: &str = "X-Execution-ID";
    pub const PARENT_EXECUTION_ID: &str = "X-Parent-Execution-ID";
    pub const SESSION_ID: &str = "X-Session-ID";
    pub const ACTOR_ID: &str = "X-Actor-ID";
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Deadline for one agent dispatch call.
    pub dispatch_timeout: Duration,
    /// How long a sync caller waits for the terminal event after a 202 ack.
    pub async_wait_timeout: Duration,
    /// Payloads above this size go to the payload store.
    pub inline_threshold: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            dispatch_timeout: Duration::from_secs(60),
            async_wait_timeout: Duration::from_secs(120),
            inline_threshold: 256 * 1024,
        }
    }
}

/// Body of the execute endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookRegistration>,
}

/// Optional per-execution webhook carried in the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Caller-provided execution context (from `X-*` request headers).
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub run_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
}

/// Everything a worker needs to dispatch one execution.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub execution_id: String,
    pub dispatch_url: String,
    pub run_id: String,
    pub parent_execution_id: Option<String>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
    pub input: serde_json::Value,
}

/// A queued async dispatch job.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub plan: DispatchPlan,
}

/// A prepared (admitted and persisted) execution, ready to dispatch.
pub struct Prepared {
    pub record: ExecutionRecord,
    pub plan: DispatchPlan,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotReady(String),
    #[error("{0}")]
    Validation(String),
    #[error("internal invariant violation: {0}")]
    Invariant(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

// ---------------------------------------------------------------------------
// Webhook dispatcher collaborator
// ---------------------------------------------------------------------------

/// External per-execution webhook dispatcher.  The controller only notifies
/// it; delivery and retry policy live on the other side of this seam.
pub trait WebhookDispatcher: Send + Sync {
    fn notify(&self, execution_id: &str);
}

/// Default dispatcher used until a real one is wired in: records the
/// notification in the log and nothing else.
pub struct LoggingWebhookDispatcher;

impl WebhookDispatcher for LoggingWebhookDispatcher {
    fn notify(&self, execution_id: &str) {
        debug!(execution_id, "execution webhook delivery queued");
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct ExecutionController {
    store: SharedStore,
    payloads: Arc<PayloadStore>,
    execution_bus: Arc<EventBus<ExecutionEvent>>,
    status: Arc<StatusManager>,
    webhooks: Arc<dyn WebhookDispatcher>,
    http: reqwest::Client,
    cfg: ControllerConfig,
}

impl ExecutionController {
    pub fn new(
        store: SharedStore,
        payloads: Arc<PayloadStore>,
        execution_bus: Arc<EventBus<ExecutionEvent>>,
        status: Arc<StatusManager>,
        webhooks: Arc<dyn WebhookDispatcher>,
        cfg: ControllerConfig,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(cfg.dispatch_timeout)
            .build()?;
        Ok(ExecutionController {
            store,
            payloads,
            execution_bus,
            status,
            webhooks,
            http,
            cfg,
        })
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit a request: resolve the target, check readiness, persist the
    /// `pending` record (input inline or via the payload store), and record
    /// the per-execution webhook when one was supplied.
    pub async fn prepare(
        &self,
        target: &str,
        ctx: CallContext,
        request: ExecuteRequest,
    ) -> Result<Prepared, ControllerError> {
        let (node_id, capability_id) = target.split_once('.').ok_or_else(|| {
            ControllerError::Validation(format!(
                "target '{target}' must be of the form node_id.reasoner_id"
            ))
        })?;

        let node = self.store.lock().await.get_agent(node_id)?;
        let target = resolve_capability(&node, capability_id)?;

        let snapshot = self
            .status
            .get_status_snapshot(node_id, Some(&node))
            .await
            .map_err(|e| ControllerError::Invariant(format!("status snapshot failed: {e}")))?;
        if snapshot.state != AgentState::Active {
            return Err(ControllerError::NotReady(format!(
                "agent node '{node_id}' is not ready (state: {})",
                snapshot.state.as_str()
            )));
        }

        let execution_id = Uuid::new_v4().to_string();
        let run_id = ctx.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();

        let input_bytes = request.input.to_string().into_bytes();
        let (input_payload, input_uri) = if input_bytes.len() > self.cfg.inline_threshold {
            let saved = self.payloads.save_bytes(&input_bytes).await?;
            (None, Some(saved.uri))
        } else {
            (Some(input_bytes), None)
        };

        // An invalid webhook never rejects the execution; the failure is
        // recorded on the record instead.
        let (webhook_registered, webhook_error) = match &request.webhook {
            None => (false, None),
            Some(reg) => match validate_webhook_registration(reg) {
                Ok(()) => {
                    self.store
                        .lock()
                        .await
                        .register_execution_webhook(&ExecutionWebhook {
                            execution_id: execution_id.clone(),
                            url: reg.url.clone(),
                            secret: reg.secret.clone(),
                            headers: reg.headers.clone(),
                            created_at: now,
                        })?;
                    (true, None)
                }
                Err(reason) => (false, Some(reason)),
            },
        };

        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            run_id: run_id.clone(),
            parent_execution_id: ctx.parent_execution_id.clone(),
            target: target.clone(),
            session_id: ctx.session_id.clone(),
            actor_id: ctx.actor_id.clone(),
            input_payload,
            input_uri,
            result_payload: None,
            result_uri: None,
            status: ExecutionStatus::Pending,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            retry_count: 0,
            webhook_registered,
            webhook_error,
        };
        self.store.lock().await.create_execution(&record)?;

        let plan = DispatchPlan {
            execution_id,
            dispatch_url: dispatch_url(&node, &target),
            run_id,
            parent_execution_id: ctx.parent_execution_id,
            session_id: ctx.session_id,
            actor_id: ctx.actor_id,
            input: request.input,
        };
        Ok(Prepared { record, plan })
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run one dispatch to completion and return the resulting record.
    ///
    /// Subscribes to the execution bus before dispatching so a fast agent
    /// callback after a 202 ack cannot be missed.
    pub async fn dispatch(&self, plan: &DispatchPlan) -> Result<ExecutionRecord, ControllerError> {
        let subscriber_id = format!("exec-wait-{}", plan.execution_id);
        let mut rx = self.execution_bus.subscribe(&subscriber_id);
        let result = self.dispatch_inner(plan, &mut rx).await;
        self.execution_bus.unsubscribe(&subscriber_id);
        result
    }

    async fn dispatch_inner(
        &self,
        plan: &DispatchPlan,
        rx: &mut tokio::sync::mpsc::Receiver<ExecutionEvent>,
    ) -> Result<ExecutionRecord, ControllerError> {
        self.mark_running(plan).await?;

        let mut request = self
            .http
            .post(&plan.dispatch_url)
            .timeout(self.cfg.dispatch_timeout)
            .header(headers::RUN_ID, &plan.run_id)
            .header(headers::EXECUTION_ID, &plan.execution_id)
            .json(&serde_json::json!({ "input": plan.input }));
        if let Some(parent) = &plan.parent_execution_id {
            request = request.header(headers::PARENT_EXECUTION_ID, parent);
        }
        if let Some(session) = &plan.session_id {
            request = request.header(headers::SESSION_ID, session);
        }
        if let Some(actor) = &plan.actor_id {
            request = request.header(headers::ACTOR_ID, actor);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("timeout calling agent: {e}")
                } else {
                    format!("agent call failed: {e}")
                };
                return self
                    .complete(
                        &plan.execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(message),
                    )
                    .await;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            // Async acknowledgement: keep the record running and wait for
            // the terminal event published by the completion callback.
            return self.await_completion(plan, rx).await;
        }
        if status.is_success() {
            let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            return self
                .complete(&plan.execution_id, ExecutionStatus::Succeeded, Some(body), None)
                .await;
        }

        let code = status.as_u16();
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            // Cut on a char boundary at or below the limit.
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        let message = if body.is_empty() {
            format!("agent error ({code})")
        } else {
            format!("agent error ({code}): {body}")
        };
        self.complete(&plan.execution_id, ExecutionStatus::Failed, None, Some(message))
            .await
    }

    async fn await_completion(
        &self,
        plan: &DispatchPlan,
        rx: &mut tokio::sync::mpsc::Receiver<ExecutionEvent>,
    ) -> Result<ExecutionRecord, ControllerError> {
        let deadline = tokio::time::Instant::now() + self.cfg.async_wait_timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                // Wait window elapsed: surface whatever state the record is in.
                Err(_) => return Ok(self.store.lock().await.get_execution(&plan.execution_id)?),
                Ok(None) => {
                    return Ok(self.store.lock().await.get_execution(&plan.execution_id)?)
                }
                Ok(Some(event)) => {
                    if event.execution_id() == plan.execution_id && event.status().is_terminal() {
                        return Ok(self.store.lock().await.get_execution(&plan.execution_id)?);
                    }
                }
            }
        }
    }

    async fn mark_running(&self, plan: &DispatchPlan) -> Result<(), ControllerError> {
        let record = self
            .store
            .lock()
            .await
            .update_execution(&plan.execution_id, |record| {
                if record.status.is_terminal() {
                    return Err(StoreError::Validation(format!(
                        "execution is already {}",
                        record.status.as_str()
                    )));
                }
                record.status = ExecutionStatus::Running;
                Ok(())
            })?;
        self.execution_bus.publish(&ExecutionEvent::Started {
            execution_id: record.execution_id.clone(),
            run_id: record.run_id.clone(),
            node_id: record.target.node_id.clone(),
            status: ExecutionStatus::Running,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Drive an execution into a terminal state, persist the result, publish
    /// the terminal event, and notify the webhook dispatcher.
    pub async fn complete(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        result: Option<Vec<u8>>,
        error: Option<String>,
    ) -> Result<ExecutionRecord, ControllerError> {
        if !status.is_terminal() {
            return Err(ControllerError::Invariant(format!(
                "complete() called with non-terminal status '{}'",
                status.as_str()
            )));
        }
        let (result_payload, result_uri) = match result {
            Some(bytes) if bytes.len() > self.cfg.inline_threshold => {
                let saved = self.payloads.save_bytes(&bytes).await?;
                (None, Some(saved.uri))
            }
            Some(bytes) => (Some(bytes), None),
            None => (None, None),
        };

        let now = Utc::now();
        let record = self
            .store
            .lock()
            .await
            .update_execution(execution_id, |record| {
                if !record.status.can_transition_to(status) {
                    return Err(StoreError::Validation(format!(
                        "illegal status transition {} -> {}",
                        record.status.as_str(),
                        status.as_str()
                    )));
                }
                record.status = status;
                record.completed_at = Some(now);
                record.duration_ms = Some((now - record.started_at).num_milliseconds().max(0));
                record.result_payload = result_payload.clone();
                record.result_uri = result_uri.clone();
                record.error_message = error.clone();
                Ok(())
            })?;

        self.publish_terminal(&record);
        if record.webhook_registered {
            self.webhooks.notify(&record.execution_id);
        }
        Ok(record)
    }

    /// Terminal failure helper for saturation and shutdown paths.
    pub async fn fail_execution(
        &self,
        execution_id: &str,
        message: &str,
    ) -> Result<ExecutionRecord, ControllerError> {
        self.complete(
            execution_id,
            ExecutionStatus::Failed,
            None,
            Some(message.to_owned()),
        )
        .await
    }

    /// Apply an agent completion callback (the async-dispatch counterpart of
    /// a 2xx response body).
    pub async fn handle_callback(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<ExecutionRecord, ControllerError> {
        if !status.is_terminal() {
            return Err(ControllerError::Validation(format!(
                "callback status must be terminal, got '{}'",
                status.as_str()
            )));
        }
        let bytes = result.map(|v| v.to_string().into_bytes());
        self.complete(execution_id, status, bytes, error).await
    }

    // -----------------------------------------------------------------------
    // Retry and webhook notification
    // -----------------------------------------------------------------------

    /// Reset a terminal execution back to `pending` for a fresh dispatch.
    /// Returns the updated record and the job to enqueue.
    pub async fn retry_execution(
        &self,
        execution_id: &str,
    ) -> Result<(ExecutionRecord, ExecutionJob), ControllerError> {
        let record = self
            .store
            .lock()
            .await
            .update_execution(execution_id, |record| {
                if !record.status.is_terminal() {
                    return Err(StoreError::Validation(format!(
                        "execution is {} and cannot be retried",
                        record.status.as_str()
                    )));
                }
                record.status = ExecutionStatus::Pending;
                record.retry_count += 1;
                record.completed_at = None;
                record.duration_ms = None;
                record.error_message = None;
                record.result_payload = None;
                record.result_uri = None;
                Ok(())
            })?;
        let plan = self.plan_from_record(&record).await?;
        Ok((record, ExecutionJob { plan }))
    }

    /// Re-enqueue per-execution webhook delivery.
    pub async fn retry_webhook(&self, execution_id: &str) -> Result<(), ControllerError> {
        let store = self.store.lock().await;
        // Surface a 404 for an unknown execution before the webhook check.
        let _record = store.get_execution(execution_id)?;
        if !store.has_execution_webhook(execution_id)? {
            return Err(ControllerError::NotFound(format!(
                "no webhook registered for execution '{execution_id}'"
            )));
        }
        drop(store);
        self.webhooks.notify(execution_id);
        Ok(())
    }

    async fn plan_from_record(
        &self,
        record: &ExecutionRecord,
    ) -> Result<DispatchPlan, ControllerError> {
        let node = self.store.lock().await.get_agent(&record.target.node_id)?;
        let input = self
            .resolve_payload(record.input_payload.as_deref(), record.input_uri.as_deref())
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok(DispatchPlan {
            execution_id: record.execution_id.clone(),
            dispatch_url: dispatch_url(&node, &record.target),
            run_id: record.run_id.clone(),
            parent_execution_id: record.parent_execution_id.clone(),
            session_id: record.session_id.clone(),
            actor_id: record.actor_id.clone(),
            input,
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Record plus lazily decoded input/result payloads.
    pub async fn execution_detail(
        &self,
        execution_id: &str,
    ) -> Result<
        (
            ExecutionRecord,
            Option<serde_json::Value>,
            Option<serde_json::Value>,
        ),
        ControllerError,
    > {
        let record = self.store.lock().await.get_execution(execution_id)?;
        let input = self
            .resolve_payload(record.input_payload.as_deref(), record.input_uri.as_deref())
            .await;
        let result = self
            .resolve_payload(record.result_payload.as_deref(), record.result_uri.as_deref())
            .await;
        Ok((record, input, result))
    }

    /// Decode an inline payload, falling through to the payload store when
    /// the inline bytes are absent, undecodable, or the corruption sentinel.
    pub async fn resolve_payload(
        &self,
        inline: Option<&[u8]>,
        uri: Option<&str>,
    ) -> Option<serde_json::Value> {
        if let Some(bytes) = inline {
            if !is_corruption_sentinel(bytes) {
                if let Ok(value) = serde_json::from_slice(bytes) {
                    return Some(value);
                }
            }
        }
        let uri = uri?;
        match self.payloads.open_uri(uri).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(e) => {
                warn!(uri, error = %e, "payload fallback read failed");
                None
            }
        }
    }

    fn publish_terminal(&self, record: &ExecutionRecord) {
        let event = match record.status {
            ExecutionStatus::Succeeded => ExecutionEvent::Completed {
                execution_id: record.execution_id.clone(),
                run_id: record.run_id.clone(),
                node_id: record.target.node_id.clone(),
                status: record.status,
                payload: record
                    .result_payload
                    .as_deref()
                    .and_then(|bytes| serde_json::from_slice(bytes).ok()),
            },
            ExecutionStatus::Failed => ExecutionEvent::Failed {
                execution_id: record.execution_id.clone(),
                run_id: record.run_id.clone(),
                node_id: record.target.node_id.clone(),
                status: record.status,
                error: record.error_message.clone(),
            },
            ExecutionStatus::Cancelled => ExecutionEvent::Cancelled {
                execution_id: record.execution_id.clone(),
                run_id: record.run_id.clone(),
                node_id: record.target.node_id.clone(),
                status: record.status,
            },
            ExecutionStatus::Pending | ExecutionStatus::Queued | ExecutionStatus::Running => {
                return
            }
        };
        self.execution_bus.publish(&event);
    }
}

#[async_trait]
impl JobRunner<ExecutionJob> for ExecutionController {
    async fn run(&self, job: ExecutionJob) {
        if let Err(e) = self.dispatch(&job.plan).await {
            warn!(execution_id = job.plan.execution_id.as_str(), error = %e, "async dispatch failed");
            // Dispatch outcomes persist their own terminal state; an error
            // here is infrastructure-level, so make sure the record is not
            // left running.
            let _ = self
                .fail_execution(&job.plan.execution_id, &format!("dispatch error: {e}"))
                .await;
        }
    }

    async fn abandon(&self, job: ExecutionJob, reason: &str) {
        if let Err(e) = self.fail_execution(&job.plan.execution_id, reason).await {
            warn!(execution_id = job.plan.execution_id.as_str(), error = %e, "abandon failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn dispatch_url(node: &AgentNode, target: &ExecutionTarget) -> String {
    format!(
        "{}/{}/{}",
        node.base_url.trim_end_matches('/'),
        target.kind.path_segment(),
        target.capability_id
    )
}

fn resolve_capability(
    node: &AgentNode,
    capability_id: &str,
) -> Result<ExecutionTarget, ControllerError> {
    let kind = if node.reasoners.iter().any(|r| r.id == capability_id) {
        TargetKind::Reasoner
    } else if node.skills.iter().any(|s| s.id == capability_id) {
        TargetKind::Skill
    } else {
        return Err(ControllerError::NotFound(format!(
            "agent node '{}' has no reasoner or skill '{capability_id}'",
            node.node_id
        )));
    };
    Ok(ExecutionTarget {
        node_id: node.node_id.clone(),
        kind,
        capability_id: capability_id.to_owned(),
    })
}

fn validate_webhook_registration(reg: &WebhookRegistration) -> Result<(), String> {
    if reg.url.is_empty() {
        return Err("webhook url must not be empty".to_owned());
    }
    if reg.url.len() > MAX_WEBHOOK_URL_LEN {
        return Err(format!(
            "webhook url exceeds {MAX_WEBHOOK_URL_LEN} characters"
        ));
    }
    let parsed =
        reqwest::Url::parse(&reg.url).map_err(|e| format!("webhook url is not valid: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!(
            "webhook url scheme must be http or https, got '{other}'"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{StatusManager, StatusManagerConfig};
    use crate::store::Store;
    use ap_protocol::{CapabilityDescriptor, HealthStatus, LifecycleStatus, NodeEvent, ReasonerEvent};
    use tempfile::TempDir;

    struct TestContext {
        controller: Arc<ExecutionController>,
        store: SharedStore,
        execution_bus: Arc<EventBus<ExecutionEvent>>,
        _payload_dir: TempDir,
    }

    async fn make_controller() -> TestContext {
        let store = Store::open_in_memory().expect("store").into_shared();
        let payload_dir = TempDir::new().expect("payload dir");
        let payloads = Arc::new(PayloadStore::open(payload_dir.path()).expect("payloads"));
        let execution_bus = Arc::new(EventBus::new("execution", 64));
        let node_bus: Arc<EventBus<NodeEvent>> = Arc::new(EventBus::new("node", 64));
        let reasoner_bus: Arc<EventBus<ReasonerEvent>> = Arc::new(EventBus::new("reasoner", 64));
        let status = Arc::new(StatusManager::new(
            store.clone(),
            node_bus,
            reasoner_bus,
            None,
            StatusManagerConfig::default(),
        ));
        let controller = Arc::new(
            ExecutionController::new(
                store.clone(),
                payloads,
                execution_bus.clone(),
                status,
                Arc::new(LoggingWebhookDispatcher),
                ControllerConfig::default(),
            )
            .expect("controller"),
        );
        TestContext {
            controller,
            store,
            execution_bus,
            _payload_dir: payload_dir,
        }
    }

    async fn register_node(store: &SharedStore, node_id: &str) {
        let node = AgentNode {
            node_id: node_id.to_owned(),
            team_id: "team-1".to_owned(),
            base_url: "http://127.0.0.1:1".to_owned(),
            version: "1.0.0".to_owned(),
            last_heartbeat: Utc::now(),
            health_status: HealthStatus::Active,
            lifecycle_status: LifecycleStatus::Ready,
            reasoners: vec![CapabilityDescriptor {
                id: "reasoner-a".to_owned(),
                description: None,
                input_schema: None,
                output_schema: None,
                tags: vec![],
            }],
            skills: vec![],
        };
        store.lock().await.register_agent(&node).expect("register");
    }

    fn request(input: serde_json::Value) -> ExecuteRequest {
        ExecuteRequest {
            input,
            webhook: None,
        }
    }

    #[tokio::test]
    async fn prepare_persists_a_pending_record() {
        let ctx = make_controller().await;
        register_node(&ctx.store, "node-1").await;

        let prepared = ctx
            .controller
            .prepare(
                "node-1.reasoner-a",
                CallContext::default(),
                request(serde_json::json!({"foo": "bar"})),
            )
            .await
            .expect("prepare");

        assert_eq!(prepared.record.status, ExecutionStatus::Pending);
        assert_eq!(prepared.record.target.node_id, "node-1");
        assert_eq!(prepared.record.target.kind, TargetKind::Reasoner);
        assert_eq!(
            prepared.plan.dispatch_url,
            "http://127.0.0.1:1/reasoners/reasoner-a"
        );

        let stored = ctx
            .store
            .lock()
            .await
            .get_execution(&prepared.record.execution_id)
            .expect("stored");
        assert_eq!(stored.status, ExecutionStatus::Pending);
        assert_eq!(stored.input_payload, Some(b"{\"foo\":\"bar\"}".to_vec()));
    }

    #[tokio::test]
    async fn prepare_rejects_malformed_and_unknown_targets() {
        let ctx = make_controller().await;
        register_node(&ctx.store, "node-1").await;

        let malformed = ctx
            .controller
            .prepare("node-1", CallContext::default(), request(serde_json::json!({})))
            .await;
        assert!(matches!(malformed, Err(ControllerError::Validation(_))));

        let unknown_node = ctx
            .controller
            .prepare(
                "ghost.reasoner-a",
                CallContext::default(),
                request(serde_json::json!({})),
            )
            .await;
        assert!(matches!(
            unknown_node,
            Err(ControllerError::Store(StoreError::NotFound(_)))
        ));

        let unknown_capability = ctx
            .controller
            .prepare(
                "node-1.ghost",
                CallContext::default(),
                request(serde_json::json!({})),
            )
            .await;
        assert!(matches!(unknown_capability, Err(ControllerError::NotFound(_))));
    }

    #[tokio::test]
    async fn prepare_accepts_execution_with_invalid_webhook() {
        let ctx = make_controller().await;
        register_node(&ctx.store, "node-1").await;

        let prepared = ctx
            .controller
            .prepare(
                "node-1.reasoner-a",
                CallContext::default(),
                ExecuteRequest {
                    input: serde_json::json!({}),
                    webhook: Some(WebhookRegistration {
                        url: "ftp://example.com/hook".to_owned(),
                        secret: None,
                        headers: BTreeMap::new(),
                    }),
                },
            )
            .await
            .expect("prepare should still admit");

        assert!(!prepared.record.webhook_registered);
        assert!(prepared
            .record
            .webhook_error
            .as_deref()
            .is_some_and(|e| e.contains("scheme")));
    }

    #[tokio::test]
    async fn prepare_registers_a_valid_webhook() {
        let ctx = make_controller().await;
        register_node(&ctx.store, "node-1").await;

        let prepared = ctx
            .controller
            .prepare(
                "node-1.reasoner-a",
                CallContext::default(),
                ExecuteRequest {
                    input: serde_json::json!({}),
                    webhook: Some(WebhookRegistration {
                        url: "https://caller.example.com/done".to_owned(),
                        secret: Some("s".to_owned()),
                        headers: BTreeMap::new(),
                    }),
                },
            )
            .await
            .expect("prepare");

        assert!(prepared.record.webhook_registered);
        assert!(ctx
            .store
            .lock()
            .await
            .has_execution_webhook(&prepared.record.execution_id)
            .expect("has webhook"));
    }

    #[tokio::test]
    async fn complete_sets_terminal_fields_and_publishes() {
        let ctx = make_controller().await;
        register_node(&ctx.store, "node-1").await;
        let prepared = ctx
            .controller
            .prepare(
                "node-1.reasoner-a",
                CallContext::default(),
                request(serde_json::json!({})),
            )
            .await
            .expect("prepare");

        let mut rx = ctx.execution_bus.subscribe("test");
        let record = ctx
            .controller
            .complete(
                &prepared.record.execution_id,
                ExecutionStatus::Succeeded,
                Some(b"{\"result\":\"ok\"}".to_vec()),
                None,
            )
            .await
            .expect("complete");

        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert!(record.completed_at.is_some());
        assert!(record.duration_ms.is_some_and(|d| d >= 0));
        assert!(record.completed_at.expect("completed") >= record.started_at);

        match rx.try_recv().expect("terminal event") {
            ExecutionEvent::Completed {
                execution_id,
                payload,
                ..
            } => {
                assert_eq!(execution_id, prepared.record.execution_id);
                assert_eq!(payload, Some(serde_json::json!({"result": "ok"})));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_records_reject_further_completion() {
        let ctx = make_controller().await;
        register_node(&ctx.store, "node-1").await;
        let prepared = ctx
            .controller
            .prepare(
                "node-1.reasoner-a",
                CallContext::default(),
                request(serde_json::json!({})),
            )
            .await
            .expect("prepare");

        ctx.controller
            .fail_execution(&prepared.record.execution_id, "agent error (500)")
            .await
            .expect("fail");

        let again = ctx
            .controller
            .complete(
                &prepared.record.execution_id,
                ExecutionStatus::Succeeded,
                None,
                None,
            )
            .await;
        assert!(matches!(
            again,
            Err(ControllerError::Store(StoreError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn retry_resets_to_pending_and_increments_count() {
        let ctx = make_controller().await;
        register_node(&ctx.store, "node-1").await;
        let prepared = ctx
            .controller
            .prepare(
                "node-1.reasoner-a",
                CallContext::default(),
                request(serde_json::json!({"foo": "bar"})),
            )
            .await
            .expect("prepare");
        ctx.controller
            .fail_execution(&prepared.record.execution_id, "agent error (500)")
            .await
            .expect("fail");

        let (record, job) = ctx
            .controller
            .retry_execution(&prepared.record.execution_id)
            .await
            .expect("retry");
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.completed_at.is_none());
        assert!(record.error_message.is_none());
        assert_eq!(job.plan.input, serde_json::json!({"foo": "bar"}));

        // A running execution cannot be retried.
        let running = ctx.controller.retry_execution(&record.execution_id).await;
        assert!(matches!(
            running,
            Err(ControllerError::Store(StoreError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn corrupted_inline_payload_falls_through_to_the_store() {
        let ctx = make_controller().await;
        let saved = ctx
            .controller
            .payloads
            .save_bytes(b"{\"recovered\":true}")
            .await
            .expect("save");

        let resolved = ctx
            .controller
            .resolve_payload(
                Some(ap_protocol::CORRUPTION_SENTINEL.as_bytes()),
                Some(&saved.uri),
            )
            .await;
        assert_eq!(resolved, Some(serde_json::json!({"recovered": true})));

        let inline_only = ctx
            .controller
            .resolve_payload(Some(b"{\"inline\":1}"), Some(&saved.uri))
            .await;
        assert_eq!(inline_only, Some(serde_json::json!({"inline": 1})));
    }

    #[test]
    fn webhook_validation_rules() {
        let valid = WebhookRegistration {
            url: "https://example.com/hook".to_owned(),
            secret: None,
            headers: BTreeMap::new(),
        };
        assert!(validate_webhook_registration(&valid).is_ok());

        let mut bad_scheme = valid.clone();
        bad_scheme.url = "ftp://example.com".to_owned();
        assert!(validate_webhook_registration(&bad_scheme).is_err());

        let mut empty = valid.clone();
        empty.url = String::new();
        assert!(validate_webhook_registration(&empty).is_err());

        let mut too_long = valid.clone();
        too_long.url = format!("https://example.com/{}", "a".repeat(MAX_WEBHOOK_URL_LEN));
        assert!(validate_webhook_registration(&too_long).is_err());

        let mut garbage = valid;
        garbage.url = "http://".to_owned();
        assert!(validate_webhook_registration(&garbage).is_err());
    }
}
