// ap-protocol: Shared domain and wire types for the agent control plane.
//
// Everything that crosses a process boundary (agent dispatch, observability
// webhook, SSE frames) or a component boundary (bus events, store records)
// lives here.  Bus event enums use a top-level `event_type` tag so the wire
// form is self-describing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
///
/// Monotone: `{pending, queued, running}` may only move forward into
/// `{succeeded, failed, cancelled}`; terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// True if `next` is a legal successor of `self`.
    ///
    /// Identity transitions are allowed (idempotent updates); leaving a
    /// terminal state is not.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal()
    }
}

/// What kind of capability an execution targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Reasoner,
    Skill,
}

impl TargetKind {
    /// URL path segment on the agent node serving this capability.
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Reasoner => "reasoners",
            Self::Skill => "skills",
        }
    }
}

/// Fully-resolved dispatch target: a capability on a registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTarget {
    pub node_id: String,
    pub kind: TargetKind,
    pub capability_id: String,
}

/// A persisted execution record.
///
/// Payload bytes are stored opaquely and decoded lazily at the edges; large
/// payloads live in the payload store and are referenced by `*_uri`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    pub target: ExecutionTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_uri: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub webhook_registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_error: Option<String>,
}

/// Inline payload sentinel written in place of undecodable JSON.
///
/// Readers treat a payload equal to this object as absent and fall through
/// to the payload-store URI.
pub const CORRUPTION_SENTINEL: &str = r#"{"error":"corrupted_json_data"}"#;

/// True if `bytes` is the corruption sentinel (structural compare, so
/// whitespace/field-order variants of the sentinel object also match).
pub fn is_corruption_sentinel(bytes: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return false;
    };
    value.as_object().is_some_and(|obj| {
        obj.len() == 1
            && obj
                .get("error")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|s| s == "corrupted_json_data")
    })
}

// ---------------------------------------------------------------------------
// Agent node records
// ---------------------------------------------------------------------------

/// Coarse node health derived from heartbeat recency and probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Active,
    Degraded,
    Inactive,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "degraded" => Some(Self::Degraded),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Node-reported lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Offline,
    Starting,
    Ready,
    Stopping,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offline" => Some(Self::Offline),
            "starting" => Some(Self::Starting),
            "ready" => Some(Self::Ready),
            "stopping" => Some(Self::Stopping),
            _ => None,
        }
    }
}

/// A named capability exposed by an agent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A registered agent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub node_id: String,
    pub team_id: String,
    pub base_url: String,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub lifecycle_status: LifecycleStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoners: Vec<CapabilityDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<CapabilityDescriptor>,
}

// ---------------------------------------------------------------------------
// Unified agent status
// ---------------------------------------------------------------------------

/// Unified agent state tracked by the status manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(Self::Inactive),
            "starting" => Some(Self::Starting),
            "active" => Some(Self::Active),
            "stopping" => Some(Self::Stopping),
            _ => None,
        }
    }

    /// The allowed state machine.  Identity moves are permitted (refreshes);
    /// anything else outside this table is rejected.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Self::Inactive, Self::Starting)
                | (Self::Inactive, Self::Active)
                | (Self::Starting, Self::Active)
                | (Self::Starting, Self::Inactive)
                | (Self::Active, Self::Inactive)
                | (Self::Active, Self::Stopping)
                | (Self::Stopping, Self::Inactive)
        )
    }
}

/// Which observation produced a status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Heartbeat,
    HealthCheck,
    Reconcile,
    Manual,
}

impl StatusSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::HealthCheck => "health_check",
            Self::Reconcile => "reconcile",
            Self::Manual => "manual",
        }
    }
}

/// An in-flight state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub started_at: DateTime<Utc>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Derived status snapshot for one agent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    /// 0-100; minor fluctuations alone never emit change events.
    pub health_score: f64,
    pub lifecycle_status: LifecycleStatus,
    pub health_status: HealthStatus,
    pub last_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
    pub source: StatusSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_transition: Option<StateTransition>,
}

// ---------------------------------------------------------------------------
// Webhook configuration
// ---------------------------------------------------------------------------

/// The global observability webhook configuration (singleton row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-side view of the webhook config.  The secret itself is write-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfigView {
    pub url: String,
    pub has_secret: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WebhookConfig> for WebhookConfigView {
    fn from(cfg: &WebhookConfig) -> Self {
        WebhookConfigView {
            url: cfg.url.clone(),
            has_secret: cfg.secret.is_some(),
            headers: cfg.headers.clone(),
            enabled: cfg.enabled,
            created_at: cfg.created_at,
            updated_at: cfg.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Observability events (webhook wire form)
// ---------------------------------------------------------------------------

/// Which bus an observability event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Execution,
    Node,
    Reasoner,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Node => "node",
            Self::Reasoner => "reasoner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution" => Some(Self::Execution),
            "node" => Some(Self::Node),
            "reasoner" => Some(Self::Reasoner),
            _ => None,
        }
    }
}

/// A single event in the observability webhook wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityEvent {
    pub event_type: String,
    pub event_source: EventSource,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// A delivered batch of observability events.
///
/// `batch_id` is an opaque correlation ID for logging on the receiving side;
/// delivery acknowledgement is purely the HTTP status code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: String,
    pub event_count: usize,
    pub events: Vec<ObservabilityEvent>,
    pub timestamp: DateTime<Utc>,
}

impl EventBatch {
    pub fn new(events: Vec<ObservabilityEvent>, timestamp: DateTime<Utc>) -> Self {
        EventBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            event_count: events.len(),
            events,
            timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

/// One persisted event whose webhook delivery exhausted all retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub event_type: String,
    pub event_source: EventSource,
    pub event_timestamp: DateTime<Utc>,
    /// The original event `data` object, as JSON text.
    pub payload: String,
    pub error_message: String,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Bus events: execution
// ---------------------------------------------------------------------------

/// Events published on the execution bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ExecutionEvent {
    #[serde(rename = "execution_started")]
    Started {
        execution_id: String,
        run_id: String,
        node_id: String,
        status: ExecutionStatus,
    },
    #[serde(rename = "execution_completed")]
    Completed {
        execution_id: String,
        run_id: String,
        node_id: String,
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    #[serde(rename = "execution_failed")]
    Failed {
        execution_id: String,
        run_id: String,
        node_id: String,
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "execution_cancelled")]
    Cancelled {
        execution_id: String,
        run_id: String,
        node_id: String,
        status: ExecutionStatus,
    },
}

impl ExecutionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "execution_started",
            Self::Completed { .. } => "execution_completed",
            Self::Failed { .. } => "execution_failed",
            Self::Cancelled { .. } => "execution_cancelled",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. }
            | Self::Cancelled { execution_id, .. } => execution_id,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Started { status, .. }
            | Self::Completed { status, .. }
            | Self::Failed { status, .. }
            | Self::Cancelled { status, .. } => *status,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus events: node
// ---------------------------------------------------------------------------

/// Events published on the node bus.
///
/// `node_heartbeat` is published but flagged; noise-averse consumers (the
/// observability forwarder) filter it at the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    #[serde(rename = "node_online")]
    Online { node_id: String },
    #[serde(rename = "node_offline")]
    Offline {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "node_heartbeat")]
    Heartbeat { node_id: String },
    #[serde(rename = "node_unified_status_changed")]
    UnifiedStatusChanged {
        node_id: String,
        old_status: AgentStatus,
        new_status: AgentStatus,
        source: StatusSource,
    },
    #[serde(rename = "node_status_refreshed")]
    StatusRefreshed {
        node_id: String,
        status: AgentStatus,
    },
}

impl NodeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Online { .. } => "node_online",
            Self::Offline { .. } => "node_offline",
            Self::Heartbeat { .. } => "node_heartbeat",
            Self::UnifiedStatusChanged { .. } => "node_unified_status_changed",
            Self::StatusRefreshed { .. } => "node_status_refreshed",
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Self::Online { node_id }
            | Self::Offline { node_id, .. }
            | Self::Heartbeat { node_id }
            | Self::UnifiedStatusChanged { node_id, .. }
            | Self::StatusRefreshed { node_id, .. } => node_id,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat { .. })
    }
}

// ---------------------------------------------------------------------------
// Bus events: reasoner
// ---------------------------------------------------------------------------

/// Events published on the reasoner bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ReasonerEvent {
    #[serde(rename = "reasoner_online")]
    Online { reasoner_id: String, node_id: String },
    #[serde(rename = "reasoner_offline")]
    Offline { reasoner_id: String, node_id: String },
    #[serde(rename = "heartbeat")]
    Heartbeat { reasoner_id: String, node_id: String },
}

impl ReasonerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Online { .. } => "reasoner_online",
            Self::Offline { .. } => "reasoner_offline",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat { .. })
    }
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// User-visible error body: `{error, message?, details?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
