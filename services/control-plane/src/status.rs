//! Unified agent status manager.
//!
//! Single source of truth for agent liveness.  Reconciles three observation
//! sources (live probes, heartbeats, periodic sweeps) over a short-TTL cache
//! backed by the store, and broadcasts change events on the node and
//! reasoner buses.
//!
//! # Snapshot vs probe
//! `get_status` may perform a live probe; `get_status_snapshot` never does.
//! All change broadcasting captures the old state through the snapshot path:
//! probing there would overwrite the old state and suppress the transition
//! event.
//!
//! # Anti-flap
//! A heartbeat promotion to `active` within `anti_flap_window` of a live
//! probe that concluded `inactive` is ignored.  The rule is asymmetric: a
//! genuine recovery inside the window only surfaces once the window closes
//! or a probe confirms it.  That bounded delay is accepted in exchange for
//! not oscillating on a dying node that still emits heartbeats.

use crate::bus::EventBus;
use crate::store::{SharedStore, StoreError};
use ap_protocol::{
    AgentNode, AgentState, AgentStatus, HealthStatus, LifecycleStatus, NodeEvent, ReasonerEvent,
    StateTransition, StatusSource,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatusManagerConfig {
    /// Heartbeats older than this drive the node toward inactive.
    pub heartbeat_horizon: Duration,
    /// Period of the reconciliation sweep.
    pub reconcile_interval: Duration,
    /// In-flight state transitions older than this are force-completed.
    pub max_transition_time: Duration,
    /// Deadline for a live agent probe.
    pub probe_deadline: Duration,
    /// Heartbeat promotions are ignored this long after a failed probe.
    pub anti_flap_window: Duration,
    /// Cached `inactive` entries are served without probing below this age.
    pub cache_inactive_ttl: Duration,
    /// Cached `active` entries are served without probing below this age.
    pub cache_active_ttl: Duration,
}

impl Default for StatusManagerConfig {
    fn default() -> Self {
        StatusManagerConfig {
            heartbeat_horizon: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(30),
            max_transition_time: Duration::from_secs(120),
            probe_deadline: Duration::from_secs(3),
            anti_flap_window: Duration::from_secs(10),
            cache_inactive_ttl: Duration::from_secs(5),
            cache_active_ttl: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent probe client
// ---------------------------------------------------------------------------

/// Result of a live agent probe.
#[derive(Debug, Clone)]
pub struct AgentProbe {
    pub running: bool,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe transport error: {0}")]
    Transport(String),
    #[error("probe returned status {0}")]
    BadStatus(u16),
}

/// Short-deadline liveness probe against an agent node.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn get_status(&self, node: &AgentNode) -> Result<AgentProbe, ProbeError>;
}

/// HTTP probe: `GET {base_url}/status`, expects `{"status": "running"}`.
pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(deadline: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(deadline).build()?;
        Ok(HttpAgentClient { client })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn get_status(&self, node: &AgentNode) -> Result<AgentProbe, ProbeError> {
        let url = format!("{}/status", node.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProbeError::BadStatus(response.status().as_u16()));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let running = body
            .get("status")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|s| s == "running");
        Ok(AgentProbe { running })
    }
}

// ---------------------------------------------------------------------------
// Manager types
// ---------------------------------------------------------------------------

/// A requested status change.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub state: AgentState,
    pub source: StatusSource,
    pub reason: Option<String>,
    pub health_score: Option<f64>,
    pub lifecycle_status: Option<LifecycleStatus>,
}

impl StatusUpdate {
    pub fn new(state: AgentState, source: StatusSource) -> Self {
        StatusUpdate {
            state,
            source,
            reason: None,
            health_score: None,
            lifecycle_status: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: AgentState, to: AgentState },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Callback invoked after every applied status update.
pub type StatusHandler = Box<dyn Fn(&str, &AgentStatus) + Send + Sync>;

struct CacheEntry {
    status: AgentStatus,
    cached_at: Instant,
}

/// The unified agent status manager.
pub struct StatusManager {
    store: SharedStore,
    node_bus: Arc<EventBus<NodeEvent>>,
    reasoner_bus: Arc<EventBus<ReasonerEvent>>,
    client: Option<Arc<dyn AgentClient>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    handlers: RwLock<Vec<StatusHandler>>,
    /// node_id -> instant of the last probe that concluded inactive.
    last_probe_inactive: RwLock<HashMap<String, Instant>>,
    cfg: StatusManagerConfig,
}

impl StatusManager {
    pub fn new(
        store: SharedStore,
        node_bus: Arc<EventBus<NodeEvent>>,
        reasoner_bus: Arc<EventBus<ReasonerEvent>>,
        client: Option<Arc<dyn AgentClient>>,
        cfg: StatusManagerConfig,
    ) -> Self {
        StatusManager {
            store,
            node_bus,
            reasoner_bus,
            client,
            cache: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            last_probe_inactive: RwLock::new(HashMap::new()),
            cfg,
        }
    }

    /// Register a handler invoked after every applied update.  Handlers are
    /// isolated: one panicking handler cannot drop the others or poison the
    /// update.
    pub fn register_handler(&self, handler: StatusHandler) {
        self.handlers.write().push(handler);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current status, probing the agent when the cache is not fresh enough.
    pub async fn get_status(&self, node_id: &str) -> Result<AgentStatus, StatusError> {
        if let Some(cached) = self.cache_fresh(node_id) {
            return Ok(cached);
        }
        let node = self.store.lock().await.get_agent(node_id)?;
        let Some(client) = self.client.clone() else {
            // No probe client configured: synthesize from the persisted record.
            let status = synthesize_from_node(&node);
            self.cache_put(node_id, status.clone());
            return Ok(status);
        };

        let probe = tokio::time::timeout(self.cfg.probe_deadline, client.get_status(&node)).await;
        let running = matches!(&probe, Ok(Ok(p)) if p.running);
        let now = Utc::now();
        let status = AgentStatus {
            state: if running {
                AgentState::Active
            } else {
                AgentState::Inactive
            },
            health_score: if running { 100.0 } else { 0.0 },
            lifecycle_status: if running {
                LifecycleStatus::Ready
            } else {
                LifecycleStatus::Offline
            },
            health_status: if running {
                HealthStatus::Active
            } else {
                HealthStatus::Inactive
            },
            last_seen: node.last_heartbeat,
            last_updated: now,
            last_verified: Some(now),
            source: StatusSource::HealthCheck,
            state_transition: None,
        };

        if node.health_status != status.health_status {
            self.store
                .lock()
                .await
                .update_agent_health(node_id, status.health_status)?;
        }

        if running {
            self.cache_put(node_id, status.clone());
        } else {
            // Invalidate so the next read re-probes rather than trusting a
            // possibly stale verdict.
            self.cache.write().remove(node_id);
            self.last_probe_inactive
                .write()
                .insert(node_id.to_owned(), Instant::now());
            debug!(node_id, probe = ?probe, "agent probe concluded inactive");
        }
        Ok(status)
    }

    /// Non-probing read.  Serves any cached entry, otherwise synthesizes
    /// from the persisted record (or `cached_node` when the caller already
    /// holds it) and caches the result.
    pub async fn get_status_snapshot(
        &self,
        node_id: &str,
        cached_node: Option<&AgentNode>,
    ) -> Result<AgentStatus, StatusError> {
        if let Some(entry) = self.cache.read().get(node_id) {
            return Ok(entry.status.clone());
        }
        let node = match cached_node {
            Some(node) => node.clone(),
            None => self.store.lock().await.get_agent(node_id)?,
        };
        let status = synthesize_from_node(&node);
        self.cache_put(node_id, status.clone());
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Apply a status update: validate the transition, persist, cache,
    /// notify handlers, and broadcast change events.
    ///
    /// Returns the applied status, or the unchanged old status when the
    /// anti-flap rule suppresses a heartbeat promotion.
    pub async fn update_status(
        &self,
        node_id: &str,
        update: StatusUpdate,
    ) -> Result<AgentStatus, StatusError> {
        let old = self.get_status_snapshot(node_id, None).await?;

        if update.source == StatusSource::Heartbeat && update.state == AgentState::Active {
            let suppressed = self
                .last_probe_inactive
                .read()
                .get(node_id)
                .is_some_and(|at| at.elapsed() < self.cfg.anti_flap_window);
            if suppressed {
                debug!(node_id, "heartbeat promotion suppressed after failed probe");
                return Ok(old);
            }
        }

        if !old.state.can_transition_to(update.state) {
            return Err(StatusError::InvalidTransition {
                from: old.state,
                to: update.state,
            });
        }

        let now = Utc::now();
        let state_transition = if old.state == update.state {
            old.state_transition.clone()
        } else {
            // Starting/Stopping are in-flight; everything else completes
            // immediately.
            let in_flight = matches!(update.state, AgentState::Starting | AgentState::Stopping);
            Some(StateTransition {
                from: old.state,
                to: update.state,
                started_at: now,
                reason: update.reason.clone().unwrap_or_default(),
                completed_at: (!in_flight).then_some(now),
            })
        };
        let new = AgentStatus {
            state: update.state,
            health_score: update.health_score.unwrap_or_else(|| default_score(update.state)),
            lifecycle_status: update
                .lifecycle_status
                .unwrap_or_else(|| derive_lifecycle(update.state)),
            health_status: derive_health(update.state),
            last_seen: if update.source == StatusSource::Heartbeat {
                now
            } else {
                old.last_seen
            },
            last_updated: now,
            last_verified: if update.source == StatusSource::HealthCheck {
                Some(now)
            } else {
                old.last_verified
            },
            source: update.source,
            state_transition,
        };

        {
            let mut store = self.store.lock().await;
            store.update_agent_health(node_id, new.health_status)?;
            store.update_agent_lifecycle_status(node_id, new.lifecycle_status)?;
            if update.source == StatusSource::Heartbeat {
                store.update_agent_heartbeat(node_id, now)?;
            }
        }
        self.cache_put(node_id, new.clone());
        self.notify_handlers(node_id, &new);
        self.broadcast(node_id, &old, &new, update.source, update.reason.as_deref())
            .await;
        Ok(new)
    }

    /// Invalidate the cache, re-probe, and announce the refreshed status.
    pub async fn refresh_status(&self, node_id: &str) -> Result<AgentStatus, StatusError> {
        self.cache.write().remove(node_id);
        let status = self.get_status(node_id).await?;
        self.node_bus.publish(&NodeEvent::StatusRefreshed {
            node_id: node_id.to_owned(),
            status: status.clone(),
        });
        Ok(status)
    }

    /// Record an agent heartbeat: bump the persisted heartbeat, publish the
    /// transient heartbeat events, and try to promote the node to active
    /// (subject to the anti-flap rule and the state machine).
    pub async fn record_heartbeat(&self, node_id: &str) -> Result<(), StatusError> {
        let node = {
            let mut store = self.store.lock().await;
            store.update_agent_heartbeat(node_id, Utc::now())?;
            store.get_agent(node_id)?
        };
        self.node_bus.publish(&NodeEvent::Heartbeat {
            node_id: node_id.to_owned(),
        });
        for reasoner in &node.reasoners {
            self.reasoner_bus.publish(&ReasonerEvent::Heartbeat {
                reasoner_id: reasoner.id.clone(),
                node_id: node_id.to_owned(),
            });
        }
        let update = StatusUpdate::new(AgentState::Active, StatusSource::Heartbeat)
            .with_reason("heartbeat received");
        match self.update_status(node_id, update).await {
            Ok(_) => Ok(()),
            // A heartbeat from a node mid-shutdown is not an error.
            Err(StatusError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Periodic sweep driving stale nodes inactive and fresh ones active.
    pub async fn run_reconcile_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.cfg.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.reconcile_once().await {
                warn!(error = %e, "status reconcile sweep failed");
            }
        }
        debug!("status reconcile loop stopped");
    }

    /// One reconciliation pass over every registered agent.
    pub async fn reconcile_once(&self) -> Result<(), StatusError> {
        let agents = self.store.lock().await.list_agents(None)?;
        let horizon = chrono::Duration::from_std(self.cfg.heartbeat_horizon)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let now = Utc::now();
        for node in agents {
            let stale = now - node.last_heartbeat > horizon;
            let snapshot = self.get_status_snapshot(&node.node_id, Some(&node)).await?;
            let update = if stale && snapshot.state != AgentState::Inactive {
                Some(
                    StatusUpdate::new(AgentState::Inactive, StatusSource::Reconcile)
                        .with_reason("heartbeat horizon exceeded"),
                )
            } else if !stale && snapshot.state == AgentState::Inactive {
                Some(
                    StatusUpdate::new(AgentState::Active, StatusSource::Reconcile)
                        .with_reason("heartbeat fresh"),
                )
            } else {
                None
            };
            if let Some(update) = update {
                if let Err(e) = self.update_status(&node.node_id, update).await {
                    warn!(node_id = node.node_id.as_str(), error = %e, "reconcile update failed");
                }
            }
        }
        Ok(())
    }

    /// Periodic sweep force-completing transitions stuck past the deadline.
    pub async fn run_transition_timeout_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.cfg.max_transition_time / 4);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.force_expired_transitions().await;
        }
        debug!("transition timeout loop stopped");
    }

    /// Force-complete every in-flight transition older than the deadline:
    /// a stuck `starting` lands on `active`, a stuck `stopping` on `inactive`.
    pub async fn force_expired_transitions(&self) {
        let deadline = chrono::Duration::from_std(self.cfg.max_transition_time)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let now = Utc::now();
        let expired: Vec<(String, AgentState)> = self
            .cache
            .read()
            .iter()
            .filter_map(|(node_id, entry)| {
                let transition = entry.status.state_transition.as_ref()?;
                if transition.completed_at.is_none() && now - transition.started_at > deadline {
                    let target = match entry.status.state {
                        AgentState::Starting => AgentState::Active,
                        AgentState::Stopping => AgentState::Inactive,
                        other => other,
                    };
                    Some((node_id.clone(), target))
                } else {
                    None
                }
            })
            .collect();
        for (node_id, target) in expired {
            warn!(
                node_id = node_id.as_str(),
                target = target.as_str(),
                "state transition exceeded deadline, forcing completion"
            );
            let update = StatusUpdate::new(target, StatusSource::Reconcile)
                .with_reason("transition timeout");
            if let Err(e) = self.update_status(&node_id, update).await {
                warn!(node_id = node_id.as_str(), error = %e, "forced completion failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn cache_fresh(&self, node_id: &str) -> Option<AgentStatus> {
        let cache = self.cache.read();
        let entry = cache.get(node_id)?;
        let ttl = match entry.status.state {
            AgentState::Inactive => self.cfg.cache_inactive_ttl,
            AgentState::Active => self.cfg.cache_active_ttl,
            // Transitional states always re-probe.
            AgentState::Starting | AgentState::Stopping => return None,
        };
        (entry.cached_at.elapsed() < ttl).then(|| entry.status.clone())
    }

    fn cache_put(&self, node_id: &str, status: AgentStatus) {
        self.cache.write().insert(
            node_id.to_owned(),
            CacheEntry {
                status,
                cached_at: Instant::now(),
            },
        );
    }

    fn notify_handlers(&self, node_id: &str, status: &AgentStatus) {
        let handlers = self.handlers.read();
        for handler in handlers.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(node_id, status);
            }));
            if result.is_err() {
                error!(node_id, "status handler panicked; continuing with remaining handlers");
            }
        }
    }

    async fn broadcast(
        &self,
        node_id: &str,
        old: &AgentStatus,
        new: &AgentStatus,
        source: StatusSource,
        reason: Option<&str>,
    ) {
        let changed = old.state != new.state
            || old.lifecycle_status != new.lifecycle_status
            || old.health_status != new.health_status;
        if !changed {
            // Health-score jitter alone is not an event.
            return;
        }
        self.node_bus.publish(&NodeEvent::UnifiedStatusChanged {
            node_id: node_id.to_owned(),
            old_status: old.clone(),
            new_status: new.clone(),
            source,
        });
        if old.state == new.state {
            return;
        }
        match new.state {
            AgentState::Active => {
                self.node_bus.publish(&NodeEvent::Online {
                    node_id: node_id.to_owned(),
                });
                self.publish_reasoner_events(node_id, true).await;
            }
            AgentState::Inactive => {
                self.node_bus.publish(&NodeEvent::Offline {
                    node_id: node_id.to_owned(),
                    reason: reason.map(str::to_owned),
                });
                self.publish_reasoner_events(node_id, false).await;
            }
            AgentState::Starting | AgentState::Stopping => {}
        }
    }

    async fn publish_reasoner_events(&self, node_id: &str, online: bool) {
        let node = match self.store.lock().await.get_agent(node_id) {
            Ok(node) => node,
            Err(e) => {
                warn!(node_id, error = %e, "could not load reasoners for broadcast");
                return;
            }
        };
        for reasoner in &node.reasoners {
            let event = if online {
                ReasonerEvent::Online {
                    reasoner_id: reasoner.id.clone(),
                    node_id: node_id.to_owned(),
                }
            } else {
                ReasonerEvent::Offline {
                    reasoner_id: reasoner.id.clone(),
                    node_id: node_id.to_owned(),
                }
            };
            self.reasoner_bus.publish(&event);
        }
    }
}

// ---------------------------------------------------------------------------
// Derivations
// ---------------------------------------------------------------------------

fn synthesize_from_node(node: &AgentNode) -> AgentStatus {
    let state = match (node.health_status, node.lifecycle_status) {
        (HealthStatus::Active, _) => AgentState::Active,
        (_, LifecycleStatus::Starting) => AgentState::Starting,
        (_, LifecycleStatus::Stopping) => AgentState::Stopping,
        _ => AgentState::Inactive,
    };
    AgentStatus {
        state,
        health_score: match node.health_status {
            HealthStatus::Active => 100.0,
            HealthStatus::Degraded => 50.0,
            HealthStatus::Inactive => 0.0,
        },
        lifecycle_status: node.lifecycle_status,
        health_status: node.health_status,
        last_seen: node.last_heartbeat,
        last_updated: Utc::now(),
        last_verified: None,
        source: StatusSource::Reconcile,
        state_transition: None,
    }
}

fn derive_lifecycle(state: AgentState) -> LifecycleStatus {
    match state {
        AgentState::Active => LifecycleStatus::Ready,
        AgentState::Starting => LifecycleStatus::Starting,
        AgentState::Stopping => LifecycleStatus::Stopping,
        AgentState::Inactive => LifecycleStatus::Offline,
    }
}

fn derive_health(state: AgentState) -> HealthStatus {
    match state {
        AgentState::Active => HealthStatus::Active,
        AgentState::Starting | AgentState::Stopping => HealthStatus::Degraded,
        AgentState::Inactive => HealthStatus::Inactive,
    }
}

fn default_score(state: AgentState) -> f64 {
    match state {
        AgentState::Active => 100.0,
        AgentState::Starting | AgentState::Stopping => 50.0,
        AgentState::Inactive => 0.0,
    }
}
