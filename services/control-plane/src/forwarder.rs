//! Observability forwarder: bus subscriber -> batch -> sign -> deliver.
//!
//! Subscribes to all three buses, filters heartbeat noise at the subscriber,
//! batches by size or time, HMAC-signs the batch body when a secret is
//! configured, and delivers with capped-backoff retries.  Events whose
//! delivery exhausts every attempt are appended to the persistent
//! dead-letter queue; `redrive` replays that queue oldest-first and deletes
//! the entries that go through.
//!
//! Backpressure is drop-new with accounting: the internal queue is bounded
//! and a full queue drops the incoming event and bumps `events_dropped`.
//! Publishers are never blocked by a slow webhook.

use crate::backoff::Backoff;
use crate::bus::EventBus;
use crate::store::{SharedStore, StoreError};
use ap_protocol::{
    EventBatch, EventSource, ExecutionEvent, NodeEvent, ObservabilityEvent, ReasonerEvent,
    WebhookConfig,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::Sha256;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// User-Agent header on every webhook delivery.
pub const USER_AGENT: &str = concat!("agent-plane-forwarder/", env!("CARGO_PKG_VERSION"));

/// Page size for redrive scans.
const REDRIVE_PAGE_SIZE: i64 = 100;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Flush a worker batch at this many events.
    pub batch_size: usize,
    /// Flush a worker batch this long after its first event.
    pub batch_timeout: Duration,
    /// Deadline for one delivery attempt.
    pub http_timeout: Duration,
    /// Delivery attempts per batch before dead-lettering.
    pub max_attempts: u32,
    /// Base retry delay, doubled per attempt.
    pub retry_backoff: Duration,
    /// Retry delay cap.
    pub max_retry_backoff: Duration,
    /// Number of batch workers.
    pub worker_count: usize,
    /// Internal event queue capacity.
    pub queue_size: usize,
    /// How much of a webhook response body is read before discarding.
    pub response_body_limit: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            batch_size: 10,
            batch_timeout: Duration::from_secs(1),
            http_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(30),
            worker_count: 2,
            queue_size: 1000,
            response_body_limit: 16 * 1024,
        }
    }
}

/// Snapshot of forwarder state for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ForwarderStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub queue_depth: i64,
    pub events_forwarded: u64,
    pub events_dropped: u64,
    pub dead_letter_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_forwarded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of a redrive pass.
#[derive(Debug, Clone, Serialize)]
pub struct RedriveReport {
    pub success: bool,
    pub message: String,
    pub processed: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

pub struct ObservabilityForwarder {
    store: SharedStore,
    tx: mpsc::Sender<ObservabilityEvent>,
    rx: Arc<Mutex<mpsc::Receiver<ObservabilityEvent>>>,
    config: RwLock<Option<WebhookConfig>>,
    client: reqwest::Client,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    queue_depth: AtomicI64,
    last_forwarded_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    cfg: ForwarderConfig,
}

impl ObservabilityForwarder {
    pub fn new(store: SharedStore, cfg: ForwarderConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()?;
        let (tx, rx) = mpsc::channel(cfg.queue_size);
        Ok(ObservabilityForwarder {
            store,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            config: RwLock::new(None),
            client,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            queue_depth: AtomicI64::new(0),
            last_forwarded_at: RwLock::new(None),
            last_error: RwLock::new(None),
            cfg,
        })
    }

    /// Spawn one subscriber task per bus plus the batch workers.
    pub fn start(
        self: Arc<Self>,
        execution_bus: &Arc<EventBus<ExecutionEvent>>,
        node_bus: &Arc<EventBus<NodeEvent>>,
        reasoner_bus: &Arc<EventBus<ReasonerEvent>>,
        shutdown: &CancellationToken,
    ) {
        {
            let forwarder = self.clone();
            let mut rx = execution_bus.subscribe("observability-forwarder");
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => forwarder.enqueue(execution_observability_event(&event)),
                            None => break,
                        },
                    }
                }
            });
        }
        {
            let forwarder = self.clone();
            let mut rx = node_bus.subscribe("observability-forwarder");
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => {
                                if let Some(event) = node_observability_event(&event) {
                                    forwarder.enqueue(event);
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
        {
            let forwarder = self.clone();
            let mut rx = reasoner_bus.subscribe("observability-forwarder");
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => {
                                if let Some(event) = reasoner_observability_event(&event) {
                                    forwarder.enqueue(event);
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
        for worker_id in 0..self.cfg.worker_count {
            let forwarder = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forwarder.run_batch_worker(worker_id, shutdown).await;
            });
        }
    }

    /// Non-blocking enqueue.  Dropped silently when no webhook is configured
    /// or it is disabled; dropped with accounting when the queue is full.
    pub fn enqueue(&self, event: ObservabilityEvent) {
        let deliverable = self.config.read().as_ref().is_some_and(|c| c.enabled);
        if !deliverable {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = event.event_type.as_str(),
                    "forwarder queue full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Re-read the webhook row; subsequent sends observe the new config
    /// without a restart.
    pub async fn reload_config(&self) -> Result<(), StoreError> {
        let config = self.store.lock().await.get_webhook()?;
        *self.config.write() = config;
        Ok(())
    }

    pub async fn status(&self) -> Result<ForwarderStatus, StoreError> {
        let dead_letter_count = self.store.lock().await.count_dlq()?;
        let config = self.config.read().clone();
        Ok(ForwarderStatus {
            enabled: config.as_ref().is_some_and(|c| c.enabled),
            webhook_url: config.map(|c| c.url),
            queue_depth: self.queue_depth.load(Ordering::Relaxed).max(0),
            events_forwarded: self.forwarded.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            dead_letter_count,
            last_forwarded_at: *self.last_forwarded_at.read(),
            last_error: self.last_error.read().clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Batch workers
    // -----------------------------------------------------------------------

    async fn run_batch_worker(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        enum Step {
            Event(ObservabilityEvent),
            Flush,
            Stop,
        }

        let mut batch: Vec<ObservabilityEvent> = Vec::with_capacity(self.cfg.batch_size);
        let mut deadline = tokio::time::Instant::now();
        loop {
            // The receiver lock is taken inside the awaited future, never
            // across the flush deadline: a sibling worker parked on recv
            // must not block this worker's timed flush.
            let next_event = async { self.rx.lock().await.recv().await };
            let step = if batch.is_empty() {
                tokio::select! {
                    () = shutdown.cancelled() => Step::Stop,
                    event = next_event => event.map_or(Step::Stop, Step::Event),
                }
            } else {
                tokio::select! {
                    () = shutdown.cancelled() => Step::Stop,
                    event = tokio::time::timeout_at(deadline, next_event) => match event {
                        Ok(Some(event)) => Step::Event(event),
                        Ok(None) => Step::Stop,
                        Err(_) => Step::Flush,
                    },
                }
            };
            match step {
                Step::Event(event) => {
                    self.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    if batch.is_empty() {
                        deadline = tokio::time::Instant::now() + self.cfg.batch_timeout;
                    }
                    batch.push(event);
                    if batch.len() >= self.cfg.batch_size {
                        self.send_batch(std::mem::take(&mut batch)).await;
                    }
                }
                Step::Flush => {
                    self.send_batch(std::mem::take(&mut batch)).await;
                }
                Step::Stop => {
                    if !batch.is_empty() {
                        // Best-effort flush before exit.
                        self.send_batch(std::mem::take(&mut batch)).await;
                    }
                    break;
                }
            }
        }
        debug!(worker_id, "forwarder batch worker stopped");
    }

    /// Deliver one batch; dead-letter every event on exhaustion.
    async fn send_batch(&self, events: Vec<ObservabilityEvent>) {
        if events.is_empty() {
            return;
        }
        // Config may have been reloaded since these events were enqueued.
        let Some(config) = self.config.read().clone() else {
            return;
        };
        if !config.enabled {
            return;
        }
        if let Err(error) = self.deliver_with_retries(&config, &events).await {
            let count = events.len() as u64;
            {
                let mut store = self.store.lock().await;
                for event in &events {
                    if let Err(e) =
                        store.add_to_dlq(event, &error, i64::from(self.cfg.max_attempts))
                    {
                        warn!(error = %e, "failed to dead-letter event");
                    }
                }
            }
            self.dropped.fetch_add(count, Ordering::Relaxed);
            *self.last_error.write() = Some(error.clone());
            warn!(count, error = error.as_str(), "batch dead-lettered after retries");
        }
    }

    /// Build, sign, and POST the batch with capped-backoff retries.
    async fn deliver_with_retries(
        &self,
        config: &WebhookConfig,
        events: &[ObservabilityEvent],
    ) -> Result<(), String> {
        let batch = EventBatch::new(events.to_vec(), Utc::now());
        let body = serde_json::to_vec(&batch).map_err(|e| format!("serialize batch: {e}"))?;

        let mut delays = Backoff::new(self.cfg.retry_backoff, self.cfg.max_retry_backoff);
        let mut last_error = String::new();
        for attempt in 1..=self.cfg.max_attempts {
            match self.post_batch(config, &body).await {
                Ok(()) => {
                    self.forwarded
                        .fetch_add(events.len() as u64, Ordering::Relaxed);
                    *self.last_forwarded_at.write() = Some(Utc::now());
                    return Ok(());
                }
                Err(error) => {
                    debug!(attempt, error = error.as_str(), "webhook delivery attempt failed");
                    last_error = error;
                    if attempt < self.cfg.max_attempts {
                        let delay = delays.next().unwrap_or_default();
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn post_batch(&self, config: &WebhookConfig, body: &[u8]) -> Result<(), String> {
        let mut request = self
            .client
            .post(&config.url)
            .timeout(self.cfg.http_timeout)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(secret) = &config.secret {
            request = request.header("X-Signature", sign_body(secret, body));
        }
        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| format!("webhook delivery failed: {e}"))?;
        let status = response.status();
        self.discard_body(response).await;
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned status {}", status.as_u16()))
        }
    }

    /// Read and discard the response body up to the configured limit.
    async fn discard_body(&self, mut response: reqwest::Response) {
        let mut read = 0usize;
        while read < self.cfg.response_body_limit {
            match response.chunk().await {
                Ok(Some(chunk)) => read += chunk.len(),
                Ok(None) | Err(_) => break,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Redrive
    // -----------------------------------------------------------------------

    /// Replay the dead-letter queue oldest-first.  Entries that deliver are
    /// deleted; failures keep their existing record.  Cancellation is
    /// honored between entries with partial progress reported.
    pub async fn redrive(&self, shutdown: &CancellationToken) -> RedriveReport {
        if let Err(e) = self.reload_config().await {
            return RedriveReport {
                success: false,
                message: format!("could not read webhook config: {e}"),
                processed: 0,
                failed: 0,
            };
        }
        let Some(config) = self.config.read().clone() else {
            return RedriveReport {
                success: false,
                message: "no observability webhook configured".to_owned(),
                processed: 0,
                failed: 0,
            };
        };
        if !config.enabled {
            return RedriveReport {
                success: false,
                message: "observability webhook is disabled".to_owned(),
                processed: 0,
                failed: 0,
            };
        }

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut cancelled = false;
        'pages: loop {
            // Delivered entries are deleted as we go, so the next page
            // starts after the entries that stayed behind.
            let entries = match self
                .store
                .lock()
                .await
                .list_dlq(REDRIVE_PAGE_SIZE, failed as i64)
            {
                Ok(entries) => entries,
                Err(e) => {
                    return RedriveReport {
                        success: false,
                        message: format!("could not list dead-letter queue: {e}"),
                        processed,
                        failed,
                    }
                }
            };
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                if shutdown.is_cancelled() {
                    cancelled = true;
                    break 'pages;
                }
                let event = ObservabilityEvent {
                    event_type: entry.event_type.clone(),
                    event_source: entry.event_source,
                    timestamp: entry.event_timestamp,
                    data: serde_json::from_str(&entry.payload)
                        .unwrap_or(serde_json::Value::String(entry.payload.clone())),
                };
                match self
                    .deliver_with_retries(&config, std::slice::from_ref(&event))
                    .await
                {
                    Ok(()) => {
                        if let Err(e) = self.store.lock().await.delete_dlq(&[entry.id]) {
                            warn!(id = entry.id, error = %e, "redriven entry could not be deleted");
                            failed += 1;
                        } else {
                            processed += 1;
                        }
                    }
                    Err(error) => {
                        debug!(id = entry.id, error = error.as_str(), "redrive delivery failed");
                        failed += 1;
                    }
                }
            }
        }

        let message = if cancelled {
            format!("redrive cancelled after {processed} delivered, {failed} failed")
        } else if failed == 0 {
            format!("redrove {processed} events")
        } else {
            format!("redrove {processed} events, {failed} failed")
        };
        RedriveReport {
            success: !cancelled && failed == 0,
            message,
            processed,
            failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// `sha256=<hex(hmac_sha256(secret, body))>` for the X-Signature header.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// Event transforms (heartbeats filtered at the subscriber)
// ---------------------------------------------------------------------------

pub fn execution_observability_event(event: &ExecutionEvent) -> ObservabilityEvent {
    let mut data = serde_json::json!({
        "execution_id": event.execution_id(),
        "status": event.status().as_str(),
    });
    match event {
        ExecutionEvent::Started { run_id, node_id, .. }
        | ExecutionEvent::Cancelled { run_id, node_id, .. } => {
            data["workflow_id"] = serde_json::Value::String(run_id.clone());
            data["agent_node_id"] = serde_json::Value::String(node_id.clone());
        }
        ExecutionEvent::Completed {
            run_id,
            node_id,
            payload,
            ..
        } => {
            data["workflow_id"] = serde_json::Value::String(run_id.clone());
            data["agent_node_id"] = serde_json::Value::String(node_id.clone());
            if let Some(payload) = payload {
                data["payload"] = payload.clone();
            }
        }
        ExecutionEvent::Failed {
            run_id,
            node_id,
            error,
            ..
        } => {
            data["workflow_id"] = serde_json::Value::String(run_id.clone());
            data["agent_node_id"] = serde_json::Value::String(node_id.clone());
            if let Some(error) = error {
                data["error"] = serde_json::Value::String(error.clone());
            }
        }
    }
    ObservabilityEvent {
        event_type: event.event_type().to_owned(),
        event_source: EventSource::Execution,
        timestamp: Utc::now(),
        data,
    }
}

pub fn node_observability_event(event: &NodeEvent) -> Option<ObservabilityEvent> {
    if event.is_heartbeat() {
        return None;
    }
    let data = match event {
        NodeEvent::Online { node_id } => serde_json::json!({
            "node_id": node_id,
            "status": "online",
        }),
        NodeEvent::Offline { node_id, reason } => {
            let mut data = serde_json::json!({
                "node_id": node_id,
                "status": "offline",
            });
            if let Some(reason) = reason {
                data["reason"] = serde_json::Value::String(reason.clone());
            }
            data
        }
        NodeEvent::UnifiedStatusChanged {
            node_id,
            old_status,
            new_status,
            source,
        } => serde_json::json!({
            "node_id": node_id,
            "status": new_status.state.as_str(),
            "old_status": old_status,
            "new_status": new_status,
            "source": source.as_str(),
        }),
        NodeEvent::StatusRefreshed { node_id, status } => serde_json::json!({
            "node_id": node_id,
            "status": status.state.as_str(),
            "payload": status,
        }),
        NodeEvent::Heartbeat { .. } => unreachable!("filtered above"),
    };
    Some(ObservabilityEvent {
        event_type: event.event_type().to_owned(),
        event_source: EventSource::Node,
        timestamp: Utc::now(),
        data,
    })
}

pub fn reasoner_observability_event(event: &ReasonerEvent) -> Option<ObservabilityEvent> {
    if event.is_heartbeat() {
        return None;
    }
    let (reasoner_id, node_id, status) = match event {
        ReasonerEvent::Online {
            reasoner_id,
            node_id,
        } => (reasoner_id, node_id, "online"),
        ReasonerEvent::Offline {
            reasoner_id,
            node_id,
        } => (reasoner_id, node_id, "offline"),
        ReasonerEvent::Heartbeat { .. } => unreachable!("filtered above"),
    };
    Some(ObservabilityEvent {
        event_type: event.event_type().to_owned(),
        event_source: EventSource::Reasoner,
        timestamp: Utc::now(),
        data: serde_json::json!({
            "reasoner_id": reasoner_id,
            "node_id": node_id,
            "status": status,
        }),
    })
}
