//! Runtime construction: every shared component is built here at startup
//! and threaded explicitly through `AppState`.  Nothing is reached through
//! import-time globals; the buses are process-wide only because this one
//! value owns them.

use crate::bus::{EventBus, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::config::Config;
use crate::controller::{ExecutionController, ExecutionJob, LoggingWebhookDispatcher};
use crate::forwarder::ObservabilityForwarder;
use crate::http::auth::AuthConfig;
use crate::payload::{PayloadError, PayloadStore};
use crate::pool::WorkerPool;
use crate::status::{HttpAgentClient, StatusManager};
use crate::store::{SharedStore, Store, StoreError};
use ap_protocol::{ExecutionEvent, NodeEvent, ReasonerEvent};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("payload store: {0}")]
    Payload(#[from] PayloadError),
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Shared application state handed to every handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub payloads: Arc<PayloadStore>,
    pub execution_bus: Arc<EventBus<ExecutionEvent>>,
    pub node_bus: Arc<EventBus<NodeEvent>>,
    pub reasoner_bus: Arc<EventBus<ReasonerEvent>>,
    pub status: Arc<StatusManager>,
    pub controller: Arc<ExecutionController>,
    pub pool: Arc<WorkerPool<ExecutionJob>>,
    pub forwarder: Arc<ObservabilityForwarder>,
    pub auth: Arc<AuthConfig>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the runtime and spawn its background loops (status reconcile,
    /// transition timeout, forwarder subscribers and workers, pool workers).
    pub async fn build(config: &Config) -> Result<Self, BuildError> {
        let shutdown = CancellationToken::new();

        let store = Store::open(Path::new(&config.storage.sqlite_path))?.into_shared();
        let payloads = Arc::new(PayloadStore::open(Path::new(&config.storage.payload_dir))?);

        let execution_bus = Arc::new(EventBus::new("execution", DEFAULT_SUBSCRIBER_CAPACITY));
        let node_bus = Arc::new(EventBus::new("node", DEFAULT_SUBSCRIBER_CAPACITY));
        let reasoner_bus = Arc::new(EventBus::new("reasoner", DEFAULT_SUBSCRIBER_CAPACITY));

        let status_cfg = config.status_manager_config();
        let agent_client = if config.status.probe_enabled {
            Some(Arc::new(HttpAgentClient::new(status_cfg.probe_deadline)?)
                as Arc<dyn crate::status::AgentClient>)
        } else {
            None
        };
        let status = Arc::new(StatusManager::new(
            store.clone(),
            node_bus.clone(),
            reasoner_bus.clone(),
            agent_client,
            status_cfg,
        ));

        let controller = Arc::new(ExecutionController::new(
            store.clone(),
            payloads.clone(),
            execution_bus.clone(),
            status.clone(),
            Arc::new(LoggingWebhookDispatcher),
            config.controller_config(),
        )?);

        let pool = Arc::new(WorkerPool::start(
            controller.clone(),
            config.dispatch.queue_capacity,
            config.dispatch.workers,
            shutdown.clone(),
        ));

        let forwarder = Arc::new(ObservabilityForwarder::new(
            store.clone(),
            config.forwarder_config(),
        )?);
        forwarder.reload_config().await?;
        forwarder
            .clone()
            .start(&execution_bus, &node_bus, &reasoner_bus, &shutdown);

        tokio::spawn(status.clone().run_reconcile_loop(shutdown.clone()));
        tokio::spawn(status.clone().run_transition_timeout_loop(shutdown.clone()));

        info!(
            sqlite_path = config.storage.sqlite_path.as_str(),
            workers = config.dispatch.workers,
            "runtime constructed"
        );

        Ok(AppState {
            store,
            payloads,
            execution_bus,
            node_bus,
            reasoner_bus,
            status,
            controller,
            pool,
            forwarder,
            auth: Arc::new(config.auth.clone()),
            shutdown,
        })
    }
}
