//! Shared harness: a full control plane (store, buses, status manager,
//! controller, pool, forwarder, router) bound to a random local port, with
//! temp-dir storage and test-friendly timing defaults.

use control_plane::config::Config;
use control_plane::state::AppState;
use std::net::SocketAddr;
use tempfile::TempDir;

pub struct TestPlane {
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
    _data_dir: TempDir,
}

impl TestPlane {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(customize: impl FnOnce(&mut Config)) -> Self {
        let data_dir = TempDir::new().expect("temp dir");
        let mut config = Config::default();
        config.storage.sqlite_path = data_dir
            .path()
            .join("plane.sqlite3")
            .to_string_lossy()
            .into_owned();
        config.storage.payload_dir = data_dir
            .path()
            .join("payloads")
            .to_string_lossy()
            .into_owned();
        // Probing would need a live agent for every registered node.
        config.status.probe_enabled = false;
        // Tight timing so retry/batch scenarios complete quickly.
        config.dispatch.timeout_ms = 2_000;
        config.dispatch.async_wait_ms = 3_000;
        config.forwarder.batch_timeout_ms = 100;
        config.forwarder.retry_backoff_ms = 50;
        config.forwarder.max_retry_backoff_ms = 100;
        config.forwarder.http_timeout_ms = 2_000;
        customize(&mut config);

        let state = AppState::build(&config).await.expect("build runtime");
        let router = control_plane::build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        TestPlane {
            addr,
            state,
            client: reqwest::Client::new(),
            _data_dir: data_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Register an agent node exposing the given reasoner ids.
    pub async fn register_agent(&self, node_id: &str, base_url: &str, reasoners: &[&str]) {
        let reasoners: Vec<serde_json::Value> = reasoners
            .iter()
            .map(|id| serde_json::json!({"id": id}))
            .collect();
        let response = self
            .client
            .post(self.url("/agents/register"))
            .json(&serde_json::json!({
                "node_id": node_id,
                "team_id": "team-test",
                "base_url": base_url,
                "version": "1.0.0",
                "reasoners": reasoners,
            }))
            .send()
            .await
            .expect("register request");
        assert!(
            response.status().is_success(),
            "agent registration failed: {}",
            response.status()
        );
    }

    /// Configure the observability webhook and wait for the reload.
    pub async fn configure_webhook(&self, url: &str, secret: Option<&str>) {
        let mut body = serde_json::json!({
            "url": url,
            "headers": {"X-Custom-Header": "v"},
            "enabled": true,
        });
        if let Some(secret) = secret {
            body["secret"] = serde_json::Value::String(secret.to_owned());
        }
        let response = self
            .client
            .post(self.url("/settings/observability-webhook"))
            .json(&body)
            .send()
            .await
            .expect("webhook config request");
        assert!(
            response.status().is_success(),
            "webhook configuration failed: {}",
            response.status()
        );
    }
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_for(timeout: std::time::Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
