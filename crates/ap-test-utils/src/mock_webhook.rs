//! Mock webhook sink.
//!
//! Captures every delivered batch (headers plus the raw body, so signature
//! checks can run byte-for-byte) and answers with a scripted status
//! sequence, defaulting to `200` once the script runs out.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

/// One captured delivery.
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ReceivedDelivery {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

struct SinkState {
    deliveries: Mutex<Vec<ReceivedDelivery>>,
    status_script: Mutex<VecDeque<u16>>,
}

/// A webhook receiver bound to a random local port.
pub struct MockWebhookSink {
    addr: SocketAddr,
    state: Arc<SinkState>,
}

impl MockWebhookSink {
    pub async fn start() -> std::io::Result<Self> {
        let state = Arc::new(SinkState {
            deliveries: Mutex::new(Vec::new()),
            status_script: Mutex::new(VecDeque::new()),
        });

        let router = Router::new()
            .route("/", post(handle_delivery))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(MockWebhookSink { addr, state })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Script the next responses; once exhausted the sink answers `200`.
    pub fn set_status_sequence(&self, statuses: impl IntoIterator<Item = u16>) {
        let mut script = self.state.status_script.lock();
        script.clear();
        script.extend(statuses);
    }

    pub fn deliveries(&self) -> Vec<ReceivedDelivery> {
        self.state.deliveries.lock().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.state.deliveries.lock().len()
    }
}

async fn handle_delivery(
    State(state): State<Arc<SinkState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut captured = BTreeMap::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            captured.insert(name.as_str().to_ascii_lowercase(), value.to_owned());
        }
    }
    state.deliveries.lock().push(ReceivedDelivery {
        headers: captured,
        body: body.to_vec(),
    });

    let status = state.status_script.lock().pop_front().unwrap_or(200);
    StatusCode::from_u16(status)
        .unwrap_or(StatusCode::OK)
        .into_response()
}
