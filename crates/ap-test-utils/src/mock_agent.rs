//! Scriptable mock agent node.
//!
//! Serves `POST /reasoners/{id}`, `POST /skills/{id}`, and `GET /status` on
//! a random local port.  Tests script the dispatch response and inspect the
//! requests the controller sent.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the mock responds to the next dispatches.
#[derive(Debug, Clone)]
pub enum AgentResponse {
    /// `200` with the given JSON body.
    Success(serde_json::Value),
    /// `202` with an empty ack body.
    AcceptAsync,
    /// The given status code with a plain-text body.
    Error(u16, String),
    /// Sleep before answering `200 {}` (for timeout tests).
    Delay(Duration),
}

/// One dispatch captured by the mock.
#[derive(Debug, Clone)]
pub struct ReceivedDispatch {
    pub path: String,
    pub run_id: Option<String>,
    pub execution_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
    pub body: serde_json::Value,
}

struct AgentState {
    response: Mutex<AgentResponse>,
    received: Mutex<Vec<ReceivedDispatch>>,
    running: AtomicBool,
}

/// A mock agent node bound to a random local port.
pub struct MockAgentServer {
    addr: SocketAddr,
    state: Arc<AgentState>,
}

impl MockAgentServer {
    pub async fn start() -> std::io::Result<Self> {
        let state = Arc::new(AgentState {
            response: Mutex::new(AgentResponse::Success(serde_json::json!({"result": "ok"}))),
            received: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });

        let router = Router::new()
            .route("/reasoners/{id}", post(handle_dispatch))
            .route("/skills/{id}", post(handle_dispatch))
            .route("/status", get(handle_status))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(MockAgentServer { addr, state })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Script the response for subsequent dispatches.
    pub fn set_response(&self, response: AgentResponse) {
        *self.state.response.lock() = response;
    }

    /// Control what the `/status` probe reports.
    pub fn set_running(&self, running: bool) {
        self.state.running.store(running, Ordering::SeqCst);
    }

    /// Every dispatch captured so far.
    pub fn received(&self) -> Vec<ReceivedDispatch> {
        self.state.received.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.state.received.lock().len()
    }
}

async fn handle_dispatch(
    State(state): State<Arc<AgentState>>,
    Path(capability_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    state.received.lock().push(ReceivedDispatch {
        path: capability_id,
        run_id: header("X-Run-ID"),
        execution_id: header("X-Execution-ID"),
        parent_execution_id: header("X-Parent-Execution-ID"),
        session_id: header("X-Session-ID"),
        actor_id: header("X-Actor-ID"),
        body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
    });

    let response = state.response.lock().clone();
    match response {
        AgentResponse::Success(value) => Json(value).into_response(),
        AgentResponse::AcceptAsync => StatusCode::ACCEPTED.into_response(),
        AgentResponse::Error(code, message) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message,
        )
            .into_response(),
        AgentResponse::Delay(duration) => {
            tokio::time::sleep(duration).await;
            Json(serde_json::json!({})).into_response()
        }
    }
}

async fn handle_status(State(state): State<Arc<AgentState>>) -> Response {
    if state.running.load(Ordering::SeqCst) {
        Json(serde_json::json!({"status": "running"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "stopped"})),
        )
            .into_response()
    }
}
