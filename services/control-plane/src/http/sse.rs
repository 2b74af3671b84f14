//! SSE bridges: stream execution bus events to interactive clients.
//!
//! Each connection gets its own bounded bus subscription; a slow client
//! loses events rather than stalling publishers.  Dropping the connection
//! drops the receiver, and the bus prunes the closed queue on its next
//! publish.  Heartbeat frames are emitted every 30 seconds so proxies keep
//! the socket open.

use crate::state::AppState;
use ap_protocol::ExecutionEvent;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Interval between `{type: "heartbeat"}` data frames.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /executions/events`
pub async fn execution_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_response(event_stream(&state, None))
}

/// `GET /workflows/{id}/notes/events`: execution events scoped to one run
/// (a workflow is a run in the API's legacy naming).
pub async fn run_note_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_response(event_stream(&state, Some(run_id)))
}

fn sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn event_stream(
    state: &AppState,
    run_filter: Option<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let subscriber_id = format!("sse-{}", Uuid::new_v4());
    let rx = state.execution_bus.subscribe(&subscriber_id);

    let events = ReceiverStream::new(rx).filter_map(move |event: ExecutionEvent| {
        if let Some(run_id) = &run_filter {
            if event_run_id(&event) != run_id {
                return None;
            }
        }
        serde_json::to_string(&event)
            .ok()
            .map(|json| Ok(Event::default().data(json)))
    });

    // First heartbeat one interval in, then periodically.
    let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
    let heartbeats = IntervalStream::new(tokio::time::interval_at(start, HEARTBEAT_INTERVAL))
        .map(|_| {
            let frame = serde_json::json!({
                "type": "heartbeat",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            Ok(Event::default().data(frame.to_string()))
        });

    futures_util::stream::select(events, heartbeats)
}

fn event_run_id(event: &ExecutionEvent) -> &str {
    match event {
        ExecutionEvent::Started { run_id, .. }
        | ExecutionEvent::Completed { run_id, .. }
        | ExecutionEvent::Failed { run_id, .. }
        | ExecutionEvent::Cancelled { run_id, .. } => run_id,
    }
}
