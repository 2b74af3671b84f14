/// SSE bridge: bus events reach a connected client as data frames.
mod common;

use ap_protocol::{ExecutionEvent, ExecutionStatus};
use common::TestPlane;
use std::time::Duration;

async fn read_first_data_frame(response: &mut reqwest::Response) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut buffer = Vec::new();
    loop {
        let chunk = tokio::time::timeout_at(deadline, response.chunk())
            .await
            .expect("frame before deadline")
            .expect("chunk read")
            .expect("stream open");
        buffer.extend_from_slice(&chunk);
        let text = String::from_utf8_lossy(&buffer);
        for line in text.lines() {
            if let Some(json) = line.strip_prefix("data: ") {
                if let Ok(value) = serde_json::from_str(json) {
                    return value;
                }
            }
        }
    }
}

#[tokio::test]
async fn execution_events_stream_to_sse_clients() {
    let plane = TestPlane::start().await;

    let mut response = plane
        .client
        .get(plane.url("/executions/events"))
        .send()
        .await
        .expect("sse connect");
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream")));

    // Give the subscription a moment to land before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    plane.state.execution_bus.publish(&ExecutionEvent::Completed {
        execution_id: "exec-sse".to_owned(),
        run_id: "run-1".to_owned(),
        node_id: "node-1".to_owned(),
        status: ExecutionStatus::Succeeded,
        payload: None,
    });

    let frame = read_first_data_frame(&mut response).await;
    assert_eq!(frame["event_type"], "execution_completed");
    assert_eq!(frame["execution_id"], "exec-sse");
}

#[tokio::test]
async fn run_scoped_stream_filters_other_runs() {
    let plane = TestPlane::start().await;

    let mut response = plane
        .client
        .get(plane.url("/workflows/run-A/notes/events"))
        .send()
        .await
        .expect("sse connect");
    assert_eq!(response.status(), 200);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // An event for another run, then one for the scoped run.
    plane.state.execution_bus.publish(&ExecutionEvent::Started {
        execution_id: "exec-other".to_owned(),
        run_id: "run-B".to_owned(),
        node_id: "node-1".to_owned(),
        status: ExecutionStatus::Running,
    });
    plane.state.execution_bus.publish(&ExecutionEvent::Started {
        execution_id: "exec-scoped".to_owned(),
        run_id: "run-A".to_owned(),
        node_id: "node-1".to_owned(),
        status: ExecutionStatus::Running,
    });

    let frame = read_first_data_frame(&mut response).await;
    assert_eq!(
        frame["execution_id"], "exec-scoped",
        "the run-B event must be filtered out"
    );
}
