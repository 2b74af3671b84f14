/// Observability webhook delivery: signed batches, custom headers, and
/// heartbeat filtering.
mod common;

use ap_protocol::{NodeEvent, ReasonerEvent};
use common::{wait_for, TestPlane};
use ap_test_utils::MockWebhookSink;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

fn expected_signature(secret: &str, body: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn delivery_is_signed_and_carries_custom_headers() {
    let plane = TestPlane::start().await;
    let sink = MockWebhookSink::start().await.expect("sink");
    plane
        .configure_webhook(&sink.url(), Some("test-secret-123"))
        .await;

    plane.state.node_bus.publish(&NodeEvent::Online {
        node_id: "node-1".to_owned(),
    });

    assert!(
        wait_for(Duration::from_secs(3), || sink.delivery_count() == 1).await,
        "exactly one delivery expected"
    );
    let delivery = &sink.deliveries()[0];

    assert_eq!(delivery.header("content-type"), Some("application/json"));
    assert_eq!(delivery.header("x-custom-header"), Some("v"));
    assert!(delivery
        .header("user-agent")
        .is_some_and(|ua| ua.starts_with("agent-plane-forwarder/")));

    // Signature verifies byte-for-byte against the raw body.
    let signature = delivery.header("x-signature").expect("signature header");
    assert_eq!(
        signature,
        expected_signature("test-secret-123", &delivery.body)
    );

    // Batch shape.
    let batch = delivery.json();
    assert_eq!(batch["event_count"], 1);
    assert_eq!(batch["events"][0]["event_type"], "node_online");
    assert_eq!(batch["events"][0]["event_source"], "node");
    assert_eq!(batch["events"][0]["data"]["node_id"], "node-1");
    assert_eq!(batch["batch_id"].as_str().expect("batch id").len(), 36);

    // Counters reflect the delivery.
    let status: serde_json::Value = plane
        .client
        .get(plane.url("/settings/observability-webhook/status"))
        .send()
        .await
        .expect("status")
        .json()
        .await
        .expect("status body");
    assert_eq!(status["events_forwarded"], 1);
    assert_eq!(status["events_dropped"], 0);
    assert_eq!(status["enabled"], true);
}

#[tokio::test]
async fn heartbeats_never_reach_the_webhook() {
    let plane = TestPlane::start().await;
    let sink = MockWebhookSink::start().await.expect("sink");
    plane.configure_webhook(&sink.url(), None).await;

    plane.state.node_bus.publish(&NodeEvent::Online {
        node_id: "node-1".to_owned(),
    });
    plane.state.node_bus.publish(&NodeEvent::Heartbeat {
        node_id: "node-1".to_owned(),
    });
    plane.state.reasoner_bus.publish(&ReasonerEvent::Online {
        reasoner_id: "r-1".to_owned(),
        node_id: "node-1".to_owned(),
    });
    plane.state.reasoner_bus.publish(&ReasonerEvent::Heartbeat {
        reasoner_id: "r-1".to_owned(),
        node_id: "node-1".to_owned(),
    });
    plane.state.node_bus.publish(&NodeEvent::Offline {
        node_id: "node-1".to_owned(),
        reason: None,
    });

    // All three non-heartbeat events arrive (possibly across batches).
    let delivered_events = || {
        sink.deliveries()
            .iter()
            .flat_map(|d| {
                d.json()["events"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
    };
    assert!(
        wait_for(Duration::from_secs(3), || delivered_events().len() == 3).await,
        "exactly three events expected, got {:?}",
        delivered_events()
    );

    let types: Vec<String> = delivered_events()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert!(types.contains(&"node_online".to_owned()));
    assert!(types.contains(&"reasoner_online".to_owned()));
    assert!(types.contains(&"node_offline".to_owned()));
    assert!(!types.contains(&"node_heartbeat".to_owned()));
    assert!(!types.contains(&"heartbeat".to_owned()));

    // Give any stray heartbeat time to (incorrectly) surface.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(delivered_events().len(), 3);
}

#[tokio::test]
async fn execution_lifecycle_flows_to_the_webhook() {
    let plane = TestPlane::start().await;
    let sink = MockWebhookSink::start().await.expect("sink");
    plane.configure_webhook(&sink.url(), None).await;

    plane
        .state
        .execution_bus
        .publish(&ap_protocol::ExecutionEvent::Completed {
            execution_id: "exec-1".to_owned(),
            run_id: "run-1".to_owned(),
            node_id: "node-1".to_owned(),
            status: ap_protocol::ExecutionStatus::Succeeded,
            payload: Some(serde_json::json!({"result": "ok"})),
        });

    assert!(wait_for(Duration::from_secs(3), || sink.delivery_count() == 1).await);
    let batch = sink.deliveries()[0].json();
    let event = &batch["events"][0];
    assert_eq!(event["event_type"], "execution_completed");
    assert_eq!(event["event_source"], "execution");
    assert_eq!(event["data"]["execution_id"], "exec-1");
    assert_eq!(event["data"]["workflow_id"], "run-1");
    assert_eq!(event["data"]["agent_node_id"], "node-1");
    assert_eq!(event["data"]["payload"], serde_json::json!({"result": "ok"}));
}
