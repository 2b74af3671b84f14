/// Execution list surfaces: summary pagination with real totals, stats,
/// enhanced grouping, and group_by validation.
mod common;

use ap_test_utils::{AgentResponse, MockAgentServer};
use common::TestPlane;

async fn run_executions(plane: &TestPlane, agent: &MockAgentServer, count: usize, fail: bool) {
    if fail {
        agent.set_response(AgentResponse::Error(500, "boom".to_owned()));
    } else {
        agent.set_response(AgentResponse::Success(serde_json::json!({"result": "ok"})));
    }
    for i in 0..count {
        let response = plane
            .client
            .post(plane.url("/execute/node-1.reasoner-a"))
            .header("X-Run-ID", if fail { "run-failed" } else { "run-ok" })
            .json(&serde_json::json!({"input": {"i": i}}))
            .send()
            .await
            .expect("execute");
        assert!(response.status() == 200 || response.status() == 502);
    }
}

#[tokio::test]
async fn summary_paginates_with_real_totals() {
    let plane = TestPlane::start().await;
    let agent = MockAgentServer::start().await.expect("agent");
    plane
        .register_agent("node-1", &agent.base_url(), &["reasoner-a"])
        .await;
    run_executions(&plane, &agent, 5, false).await;

    let page: serde_json::Value = plane
        .client
        .get(plane.url("/executions/summary?page=1&page_size=2&sort=execution_id&order=asc"))
        .send()
        .await
        .expect("summary")
        .json()
        .await
        .expect("body");
    assert_eq!(page["total"], 5);
    assert_eq!(page["total_pages"], 3);
    assert_eq!(page["executions"].as_array().expect("array").len(), 2);

    let last_page: serde_json::Value = plane
        .client
        .get(plane.url("/executions/summary?page=3&page_size=2&sort=execution_id&order=asc"))
        .send()
        .await
        .expect("summary")
        .json()
        .await
        .expect("body");
    assert_eq!(last_page["executions"].as_array().expect("array").len(), 1);
}

#[tokio::test]
async fn summary_filters_by_run_and_status() {
    let plane = TestPlane::start().await;
    let agent = MockAgentServer::start().await.expect("agent");
    plane
        .register_agent("node-1", &agent.base_url(), &["reasoner-a"])
        .await;
    run_executions(&plane, &agent, 2, false).await;
    run_executions(&plane, &agent, 3, true).await;

    let failed: serde_json::Value = plane
        .client
        .get(plane.url("/executions/summary?status=failed"))
        .send()
        .await
        .expect("summary")
        .json()
        .await
        .expect("body");
    assert_eq!(failed["total"], 3);

    let by_run: serde_json::Value = plane
        .client
        .get(plane.url("/executions/summary?run_id=run-ok"))
        .send()
        .await
        .expect("summary")
        .json()
        .await
        .expect("body");
    assert_eq!(by_run["total"], 2);

    // Bad filter values are validation errors.
    let response = plane
        .client
        .get(plane.url("/executions/summary?status=exploded"))
        .send()
        .await
        .expect("summary");
    assert_eq!(response.status(), 400);
    let response = plane
        .client
        .get(plane.url("/executions/summary?sort=created_at"))
        .send()
        .await
        .expect("summary");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn stats_aggregate_by_status() {
    let plane = TestPlane::start().await;
    let agent = MockAgentServer::start().await.expect("agent");
    plane
        .register_agent("node-1", &agent.base_url(), &["reasoner-a"])
        .await;
    run_executions(&plane, &agent, 2, false).await;
    run_executions(&plane, &agent, 1, true).await;

    let stats: serde_json::Value = plane
        .client
        .get(plane.url("/executions/stats"))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("body");
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["succeeded"], 2);
    assert_eq!(stats["failed"], 1);
    assert!(stats["avg_duration_ms"].is_number());
}

#[tokio::test]
async fn enhanced_groups_by_status_and_rejects_unknown_group_keys() {
    let plane = TestPlane::start().await;
    let agent = MockAgentServer::start().await.expect("agent");
    plane
        .register_agent("node-1", &agent.base_url(), &["reasoner-a"])
        .await;
    run_executions(&plane, &agent, 2, false).await;
    run_executions(&plane, &agent, 1, true).await;

    let grouped: serde_json::Value = plane
        .client
        .get(plane.url("/executions/enhanced?group_by=status"))
        .send()
        .await
        .expect("enhanced")
        .json()
        .await
        .expect("body");
    assert_eq!(grouped["group_by"], "status");
    assert_eq!(
        grouped["groups"]["succeeded"].as_array().expect("succeeded").len(),
        2
    );
    assert_eq!(
        grouped["groups"]["failed"].as_array().expect("failed").len(),
        1
    );

    // Unknown group keys are an API error, not an "ungrouped" bucket.
    let response = plane
        .client
        .get(plane.url("/executions/enhanced?group_by=color"))
        .send()
        .await
        .expect("enhanced");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn execution_retry_redispatches() {
    let plane = TestPlane::start().await;
    let agent = MockAgentServer::start().await.expect("agent");
    plane
        .register_agent("node-1", &agent.base_url(), &["reasoner-a"])
        .await;
    run_executions(&plane, &agent, 1, true).await;

    let failed: serde_json::Value = plane
        .client
        .get(plane.url("/executions/summary?status=failed"))
        .send()
        .await
        .expect("summary")
        .json()
        .await
        .expect("body");
    let execution_id = failed["executions"][0]["execution_id"]
        .as_str()
        .expect("id")
        .to_owned();

    // Heal the agent and retry.
    agent.set_response(AgentResponse::Success(serde_json::json!({"result": "ok"})));
    let response = plane
        .client
        .post(plane.url(&format!("/executions/{execution_id}/retry")))
        .send()
        .await
        .expect("retry");
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.expect("body");
    assert_eq!(body["retry_count"], 1);

    // The retried dispatch eventually reaches the agent and completes.
    let redispatched = common::wait_for(std::time::Duration::from_secs(3), || {
        agent.dispatch_count() == 2
    })
    .await;
    assert!(redispatched, "retry should re-dispatch to the agent");
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let detail: serde_json::Value = plane
        .client
        .get(plane.url(&format!("/executions/{execution_id}")))
        .send()
        .await
        .expect("detail")
        .json()
        .await
        .expect("body");
    assert_eq!(detail["status"], "succeeded");
    assert_eq!(detail["retry_count"], 1);
}
