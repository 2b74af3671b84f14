/// Webhook settings CRUD: validation, write-only secret, reload, delete.
mod common;

use common::TestPlane;

#[tokio::test]
async fn webhook_config_round_trip_hides_the_secret() {
    let plane = TestPlane::start().await;

    // Nothing configured yet.
    let response = plane
        .client
        .get(plane.url("/settings/observability-webhook"))
        .send()
        .await
        .expect("get");
    assert_eq!(response.status(), 404);

    let response = plane
        .client
        .post(plane.url("/settings/observability-webhook"))
        .json(&serde_json::json!({
            "url": "https://hooks.example.com/obs",
            "secret": "super-secret",
            "headers": {"X-Team": "obs"},
            "enabled": true,
        }))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    assert!(
        !body.contains("super-secret"),
        "secret must never be returned: {body}"
    );
    let view: serde_json::Value = serde_json::from_str(&body).expect("json");
    assert_eq!(view["url"], "https://hooks.example.com/obs");
    assert_eq!(view["has_secret"], true);
    assert_eq!(view["headers"]["X-Team"], "obs");

    let view: serde_json::Value = plane
        .client
        .get(plane.url("/settings/observability-webhook"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(view["has_secret"], true);

    // Delete, then reads are 404 again.
    let response = plane
        .client
        .delete(plane.url("/settings/observability-webhook"))
        .send()
        .await
        .expect("delete");
    assert_eq!(response.status(), 204);
    let response = plane
        .client
        .get(plane.url("/settings/observability-webhook"))
        .send()
        .await
        .expect("get");
    assert_eq!(response.status(), 404);
    let response = plane
        .client
        .delete(plane.url("/settings/observability-webhook"))
        .send()
        .await
        .expect("delete again");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn invalid_webhook_urls_are_rejected() {
    let plane = TestPlane::start().await;

    for url in ["", "ftp://example.com", "not a url"] {
        let response = plane
            .client
            .post(plane.url("/settings/observability-webhook"))
            .json(&serde_json::json!({"url": url}))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), 400, "url {url:?} should be rejected");
        let body: serde_json::Value = response.json().await.expect("body");
        assert_eq!(body["error"], "validation");
    }

    // Nothing was stored.
    let response = plane
        .client
        .get(plane.url("/settings/observability-webhook"))
        .send()
        .await
        .expect("get");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn status_endpoint_reports_disabled_without_config() {
    let plane = TestPlane::start().await;
    let status: serde_json::Value = plane
        .client
        .get(plane.url("/settings/observability-webhook/status"))
        .send()
        .await
        .expect("status")
        .json()
        .await
        .expect("json");
    assert_eq!(status["enabled"], false);
    assert_eq!(status["queue_depth"], 0);
    assert_eq!(status["events_forwarded"], 0);
    assert_eq!(status["events_dropped"], 0);
    assert_eq!(status["dead_letter_count"], 0);

    // Redrive without a webhook is refused.
    let report: serde_json::Value = plane
        .client
        .post(plane.url("/settings/observability-webhook/redrive"))
        .send()
        .await
        .expect("redrive")
        .json()
        .await
        .expect("json");
    assert_eq!(report["success"], false);
    assert!(report["message"]
        .as_str()
        .is_some_and(|m| m.contains("no observability webhook")));
}
