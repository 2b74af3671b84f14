/// API-key middleware: header, bearer, and query-parameter acceptance plus
/// the always-allowed paths.
mod common;

use common::TestPlane;

#[tokio::test]
async fn requests_without_a_key_are_rejected() {
    let plane = TestPlane::start_with(|config| {
        config.auth.api_key = Some("k-secret".to_owned());
    })
    .await;

    let response = plane
        .client
        .get(plane.url("/executions/summary"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.expect("body");
    assert_eq!(body["error"], "unauthorized");

    let response = plane
        .client
        .get(plane.url("/executions/summary"))
        .header("X-API-Key", "wrong")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn all_three_key_carriers_are_accepted() {
    let plane = TestPlane::start_with(|config| {
        config.auth.api_key = Some("k-secret".to_owned());
    })
    .await;

    let response = plane
        .client
        .get(plane.url("/executions/summary"))
        .header("X-API-Key", "k-secret")
        .send()
        .await
        .expect("header request");
    assert_eq!(response.status(), 200);

    let response = plane
        .client
        .get(plane.url("/executions/summary"))
        .header("Authorization", "Bearer k-secret")
        .send()
        .await
        .expect("bearer request");
    assert_eq!(response.status(), 200);

    // Query parameter form, for SSE clients.
    let response = plane
        .client
        .get(plane.url("/executions/summary?api_key=k-secret"))
        .send()
        .await
        .expect("query request");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn health_paths_and_skip_list_bypass_auth() {
    let plane = TestPlane::start_with(|config| {
        config.auth.api_key = Some("k-secret".to_owned());
        config.auth.skip_paths = vec!["/executions/stats".to_owned()];
    })
    .await;

    for path in ["/healthz", "/readyz", "/executions/stats"] {
        let response = plane
            .client
            .get(plane.url(path))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200, "{path} should bypass auth");
    }
}

#[tokio::test]
async fn no_configured_key_disables_auth() {
    let plane = TestPlane::start().await;
    let response = plane
        .client
        .get(plane.url("/executions/summary"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
}
