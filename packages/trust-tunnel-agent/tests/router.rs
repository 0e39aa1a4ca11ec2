use std::collections::HashMap;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

use trust_tunnel_agent::broker::Broker;
use trust_tunnel_agent::config::AgentConfig;
use trust_tunnel_agent::router::build_router;

fn test_app(config: AgentConfig) -> Router {
    let broker = Broker::new(config).expect("create broker");
    build_router(broker)
}

fn exec_request(headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri("/exec");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).expect("request")
}

async fn send(app: &Router, request: Request<Body>) -> StatusCode {
    let response = app.clone().oneshot(request).await.expect("response");
    response.status()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = test_app(AgentConfig::default());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let payload: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(payload["status"], "ok");
}

#[tokio::test]
async fn invalid_target_type_is_bad_request() {
    let app = test_app(AgentConfig::default());
    let status = send(
        &app,
        exec_request(&[("Target-Type", "vm"), ("Command", "ls")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_command_is_bad_request() {
    let app = test_app(AgentConfig::default());
    let status = send(&app, exec_request(&[("Target-Type", "physical")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_base64_command_is_bad_request() {
    let app = test_app(AgentConfig::default());
    let status = send(
        &app,
        exec_request(&[
            ("Target-Type", "physical"),
            ("Command-Base64-Encode", "!!!"),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn container_target_without_pod_is_bad_request() {
    let app = test_app(AgentConfig::default());
    let status = send(
        &app,
        exec_request(&[("Target-Type", "container"), ("Command", "ls")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn valid_envelope_without_upgrade_wants_upgrade() {
    let app = test_app(AgentConfig::default());
    let status = send(
        &app,
        exec_request(&[
            ("Target-Type", "physical"),
            ("User-Name", "alice"),
            ("Command", "ls"),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn denied_user_is_forbidden() {
    let mut config = AgentConfig::default();
    config.auth_config.name = "example".to_string();
    config.auth_config.params =
        HashMap::from([("users".to_string(), "alice".to_string())]);
    let app = test_app(config);

    let status = send(
        &app,
        exec_request(&[
            ("Target-Type", "physical"),
            ("User-Name", "mallory"),
            ("Command", "ls"),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admitted_user_proceeds_to_upgrade() {
    let mut config = AgentConfig::default();
    config.auth_config.name = "example".to_string();
    config.auth_config.params =
        HashMap::from([("users".to_string(), "alice".to_string())]);
    let app = test_app(config);

    let status = send(
        &app,
        exec_request(&[
            ("Target-Type", "physical"),
            ("User-Name", "alice"),
            ("Command", "ls"),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = test_app(AgentConfig::default());
    let status = send(
        &app,
        Request::builder()
            .method(Method::GET)
            .uri("/nope")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// Broker construction spawns its background loops; building several apps in
// one test process must not interfere.
#[tokio::test]
async fn brokers_are_independent() {
    let app_a = test_app(AgentConfig::default());
    let app_b = test_app(AgentConfig::default());

    let status_a = send(&app_a, exec_request(&[("Target-Type", "physical")])).await;
    let status_b = send(&app_b, exec_request(&[("Target-Type", "physical")])).await;

    assert_eq!(status_a, StatusCode::BAD_REQUEST);
    assert_eq!(status_b, StatusCode::BAD_REQUEST);
}
