//! End-to-end tests for the worker routes.
//!
//! Requests are driven through the full router with `tower::ServiceExt`,
//! against a fleet wired to a recording worker client.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::FleetServices;
use crate::cancel::client::fake::{RecordingClient, Reply};
use crate::config::FleetConfig;

struct TestApp {
    services: FleetServices,
    router: Router,
    client: Arc<RecordingClient>,
}

impl TestApp {
    fn new(reply: Reply) -> Self {
        Self::with_config(FleetConfig::default(), reply)
    }

    fn with_config(mut config: FleetConfig, reply: Reply) -> Self {
        config.registry.staleness_threshold_ms = 30_000;
        config.cancellation.attempt_timeout_ms = 1_000;
        let client = Arc::new(RecordingClient::new(reply));
        let services = FleetServices::with_client(&config, client.clone());
        let router = services.router();
        Self {
            services,
            router,
            client,
        }
    }

    async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request_with(method, uri, body, &[]).await
    }

    async fn request_with(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let req = match body {
            Some(payload) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn register(&self, name: &str, capacity: u32) {
        let (status, _) = self
            .request(
                Method::POST,
                "/api/v1/workers",
                Some(json!({
                    "name": name,
                    "address": format!("http://{name}.internal:8080"),
                    "capacity": capacity,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn assign(&self, worker: &str, number: u64) -> (StatusCode, Value) {
        self.request(
            Method::POST,
            &format!("/api/v1/workers/{worker}/executors"),
            Some(json!({"org": "octo", "repo": "app", "number": number})),
        )
        .await
    }
}

#[tokio::test]
async fn test_server_health() {
    let app = TestApp::new(Reply::Ack);
    let (status, body) = app.request(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

// Scenario: a silent worker goes offline and its executors are lost.
#[tokio::test(start_paused = true)]
async fn test_silent_worker_goes_offline() {
    let app = TestApp::new(Reply::Ack);
    app.register("w1", 2).await;
    let (status, _) = app.assign("w1", 1).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app.request(Method::GET, "/api/v1/workers/w1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "busy");

    tokio::time::advance(Duration::from_secs(31)).await;
    app.services.monitor().sweep_once().await;

    let (status, body) = app.request(Method::GET, "/api/v1/workers/w1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "offline");
    assert!(body["last_heartbeat_age_ms"].as_u64().unwrap() >= 31_000);

    let (_, body) = app
        .request(Method::GET, "/api/v1/workers/w1/executors", None)
        .await;
    assert_eq!(body["count"], 0);

    // A kill now reports the lost executor without contacting the worker.
    let (status, body) = app
        .request(Method::DELETE, "/api/v1/workers/w1/octo/app/1", None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "already_terminal");
    assert_eq!(body["executor"]["state"], "lost");
    assert_eq!(app.client.calls(), 0);
}

// Scenario: acknowledged kill frees the slot for the next build.
#[tokio::test]
async fn test_kill_acknowledged() {
    let app = TestApp::new(Reply::Ack);
    app.register("w1", 1).await;
    app.assign("w1", 1).await;

    let (status, body) = app
        .request(Method::DELETE, "/api/v1/workers/w1/octo/app/1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["executor"]["state"], "cancelled");
    assert_eq!(app.client.calls(), 1);

    let (status, body) = app.assign("w1", 2).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["slot"], 0);

    // Killing again is answered from history, no second signal.
    let (status, body) = app
        .request(Method::DELETE, "/api/v1/workers/w1/octo/app/1", None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["note"], "build octo/app#1 already cancelled");
    assert_eq!(app.client.calls(), 1);
}

// Scenario: a worker that never answers exhausts the retry budget.
#[tokio::test(start_paused = true)]
async fn test_kill_unacknowledged_is_gateway_timeout() {
    let app = TestApp::new(Reply::Hang);
    app.register("w1", 1).await;
    app.assign("w1", 1).await;

    let (status, body) = app
        .request(Method::DELETE, "/api/v1/workers/w1/octo/app/1", None)
        .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["code"], "GATEWAY_TIMEOUT");
    assert_eq!(app.client.calls(), 3);

    let (_, body) = app.request(Method::GET, "/api/v1/workers/w1", None).await;
    assert_eq!(body["occupied"], 0);
    let executor = app
        .services
        .fleet
        .find_build(&crate::types::BuildRef::new("octo", "app", 1))
        .await
        .unwrap();
    assert_eq!(executor.state, crate::fleet::ExecutorState::Lost);
}

// Scenario: assigning past capacity conflicts.
#[tokio::test]
async fn test_assign_over_capacity_conflicts() {
    let app = TestApp::new(Reply::Ack);
    app.register("w1", 1).await;

    let (status, _) = app.assign("w1", 1).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app.assign("w1", 2).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_kill_resolution_failures() {
    let app = TestApp::new(Reply::Ack);
    app.register("w1", 1).await;
    app.register("w2", 1).await;
    app.assign("w1", 1).await;

    let cases = [
        ("/api/v1/workers/w1/octo/app/99", StatusCode::NOT_FOUND),
        ("/api/v1/workers/w2/octo/app/1", StatusCode::NOT_FOUND),
        ("/api/v1/workers/w9/octo/app/1", StatusCode::NOT_FOUND),
        ("/api/v1/workers/w1/octo/app/abc", StatusCode::BAD_REQUEST),
        ("/api/v1/workers/w1/octo/a%20b/1", StatusCode::NOT_FOUND),
    ];
    for (uri, expected) in cases {
        let (status, _) = app.request(Method::DELETE, uri, None).await;
        assert_eq!(status, expected, "{uri}");
    }
    assert_eq!(app.client.calls(), 0);
}

#[tokio::test]
async fn test_heartbeat_reconciles_over_http() {
    let app = TestApp::new(Reply::Ack);
    app.register("w1", 2).await;
    app.assign("w1", 1).await;

    let body = json!({"executors": [{"org": "octo", "repo": "app", "number": 2}]});
    let (status, report) = app
        .request(Method::POST, "/api/v1/workers/w1/heartbeat", Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["completed"][0]["number"], 1);
    assert_eq!(report["adopted"][0]["number"], 2);

    let (_, again) = app
        .request(Method::POST, "/api/v1/workers/w1/heartbeat", Some(body))
        .await;
    assert_eq!(again["adopted"], json!([]));
    assert_eq!(again["worker"]["occupied"], 1);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/workers/ghost/heartbeat",
            Some(json!({"executors": []})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_workers_sorted() {
    let app = TestApp::new(Reply::Ack);
    app.register("w2", 1).await;
    app.register("w1", 3).await;

    let (status, body) = app.request(Method::GET, "/api/v1/workers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["workers"][0]["name"], "w1");
    assert_eq!(body["workers"][0]["status"], "idle");
    assert_eq!(body["workers"][1]["name"], "w2");
}

#[tokio::test]
async fn test_register_rejects_zero_capacity() {
    let app = TestApp::new(Reply::Ack);
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/workers",
            Some(json!({"name": "w1", "address": "http://w1:8080", "capacity": 0})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let mut config = FleetConfig::default();
    config.auth.api_key = Some("s3cret".to_string());
    let app = TestApp::with_config(config, Reply::Ack);

    let (status, body) = app.request(Method::GET, "/api/v1/workers", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _) = app
        .request_with(Method::GET, "/api/v1/workers", None, &[("X-API-Key", "s3cret")])
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .request_with(
            Method::GET,
            "/api/v1/workers",
            None,
            &[("Authorization", "Bearer s3cret")],
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Server liveness stays open.
    let (status, _) = app.request(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}
