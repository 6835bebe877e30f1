//! Gateway API tests against an in-process mock backend

use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::watch;
use twin_api::{create_router, AppState, AuthConfig};
use twin_client::testing::TestServer;
use twin_ingest::PipelineState;

/// One request as the backend saw it
#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    path: String,
    query: Option<String>,
    auth: Option<String>,
    body: Bytes,
}

#[derive(Clone, Default)]
struct MockBackend {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl MockBackend {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn router(&self) -> Router {
        Router::new().fallback(backend).with_state(self.clone())
    }
}

async fn backend(State(mock): State<MockBackend>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let seen = Seen {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        auth: parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.clone(),
    };
    mock.seen.lock().unwrap().push(seen);

    let path = parts.uri.path();
    match (parts.method, path) {
        (Method::GET, "/api/2/things/ns:known") => Json(json!({
            "thingId": "ns:known",
            "policyId": "ns:known",
            "attributes": {"company": "acme"},
            "features": {"temp": {"properties": {"value": 21.5}}}
        }))
        .into_response(),
        (Method::GET, "/api/2/search/things") => Json(json!({
            "items": [
                {"thingId": "ns:a", "attributes": {"location": "lab"}},
                {"thingId": "ns:b", "attributes": {"location": "roof"}}
            ]
        }))
        .into_response(),
        (Method::PUT, p) if p.starts_with("/api/2/policies/") => StatusCode::CREATED.into_response(),
        (Method::PUT, p) if p.contains("/inbox/messages/") => (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({"status": 408, "error": "messages:timeout"})),
        )
            .into_response(),
        (Method::PUT, p) if p.starts_with("/api/2/things/") => {
            (StatusCode::CREATED, [("content-type", "application/json")], body).into_response()
        }
        (Method::DELETE, "/api/2/things/ns:known") => StatusCode::NO_CONTENT.into_response(),
        (Method::GET, p) if p.starts_with("/api/2/things/") => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": 404, "error": "things:thing.notfound"})),
        )
            .into_response(),
        (Method::GET, "/api/2/plain") => {
            ([("content-type", "text/plain")], "not json").into_response()
        }
        (method, p) => Json(json!({"method": method.as_str(), "path": p})).into_response(),
    }
}

struct Harness {
    mock: MockBackend,
    _backend: TestServer,
    gateway: TestServer,
    http: reqwest::Client,
}

impl Harness {
    async fn start(configure: impl FnOnce(AppState) -> AppState) -> Self {
        let mock = MockBackend::default();
        let backend = TestServer::start(mock.router()).await.unwrap();
        let state = configure(AppState::new(backend.client.clone()));
        let gateway = TestServer::start(create_router(state)).await.unwrap();
        Self {
            mock,
            _backend: backend,
            gateway,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.gateway.base_url(), path)
    }
}

#[tokio::test]
async fn backend_not_found_is_relayed_without_retry() {
    let h = Harness::start(|s| s).await;

    let response = h.http.get(h.url("/api/devices/ns:missing")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers()["content-type"],
        "application/json; charset=utf-8"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "things:thing.notfound");

    assert_eq!(h.mock.seen().len(), 1);
}

#[tokio::test]
async fn get_device_and_state() {
    let h = Harness::start(|s| s).await;

    let device: Value = h
        .http
        .get(h.url("/api/devices/ns:known"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(device["thingId"], "ns:known");

    let state: Value = h
        .http
        .get(h.url("/api/devices/ns:known/state"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["features"]["temp"]["properties"]["value"], 21.5);
    assert!(state.get("attributes").is_none());

    let seen = h.mock.seen();
    assert_eq!(seen[0].auth.as_deref(), Some("Basic ZGl0dG86ZGl0dG8="));
}

#[tokio::test]
async fn list_devices_filters_by_location() {
    let h = Harness::start(|s| s).await;

    let list: Value = h
        .http
        .get(h.url("/api/devices?location=roof"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["total"], 1);
    assert_eq!(list["items"][0]["thingId"], "ns:b");
}

#[tokio::test]
async fn create_device_writes_policy_first_and_forces_id() {
    let h = Harness::start(|s| s).await;

    let response = h
        .http
        .put(h.url("/api/devices/ns:new"))
        .json(&json!({"thingId": "ns:other", "features": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let seen = h.mock.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].path, "/api/2/policies/ns:new");
    assert_eq!(seen[1].path, "/api/2/things/ns:new");
    let written: Value = serde_json::from_slice(&seen[1].body).unwrap();
    assert_eq!(written["thingId"], "ns:new");
    assert_eq!(written["policyId"], "ns:new");
}

#[tokio::test]
async fn create_device_keeps_explicit_policy() {
    let h = Harness::start(|s| s.with_auto_create_policy(false)).await;

    h.http
        .put(h.url("/api/devices/ns:new"))
        .json(&json!({"policyId": "ns:shared"}))
        .send()
        .await
        .unwrap();

    let seen = h.mock.seen();
    assert_eq!(seen.len(), 1);
    let written: Value = serde_json::from_slice(&seen[0].body).unwrap();
    assert_eq!(written["policyId"], "ns:shared");
}

#[tokio::test]
async fn delete_device_relays_no_content() {
    let h = Harness::start(|s| s).await;
    let response = h.http.delete(h.url("/api/devices/ns:known")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn command_timeout_status_reaches_caller() {
    let h = Harness::start(|s| s).await;

    let response = h
        .http
        .post(h.url("/api/devices/ns:known/features/lamp/command"))
        .json(&json!({"command": "switch", "params": {"on": true}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

    let seen = h.mock.seen();
    assert_eq!(seen[0].method, Method::PUT);
    assert_eq!(
        seen[0].path,
        "/api/2/things/ns:known/features/lamp/inbox/messages/switch"
    );
    let params: Value = serde_json::from_slice(&seen[0].body).unwrap();
    assert_eq!(params, json!({"on": true}));
}

#[tokio::test]
async fn passthrough_rewrites_path_and_keeps_query() {
    let h = Harness::start(|s| s).await;

    let response = h
        .http
        .post(h.url("/api/devices/ns:x/commands/reboot?timeout=5"))
        .header("authorization", "Bearer client-token")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = h.mock.seen();
    assert_eq!(seen[0].method, Method::POST);
    assert_eq!(seen[0].path, "/api/2/things/ns:x/inbox/messages/reboot");
    assert_eq!(seen[0].query.as_deref(), Some("timeout=5"));
    assert_eq!(seen[0].auth.as_deref(), Some("Basic ZGl0dG86ZGl0dG8="));
    assert_eq!(seen[0].body, Bytes::from_static(b"payload"));
}

#[tokio::test]
async fn passthrough_policies_and_method_fallback() {
    let h = Harness::start(|s| s).await;

    h.http
        .get(h.url("/api/things/ns:x/policies/ns:p"))
        .send()
        .await
        .unwrap();
    // POST has no typed handler on /devices/{id}
    h.http.post(h.url("/api/devices/ns:y")).send().await.unwrap();

    let seen = h.mock.seen();
    assert_eq!(seen[0].path, "/api/2/policies/ns:p");
    assert_eq!(seen[1].method, Method::POST);
    assert_eq!(seen[1].path, "/api/2/things/ns:y");
}

#[tokio::test]
async fn passthrough_leaves_non_json_bodies_alone() {
    let h = Harness::start(|s| s).await;

    let response = h.http.get(h.url("/api/plain")).send().await.unwrap();
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "not json");
}

#[tokio::test]
async fn bad_paths_are_rejected_locally() {
    let h = Harness::start(|s| s).await;

    let response = h
        .http
        .get(h.url("/api/policies/a/policies/b"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h.http.get(h.url("/elsewhere")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert!(h.mock.seen().is_empty());
}

#[tokio::test]
async fn auth_guards_everything_but_health() {
    let h = Harness::start(|s| {
        s.with_auth(AuthConfig::basic("admin", "secret").with_api_key("k-1"))
    })
    .await;

    let response = h.http.get(h.url("/api/devices/ns:known")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));

    let response = h
        .http
        .get(h.url("/api/devices/ns:known"))
        .basic_auth("admin", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .http
        .get(h.url("/api/devices/ns:known"))
        .basic_auth("admin", Some("secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = h
        .http
        .get(h.url("/api/devices/ns:known"))
        .header("x-api-key", "k-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = h.http.get(h.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Only the two authorized requests reached the backend
    assert_eq!(h.mock.seen().len(), 2);
}

#[tokio::test]
async fn health_reports_faulted_ingestion() {
    let (tx, rx) = watch::channel(PipelineState::Listening);
    let h = Harness::start(|s| s.with_ingestion(rx)).await;

    let response = h.http.get(h.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ingestion"], "listening");

    tx.send_replace(PipelineState::Faulted("connection reset".into()));
    let response = h.http.get(h.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ingestion"], "faulted");
    assert_eq!(body["reason"], "connection reset");
}
