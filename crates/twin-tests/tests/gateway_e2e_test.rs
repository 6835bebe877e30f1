//! Gateway and ingestion wired together the way `twind` does it

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::Value;
use twin_api::{create_router, AppState};
use twin_client::testing::TestServer;
use twin_ingest::{InfluxSink, PipelineConfig, RestartPolicy, Supervisor};
use twin_tests::{MockEventStream, MockInflux, StreamScript};

const EVENT: &str = r#"{"thingId":"org.acme:s1","features":{"temp":{"properties":{"value":1}}}}"#;

async fn health(http: &reqwest::Client, gateway: &TestServer) -> (u16, Value) {
    let response = http
        .get(format!("{}/health", gateway.base_url()))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn health_follows_ingestion_state() {
    let stream = MockEventStream::new(vec![StreamScript::closing(&[EVENT])]);
    let backend = TestServer::start(stream.router()).await.unwrap();
    let influx = MockInflux::default();
    let influx_server = TestServer::start(influx.router()).await.unwrap();

    let client = backend.client.clone();
    let events_client = client.clone();
    let sink = InfluxSink::new(&MockInflux::config(&influx_server.base_url())).unwrap();
    let handle = Supervisor::new(
        move || events_client.event_connection(),
        Arc::new(sink),
        PipelineConfig::default(),
        RestartPolicy::Never,
    )
    .start()
    .await
    .unwrap();
    let mut ingestion = handle.state_receiver();

    let gateway = TestServer::start(create_router(
        AppState::new(client).with_ingestion(handle.state_receiver()),
    ))
    .await
    .unwrap();
    let http = reqwest::Client::new();

    // The scripted stream closes right after its only event
    tokio::time::timeout(Duration::from_secs(5), ingestion.wait_for(|s| s.is_faulted()))
        .await
        .unwrap()
        .unwrap();

    let (status, body) = health(&http, &gateway).await;
    assert_eq!(status, 503);
    assert_eq!(body["ingestion"], "faulted");

    // The gateway keeps proxying after ingestion is gone
    let response = http
        .get(format!("{}/api/devices/org.acme:s1", gateway.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    assert_eq!(influx.lines().len(), 1);
    assert!(handle.wait().await.is_err());
}

#[tokio::test]
async fn health_is_ok_while_listening() {
    let stream = MockEventStream::new(vec![StreamScript::open(&[])]);
    let backend = TestServer::start(stream.router()).await.unwrap();
    let influx = MockInflux::default();
    let influx_server = TestServer::start(influx.router()).await.unwrap();

    let client = backend.client.clone();
    let events_client = client.clone();
    let sink = InfluxSink::new(&MockInflux::config(&influx_server.base_url())).unwrap();
    let handle = Supervisor::new(
        move || events_client.event_connection(),
        Arc::new(sink),
        PipelineConfig::default(),
        RestartPolicy::Never,
    )
    .start()
    .await
    .unwrap();

    let gateway = TestServer::start(create_router(
        AppState::new(client).with_ingestion(handle.state_receiver()),
    ))
    .await
    .unwrap();
    let http = reqwest::Client::new();

    let (status, body) = health(&http, &gateway).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["ingestion"], "listening");

    handle.stop().await.unwrap();
    let (_, body) = health(&http, &gateway).await;
    assert_eq!(body["ingestion"], "stopped");
}
