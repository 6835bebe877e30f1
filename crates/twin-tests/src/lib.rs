//! End-to-end tests for the twin gateway
//!
//! The library half holds in-process stand-ins for the two external
//! services: [`MockEventStream`] plays the backend's `/ws/2` endpoint and
//! [`MockInflux`] the InfluxDB write API. Both are plain axum routers served
//! through [`twin_client::testing::TestServer`].
//!
//! # Test Structure
//!
//! - `ingestion_e2e_test.rs` - event stream to time-series store
//! - `gateway_e2e_test.rs` - gateway and ingestion wired as in `twind`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use twin_ingest::InfluxConfig;

/// What one event-stream connection does after acknowledging the
/// subscription
#[derive(Debug, Clone, Default)]
pub struct StreamScript {
    pub frames: Vec<String>,
    /// Close the socket once the frames are sent
    pub close: bool,
}

impl StreamScript {
    /// Send `frames` and keep the connection open
    pub fn open(frames: &[&str]) -> Self {
        Self {
            frames: frames.iter().map(|f| f.to_string()).collect(),
            close: false,
        }
    }

    /// Send `frames` and then close
    pub fn closing(frames: &[&str]) -> Self {
        Self {
            close: true,
            ..Self::open(frames)
        }
    }
}

#[derive(Debug, Default)]
struct StreamLog {
    connections: usize,
    subscriptions: Vec<String>,
    auth: Vec<Option<String>>,
}

/// Backend event stream stand-in.
///
/// Each connection consumes the next script; when the scripts run out the
/// connection is acknowledged and left idle.
#[derive(Clone, Default)]
pub struct MockEventStream {
    scripts: Arc<Mutex<VecDeque<StreamScript>>>,
    log: Arc<Mutex<StreamLog>>,
}

impl MockEventStream {
    pub fn new(scripts: Vec<StreamScript>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            log: Arc::default(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/2", get(upgrade))
            .with_state(self.clone())
    }

    pub fn connections(&self) -> usize {
        self.log.lock().connections
    }

    /// Subscription control messages, in arrival order
    pub fn subscriptions(&self) -> Vec<String> {
        self.log.lock().subscriptions.clone()
    }

    /// `Authorization` header of each connection
    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.log.lock().auth.clone()
    }
}

async fn upgrade(
    State(mock): State<MockEventStream>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    {
        let mut log = mock.log.lock();
        log.connections += 1;
        log.auth.push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
    }
    let script = mock.scripts.lock().pop_front().unwrap_or_default();
    ws.on_upgrade(move |socket| serve_stream(mock, socket, script))
}

async fn serve_stream(mock: MockEventStream, mut socket: WebSocket, script: StreamScript) {
    match socket.recv().await {
        Some(Ok(Message::Text(control))) => {
            mock.log.lock().subscriptions.push(control.as_str().to_string());
        }
        _ => return,
    }
    if socket
        .send(Message::Text("START-SEND-EVENTS:ACK".into()))
        .await
        .is_err()
    {
        return;
    }

    for frame in script.frames {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    if script.close {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // Idle until the client goes away
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

/// InfluxDB write API stand-in that keeps every line it receives
#[derive(Clone, Default)]
pub struct MockInflux {
    lines: Arc<Mutex<Vec<String>>>,
    auth: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockInflux {
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v2/write", post(write))
            .with_state(self.clone())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.auth.lock().clone()
    }

    /// Sink configuration pointing at this mock served on `base_url`
    pub fn config(base_url: &str) -> InfluxConfig {
        InfluxConfig {
            url: base_url.to_string(),
            token: "test-token".to_string(),
            org: "test-org".to_string(),
            bucket: "test-bucket".to_string(),
            ..Default::default()
        }
    }

    /// Wait until at least `count` lines arrived
    pub async fn wait_for_lines(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let lines = self.lines();
            if lines.len() >= count || tokio::time::Instant::now() >= deadline {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn write(State(mock): State<MockInflux>, headers: HeaderMap, body: String) -> StatusCode {
    mock.auth.lock().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    mock.lines.lock().extend(body.lines().map(str::to_string));
    StatusCode::NO_CONTENT
}
