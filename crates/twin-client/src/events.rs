//! WebSocket event connection to the twin backend
//!
//! One connection per [`BackendClient`](crate::BackendClient). The ingestion
//! pipeline drives it through the [`EventSource`] trait: connect, send the
//! subscription control frame, then read frames until the stream ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use twin_core::{BackendCredentials, EventError, EventResult, EventSource, Frame};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the subscription control frame for `filter`.
///
/// The filter is form-encoded, so spaces become `+`.
///
/// ```
/// # use twin_client::subscription_message;
/// assert_eq!(
///     subscription_message("exists(thingId)"),
///     "START-SEND-EVENTS?filter=exists%28thingId%29"
/// );
/// ```
pub fn subscription_message(filter: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(filter.as_bytes()).collect();
    format!("{}?filter={}", twin_core::SUBSCRIPTION_ACK_PREFIX, encoded)
}

/// The backend event stream
pub struct EventConnection {
    url: Url,
    credentials: BackendCredentials,
    claim: Arc<AtomicBool>,
    socket: Option<WsStream>,
}

impl EventConnection {
    pub(crate) fn new(url: Url, credentials: BackendCredentials, claim: Arc<AtomicBool>) -> Self {
        Self {
            url,
            credentials,
            claim,
            socket: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn socket(&mut self) -> EventResult<&mut WsStream> {
        self.socket.as_mut().ok_or(EventError::NotConnected)
    }
}

impl std::fmt::Debug for EventConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConnection")
            .field("url", &self.url.as_str())
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

#[async_trait]
impl EventSource for EventConnection {
    async fn connect(&mut self) -> EventResult<()> {
        if self.socket.is_some() {
            return Err(EventError::AlreadyConnected);
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| EventError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            http::header::AUTHORIZATION,
            self.credentials.header_value(),
        );

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| EventError::Connect(e.to_string()))?;
        info!(url = %self.url, status = %response.status(), "Connected to event stream");

        self.socket = Some(socket);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> EventResult<()> {
        let message = subscription_message(filter);
        let socket = self.socket()?;
        socket
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| EventError::Send(e.to_string()))?;
        info!(filter, "Subscribed to events");
        Ok(())
    }

    async fn read_frame(&mut self) -> EventResult<Frame> {
        loop {
            let next = self.socket()?.next().await;
            let frame = match next {
                Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_string()),
                Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                Some(Ok(Message::Ping(_))) => Frame::Ping,
                Some(Ok(Message::Pong(_))) => Frame::Pong,
                Some(Ok(Message::Close(close))) => {
                    let reason = close.map(|c| c.reason.as_str().to_string());
                    debug!(?reason, "Backend closed the event stream");
                    self.socket = None;
                    Frame::Close(reason)
                }
                // Raw frames are never yielded while reading
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "Event stream read failed");
                    self.socket = None;
                    return Err(EventError::Read(e.to_string()));
                }
                None => {
                    self.socket = None;
                    Frame::Close(None)
                }
            };
            return Ok(frame);
        }
    }

    async fn close(&mut self) -> EventResult<()> {
        if let Some(mut socket) = self.socket.take() {
            debug!("Closing event stream");
            if let Err(e) = socket.close(None).await {
                debug!(error = %e, "Close handshake failed");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

impl Drop for EventConnection {
    fn drop(&mut self) {
        self.claim.store(false, Ordering::Release);
    }
}
