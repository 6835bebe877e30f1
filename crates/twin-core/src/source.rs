//! EventSource trait - the inbound side of the ingestion pipeline

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EventResult;

/// Control-frame prefix used to start an event subscription.
///
/// The backend echoes it back as an acknowledgment, so inbound text frames
/// starting with it are not events.
pub const SUBSCRIPTION_ACK_PREFIX: &str = "START-SEND-EVENTS";

/// A frame read from the event connection
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping,
    Pong,
    /// Remote close, with the close reason if one was sent
    Close(Option<String>),
}

impl Frame {
    pub fn text(s: impl Into<String>) -> Self {
        Frame::Text(s.into())
    }
}

/// A connection that delivers backend events frame by frame.
///
/// Implementations hold at most one live connection. The pipeline drives the
/// lifecycle: `connect`, then `subscribe`, then `read_frame` until it fails
/// or the pipeline stops and calls `close`.
#[async_trait]
pub trait EventSource: Send {
    /// Open the connection. Fails with `AlreadyConnected` when one is live.
    async fn connect(&mut self) -> EventResult<()>;

    /// Send the subscription control frame. Fails with `NotConnected`
    /// without a prior successful `connect`.
    async fn subscribe(&mut self, filter: &str) -> EventResult<()>;

    /// Wait for the next frame. A clean end of stream is reported as
    /// `Frame::Close`, a broken one as an error.
    async fn read_frame(&mut self) -> EventResult<Frame>;

    /// Tear down the connection. Safe to call when already closed.
    async fn close(&mut self) -> EventResult<()>;

    /// Whether a connection is currently live
    fn is_connected(&self) -> bool;
}
