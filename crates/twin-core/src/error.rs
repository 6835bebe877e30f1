//! Common error types shared across the gateway crates

use thiserror::Error;

/// Result type for event-source operations
pub type EventResult<T> = Result<T, EventError>;

/// Result type for sink writes
pub type SinkResult<T> = Result<T, SinkError>;

/// Errors produced while translating a gateway path into a backend path.
///
/// All variants describe a malformed inbound path and map to 400.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// `.` or `..` segment in the inbound path
    #[error("Path contains a relative segment: {0}")]
    RelativeSegment(String),

    /// Keyword segment with nothing after it (e.g. `/policies/`)
    #[error("Missing identifier after '/{0}/'")]
    EmptyIdentifier(&'static str),

    /// Keyword segment occurring more than once
    #[error("Segment '/{0}/' occurs more than once")]
    RepeatedSegment(&'static str),

    /// The rewritten path does not form a valid backend URL
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// The backend URL resolves to a path outside the backend API root
    #[error("Path escapes the backend API root: {0}")]
    OutsideRoot(String),
}

/// Errors from the backend event subscription
#[derive(Debug, Error)]
pub enum EventError {
    /// `subscribe`/`read_frame` called without a live connection
    #[error("not connected to backend")]
    NotConnected,

    /// `connect` called while a connection is already live
    #[error("already connected to backend")]
    AlreadyConnected,

    /// Another event connection is already claimed from this client
    #[error("event connection already claimed for this client")]
    ConnectionClaimed,

    /// WebSocket handshake failed
    #[error("cannot connect to event stream: {0}")]
    Connect(String),

    /// Sending a control frame failed
    #[error("failed to send frame: {0}")]
    Send(String),

    /// Reading from the connection failed (reset, protocol error, ...)
    #[error("read error: {0}")]
    Read(String),

    /// Connection ended without a read error
    #[error("event stream closed: {0}")]
    Closed(String),
}

/// Errors returned by a [`crate::TimeSeriesSink`]
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sample cannot be represented as a point (empty tag, non-finite value)
    #[error("invalid point: {0}")]
    InvalidPoint(String),

    /// The sink could not be reached
    #[error("transport error: {0}")]
    Transport(String),

    /// The sink answered with a non-success status
    #[error("write rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}
