//! Error types for backend client operations

use http::HeaderMap;
use thiserror::Error;

/// Result type alias for backend client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur talking to the twin backend
#[derive(Error, Debug)]
pub enum ClientError {
    /// Backend answered with a status outside the accepted set.
    /// Headers and body are kept so the gateway can pass them through verbatim.
    #[error("Backend returned status {status}: {body}")]
    Status {
        status: u16,
        headers: HeaderMap,
        body: String,
    },

    /// HTTP request could not be built or sent
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Identifier that cannot stand as a single URL path segment
    #[error("Invalid path segment: {0:?}")]
    InvalidSegment(String),

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl ClientError {
    /// Create a status error from status code and body
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::status_with_headers(status, HeaderMap::new(), body)
    }

    /// Create a status error that keeps the backend's response headers
    pub fn status_with_headers(status: u16, headers: HeaderMap, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            headers,
            body: body.into(),
        }
    }

    /// The backend status code, if the backend answered at all
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
