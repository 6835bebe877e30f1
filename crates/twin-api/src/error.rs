//! API error types and conversions

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use twin_client::ClientError;
use twin_core::{render_response, TranslateError};

/// API error type that converts to HTTP responses
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request
    BadRequest(String),
    /// 401 Unauthorized
    Unauthorized(String),
    /// 404 Not Found
    NotFound(String),
    /// 502 Bad Gateway (backend unreachable or unreadable)
    BadGateway(String),
    /// 503 Service Unavailable
    ServiceUnavailable(String),
    /// 500 Internal Server Error
    Internal(String),
    /// Backend answered with an error status; relayed verbatim
    Upstream {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

/// Standard error response format
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Upstream {
                status,
                headers,
                body,
            } => {
                tracing::debug!(%status, "Relaying backend error");
                let relayed = render_response(status, &headers, body);
                return (relayed.status, relayed.headers, relayed.body).into_response();
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        // Log errors at appropriate levels
        if status.is_server_error() {
            tracing::error!(error = error_type, %message, "API error");
        } else if status.is_client_error() {
            tracing::debug!(error = error_type, %message, "API client error");
        }

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Status {
                status,
                headers,
                body,
            } => match StatusCode::from_u16(status) {
                Ok(status) => ApiError::Upstream {
                    status,
                    headers,
                    body: Bytes::from(body),
                },
                Err(_) => ApiError::BadGateway(format!("Backend returned invalid status {}", status)),
            },
            ClientError::Http(e) => ApiError::BadGateway(format!("Backend request failed: {}", e)),
            ClientError::Parse(msg) => {
                ApiError::BadGateway(format!("Unreadable backend response: {}", msg))
            }
            ClientError::InvalidSegment(id) => ApiError::BadRequest(format!("Invalid identifier: {:?}", id)),
            ClientError::InvalidUrl(e) => ApiError::Internal(format!("Invalid backend URL: {}", e)),
            ClientError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<TranslateError> for ApiError {
    fn from(err: TranslateError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}
