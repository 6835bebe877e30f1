//! Caller authentication middleware
//!
//! Accepts HTTP Basic credentials or an `X-API-Key` header. `/health` is
//! always open so orchestrators can probe it.

use axum::{
    extract::Request,
    http::{header::WWW_AUTHENTICATE, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use axum_extra::headers::{authorization::Basic, Authorization, HeaderMapExt};
use serde::Deserialize;
use serde_json::json;

/// Header carrying an API key
pub const API_KEY_HEADER: &str = "x-api-key";

const REALM: &str = "Basic realm=\"twin-gateway\"";

/// Credentials callers must present
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
}

impl AuthConfig {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Whether any credential is configured
    pub fn is_enabled(&self) -> bool {
        self.username.is_some() || self.api_key.is_some()
    }

    fn accepts_basic(&self, presented: &Basic) -> bool {
        match (&self.username, &self.password) {
            (Some(user), password) => {
                presented.username() == user
                    && presented.password() == password.as_deref().unwrap_or_default()
            }
            _ => false,
        }
    }

    fn accepts_key(&self, presented: &HeaderValue) -> bool {
        self.api_key
            .as_deref()
            .is_some_and(|key| presented.as_bytes() == key.as_bytes())
    }
}

/// Reject requests without valid credentials
pub async fn auth_middleware(
    Extension(auth): Extension<AuthConfig>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let headers = request.headers();
    let by_key = headers
        .get(API_KEY_HEADER)
        .is_some_and(|key| auth.accepts_key(key));
    let by_basic = headers
        .typed_get::<Authorization<Basic>>()
        .is_some_and(|Authorization(basic)| auth.accepts_basic(&basic));

    if by_key || by_basic {
        return next.run(request).await;
    }

    tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, REALM)],
        Json(json!({
            "error": "unauthorized",
            "message": "valid credentials required",
        })),
    )
        .into_response()
}
