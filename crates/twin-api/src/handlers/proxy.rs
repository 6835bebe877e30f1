//! Passthrough proxy
//!
//! Everything under the external prefix that no typed route claims is
//! rewritten by the [`PathTranslator`](twin_core::PathTranslator) and sent
//! to the backend as-is. Backend statuses, including errors, reach the
//! caller unchanged.

use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;

use super::relay;
use crate::error::ApiError;
use crate::state::AppState;

/// Fallback for `{prefix}/...`
pub async fn passthrough(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let path = uri.path();
    if !under_prefix(path, state.translator.external_prefix()) {
        return Err(ApiError::NotFound(format!("No route for {}", path)));
    }

    let outbound = state.translator.translate(&method, path, uri.query(), &headers)?;
    tracing::debug!(%method, from = %path, to = %outbound.url, "Proxying request");

    let body = reqwest::Body::wrap_stream(body.into_data_stream());
    let reply = state.client.forward(outbound, body).await?;
    Ok(relay(reply))
}

fn under_prefix(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
