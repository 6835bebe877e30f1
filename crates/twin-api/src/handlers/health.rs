//! Health endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// GET /health
///
/// 503 once ingestion has faulted; the gateway itself keeps serving.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let Some(ingestion) = state.ingestion.as_ref() else {
        return (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                ingestion: None,
                reason: None,
            }),
        );
    };

    let current = ingestion.borrow().clone();
    let reason = match &current {
        twin_ingest::PipelineState::Faulted(reason) => Some(reason.clone()),
        _ => None,
    };
    let status = if reason.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(HealthResponse {
            status: if reason.is_some() { "degraded" } else { "ok" },
            ingestion: Some(current.as_str()),
            reason,
        }),
    )
}
