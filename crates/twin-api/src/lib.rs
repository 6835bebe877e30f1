//! twin-api - gateway REST API
//!
//! Typed device endpoints under the external prefix (default `/api`), a
//! passthrough proxy for every other path under that prefix, and `/health`.
//!
//! # Usage
//!
//! ```ignore
//! use twin_api::{create_router, AppState};
//! use twin_client::BackendClient;
//!
//! let client = BackendClient::new("http://ditto:8080", credentials)?;
//! let router = create_router(AppState::new(client));
//! ```

pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;

pub use auth::{auth_middleware, AuthConfig, API_KEY_HEADER};
pub use error::ApiError;
pub use state::AppState;

use axum::middleware::from_fn;
use axum::routing::get;
use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use handlers::{devices, health, proxy};

/// Create the gateway router with the given application state
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Method mismatches on typed routes fall through to the proxy
    let typed = Router::new()
        .route("/devices", get(devices::list_devices).fallback(proxy::passthrough))
        .route(
            "/devices/{id}",
            get(devices::get_device)
                .put(devices::create_device)
                .patch(devices::update_device)
                .delete(devices::delete_device)
                .fallback(proxy::passthrough),
        )
        .route(
            "/devices/{id}/state",
            get(devices::get_device_state).fallback(proxy::passthrough),
        )
        .route(
            "/devices/{id}/features/{feature}/command",
            axum::routing::put(devices::send_command)
                .post(devices::send_command)
                .fallback(proxy::passthrough),
        );

    let prefix = state.translator.external_prefix().to_string();
    let router = Router::new().route("/health", get(health::health));
    let router = if prefix.is_empty() {
        router.merge(typed)
    } else {
        router.nest(&prefix, typed)
    };

    let mut router = router
        .fallback(proxy::passthrough)
        .with_state(state.clone());

    if let Some(auth) = state.auth {
        router = router
            .layer(from_fn(auth_middleware))
            .layer(Extension(auth));
    }

    router.layer(TraceLayer::new_for_http()).layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use twin_client::BackendClient;
    use twin_core::{BackendCredentials, PathTranslator};

    fn state() -> AppState {
        // Nothing listens here; only routes that stay local are exercised
        let client =
            BackendClient::new("http://127.0.0.1:1", BackendCredentials::new("u", "p")).unwrap();
        AppState::new(client)
    }

    async fn status_of(router: Router, method: &str, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn health_without_ingestion_is_ok() {
        assert_eq!(status_of(create_router(state()), "GET", "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn paths_outside_prefix_are_not_found() {
        assert_eq!(
            status_of(create_router(state()), "GET", "/metrics").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        assert_eq!(
            status_of(create_router(state()), "GET", "/api/devices/ns:x").await,
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn custom_prefix_moves_typed_routes() {
        let base = state();
        let translator = PathTranslator::new(base.client.base_url(), BackendCredentials::new("u", "p"))
            .with_external_prefix("/twins");
        let router = create_router(AppState::with_translator(base.client, translator));

        assert_eq!(
            status_of(router.clone(), "GET", "/api/devices/ns:x").await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(router, "GET", "/twins/devices/ns:x").await,
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn auth_rejects_before_touching_the_backend() {
        let router = create_router(state().with_auth(AuthConfig::basic("admin", "secret")));
        assert_eq!(
            status_of(router.clone(), "GET", "/api/devices/ns:x").await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_of(router, "GET", "/health").await, StatusCode::OK);
    }
}
