//! Application state

use std::sync::Arc;

use tokio::sync::watch;
use twin_client::BackendClient;
use twin_core::PathTranslator;
use twin_ingest::PipelineState;

use crate::auth::AuthConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Typed backend operations and passthrough transport
    pub client: BackendClient,
    /// Gateway-to-backend path and header rewriting
    pub translator: Arc<PathTranslator>,
    /// Ingestion state, reported by `/health` when present
    pub ingestion: Option<watch::Receiver<PipelineState>>,
    /// Caller authentication; `None` leaves the API open
    pub auth: Option<AuthConfig>,
    /// Create a policy named after the device when creating a device
    /// without one
    pub auto_create_policy: bool,
}

impl AppState {
    /// State with the translator derived from the client's backend URL and
    /// credentials
    pub fn new(client: BackendClient) -> Self {
        let translator = PathTranslator::new(client.base_url(), client.credentials().clone());
        Self::with_translator(client, translator)
    }

    pub fn with_translator(client: BackendClient, translator: PathTranslator) -> Self {
        Self {
            client,
            translator: Arc::new(translator),
            ingestion: None,
            auth: None,
            auto_create_policy: true,
        }
    }

    pub fn with_ingestion(mut self, state: watch::Receiver<PipelineState>) -> Self {
        self.ingestion = Some(state);
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth.is_enabled().then_some(auth);
        self
    }

    pub fn with_auto_create_policy(mut self, enabled: bool) -> Self {
        self.auto_create_policy = enabled;
        self
    }
}
