//! Twin backend HTTP client implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};
use twin_core::routing::BACKEND_API_ROOT;
use twin_core::{
    BackendCredentials, DeviceFilter, Entity, EventError, EventResult, OutboundRequest,
};
use url::Url;

use crate::error::{ClientError, Result};
use crate::events::EventConnection;
use crate::policy::{default_policy, DEFAULT_POLICY_SUBJECT};

/// Path of the event WebSocket under the backend host
pub const EVENTS_PATH: &str = "/ws/2";

/// Derive the event WebSocket URL from the REST base URL.
///
/// `http` becomes `ws`, `https` becomes `wss`, and `/ws/2` is appended to
/// the base path.
///
/// ```
/// # use twin_client::events_url;
/// let base = url::Url::parse("https://ditto.example.com:8443").unwrap();
/// assert_eq!(events_url(&base).unwrap().as_str(), "wss://ditto.example.com:8443/ws/2");
///
/// let base = url::Url::parse("http://gateway.local/ditto/").unwrap();
/// assert_eq!(events_url(&base).unwrap().as_str(), "ws://gateway.local/ditto/ws/2");
/// ```
pub fn events_url(base: &Url) -> Result<Url> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let host = base.host_str().ok_or(url::ParseError::EmptyHost)?;
    let authority = match base.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Ok(Url::parse(&format!(
        "{}://{}{}{}",
        scheme,
        authority,
        base.path().trim_end_matches('/'),
        EVENTS_PATH
    ))?)
}

/// Optional client tuning. Unset timeouts fall back to reqwest defaults.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Overrides the WebSocket URL derived from the base URL
    pub events_url: Option<Url>,
    /// Owner subject of the default policy
    pub policy_subject: Option<String>,
}

/// A backend response, status and body kept for passthrough
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendReply {
    async fn read(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// Fail with [`ClientError::Status`] unless the status is accepted
    fn accept(self, accepted: &[StatusCode]) -> Result<Self> {
        if accepted.contains(&self.status) {
            Ok(self)
        } else {
            Err(ClientError::status_with_headers(
                self.status.as_u16(),
                self.headers,
                String::from_utf8_lossy(&self.body),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    items: Vec<Entity>,
}

/// Twin backend REST client
///
/// Every request carries the backend Basic credentials. Clones share the
/// connection pool and the event-connection claim.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: Url,
    root: String,
    credentials: BackendCredentials,
    events_url: Url,
    policy_subject: String,
    event_claim: Arc<AtomicBool>,
}

impl BackendClient {
    /// Create a new backend client
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the backend (e.g., "http://localhost:8080")
    /// * `credentials` - Basic credentials sent with every request
    pub fn new(base_url: &str, credentials: BackendCredentials) -> Result<Self> {
        Self::with_config(base_url, credentials, ClientConfig::default())
    }

    /// Create a new backend client with custom configuration
    pub fn with_config(
        base_url: &str,
        credentials: BackendCredentials,
        config: ClientConfig,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build()?;

        let base_url = Url::parse(base_url)?;
        let root = format!(
            "{}{}",
            base_url.as_str().trim_end_matches('/'),
            BACKEND_API_ROOT
        );
        let events_url = match config.events_url {
            Some(url) => url,
            None => events_url(&base_url)?,
        };

        Ok(Self {
            client,
            base_url,
            root,
            credentials,
            events_url,
            policy_subject: config
                .policy_subject
                .unwrap_or_else(|| DEFAULT_POLICY_SUBJECT.to_string()),
            event_claim: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base_url}/api/2`
    pub fn root(&self) -> &str {
        &self.root
    }

    /// URL the event connection dials
    pub fn events_url(&self) -> &Url {
        &self.events_url
    }

    pub fn credentials(&self) -> &BackendCredentials {
        &self.credentials
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!("{}{}", self.root, path))?)
    }

    /// Root URL extended by `segments`, each percent-encoded as a whole
    /// segment so ids carrying `/`, `?`, `#` or spaces stay in one piece.
    fn segments_url(&self, segments: &[&str]) -> Result<Url> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(ClientError::InvalidSegment(bad.to_string()));
        }

        let mut url = Url::parse(&self.root)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments.iter().copied());
        Ok(url)
    }

    fn thing_url(&self, id: &str) -> Result<Url> {
        self.segments_url(&["things", id])
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(http::header::AUTHORIZATION, self.credentials.header_value())
    }

    // =========================================================================
    // Entity Operations
    // =========================================================================

    /// Fetch one entity. Accepts 200 only.
    #[instrument(skip(self))]
    pub async fn get_entity(&self, id: &str) -> Result<Entity> {
        let url = self.thing_url(id)?;
        debug!("Fetching entity from {}", url);

        let response = self.request(Method::GET, url).send().await?;
        let reply = BackendReply::read(response).await?.accept(&[StatusCode::OK])?;
        serde_json::from_slice(&reply.body).map_err(|e| ClientError::Parse(e.to_string()))
    }

    /// Create an entity. Accepts 201 and 204.
    #[instrument(skip(self, entity))]
    pub async fn create_entity(&self, id: &str, entity: &Entity) -> Result<BackendReply> {
        let url = self.thing_url(id)?;
        let response = self.request(Method::PUT, url).json(entity).send().await?;
        BackendReply::read(response)
            .await?
            .accept(&[StatusCode::CREATED, StatusCode::NO_CONTENT])
    }

    /// Replace an existing entity. Accepts 204 only.
    #[instrument(skip(self, entity))]
    pub async fn update_entity(&self, id: &str, entity: &Entity) -> Result<BackendReply> {
        let url = self.thing_url(id)?;
        let response = self.request(Method::PUT, url).json(entity).send().await?;
        BackendReply::read(response)
            .await?
            .accept(&[StatusCode::NO_CONTENT])
    }

    /// Delete an entity. Accepts 204 only.
    #[instrument(skip(self))]
    pub async fn delete_entity(&self, id: &str) -> Result<BackendReply> {
        let url = self.thing_url(id)?;
        let response = self.request(Method::DELETE, url).send().await?;
        BackendReply::read(response)
            .await?
            .accept(&[StatusCode::NO_CONTENT])
    }

    /// Search entities matching the filter. Accepts 200 only.
    ///
    /// Results are re-checked locally against the filter.
    #[instrument(skip(self))]
    pub async fn list_entities(&self, filter: &DeviceFilter) -> Result<Vec<Entity>> {
        let mut url = self.url("/search/things")?;
        let rql = filter.to_rql();
        url.query_pairs_mut().append_pair("filter", &rql);
        debug!(filter = %rql, "Searching entities");

        let response = self.request(Method::GET, url).send().await?;
        let reply = BackendReply::read(response).await?.accept(&[StatusCode::OK])?;
        let result: SearchResult =
            serde_json::from_slice(&reply.body).map_err(|e| ClientError::Parse(e.to_string()))?;

        Ok(result
            .items
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    // =========================================================================
    // Policy Operations
    // =========================================================================

    /// Create the default policy under `id`. Accepts 201 and 204.
    #[instrument(skip(self))]
    pub async fn create_policy(&self, id: &str) -> Result<BackendReply> {
        let url = self.segments_url(&["policies", id])?;
        let policy = default_policy(&self.policy_subject);

        let response = self.request(Method::PUT, url).json(&policy).send().await?;
        BackendReply::read(response)
            .await?
            .accept(&[StatusCode::CREATED, StatusCode::NO_CONTENT])
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Send a command message to a feature inbox.
    ///
    /// Any backend status is returned as-is for the caller to relay.
    #[instrument(skip(self, params))]
    pub async fn send_command(
        &self,
        id: &str,
        feature: &str,
        command: &str,
        params: &Map<String, Value>,
    ) -> Result<BackendReply> {
        let url = self.segments_url(&[
            "things", id, "features", feature, "inbox", "messages", command,
        ])?;

        let response = self.request(Method::PUT, url).json(params).send().await?;
        let reply = BackendReply::read(response).await?;
        if !reply.status.is_success() {
            warn!(status = %reply.status, "Command rejected by backend");
        }
        Ok(reply)
    }

    // =========================================================================
    // Passthrough
    // =========================================================================

    /// Execute a translated request, streaming `body` through unmodified.
    ///
    /// The outbound headers already carry the credentials. Any status is
    /// returned; only transport failures are errors.
    #[instrument(skip(self, outbound, body), fields(method = %outbound.method, url = %outbound.url))]
    pub async fn forward(
        &self,
        outbound: OutboundRequest,
        body: impl Into<reqwest::Body>,
    ) -> Result<BackendReply> {
        let response = self
            .client
            .request(outbound.method, outbound.url)
            .headers(outbound.headers)
            .body(body)
            .send()
            .await?;
        debug!(status = %response.status(), "Backend responded");
        BackendReply::read(response).await
    }

    // =========================================================================
    // Event Stream
    // =========================================================================

    /// Claim the event connection for this client.
    ///
    /// Only one connection may exist at a time across all clones; the claim
    /// is released when the returned connection is dropped.
    pub fn event_connection(&self) -> EventResult<EventConnection> {
        if self
            .event_claim
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EventError::ConnectionClaimed);
        }

        Ok(EventConnection::new(
            self.events_url.clone(),
            self.credentials.clone(),
            self.event_claim.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> BackendCredentials {
        BackendCredentials::new("ditto", "ditto")
    }

    #[test]
    fn test_client_creation() {
        let client = BackendClient::new("http://localhost:8080", creds()).unwrap();
        assert_eq!(client.root(), "http://localhost:8080/api/2");
        assert_eq!(client.events_url().as_str(), "ws://localhost:8080/ws/2");
    }

    #[test]
    fn test_invalid_url() {
        assert!(BackendClient::new("not a url", creds()).is_err());
    }

    #[test]
    fn events_url_override() {
        let config = ClientConfig {
            events_url: Some(Url::parse("ws://events:9000/ws/2").unwrap()),
            ..Default::default()
        };
        let client = BackendClient::with_config("http://ditto:8080", creds(), config).unwrap();
        assert_eq!(client.events_url().as_str(), "ws://events:9000/ws/2");
    }

    #[test]
    fn ids_stay_in_one_path_segment() {
        let client = BackendClient::new("http://ditto:8080", creds()).unwrap();
        let thing = |id: &str| client.thing_url(id).unwrap();

        assert_eq!(
            thing("org.acme:s1").as_str(),
            "http://ditto:8080/api/2/things/org.acme:s1"
        );
        assert_eq!(thing("a/b").path(), "/api/2/things/a%2Fb");
        assert_eq!(thing("50%").path(), "/api/2/things/50%25");

        let url = thing("ns:a?b=c");
        assert_eq!(url.path(), "/api/2/things/ns:a%3Fb=c");
        assert_eq!(url.query(), None);

        let url = thing("ns:a#frag");
        assert_eq!(url.path(), "/api/2/things/ns:a%23frag");
        assert_eq!(url.fragment(), None);

        assert_eq!(thing("ns a").path(), "/api/2/things/ns%20a");
    }

    #[test]
    fn command_urls_escape_every_part() {
        let client = BackendClient::new("http://ditto:8080/", creds()).unwrap();
        let url = client
            .segments_url(&["things", "ns:x", "features", "door?x", "inbox", "messages", "open#now"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://ditto:8080/api/2/things/ns:x/features/door%3Fx/inbox/messages/open%23now"
        );
    }

    #[test]
    fn dot_and_empty_ids_are_rejected() {
        let client = BackendClient::new("http://ditto:8080", creds()).unwrap();
        for id in ["", ".", ".."] {
            assert!(matches!(
                client.thing_url(id),
                Err(ClientError::InvalidSegment(_))
            ));
        }
    }

    #[test]
    fn events_url_keeps_base_path() {
        let base = Url::parse("http://h/ditto").unwrap();
        assert_eq!(events_url(&base).unwrap().as_str(), "ws://h/ditto/ws/2");

        let base = Url::parse("https://h:8443/twins/ditto/").unwrap();
        assert_eq!(events_url(&base).unwrap().as_str(), "wss://h:8443/twins/ditto/ws/2");

        let base = Url::parse("http://h:8080").unwrap();
        assert_eq!(events_url(&base).unwrap().as_str(), "ws://h:8080/ws/2");
    }

    #[test]
    fn event_connection_is_exclusive() {
        let client = BackendClient::new("http://localhost:8080", creds()).unwrap();
        let clone = client.clone();

        let conn = client.event_connection().unwrap();
        assert!(matches!(
            clone.event_connection(),
            Err(EventError::ConnectionClaimed)
        ));

        drop(conn);
        assert!(clone.event_connection().is_ok());
    }
}
