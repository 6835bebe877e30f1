//! Path translation between the gateway namespace and the backend namespace.
//!
//! The gateway exposes `/api/devices/...`; the backend serves
//! `{backend}/api/2/things/...`. Everything here is pure: given an inbound
//! method, path, query and headers, produce the outbound URL and headers.
//! Bodies are never touched here; the caller streams them through.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use url::Url;

use crate::error::TranslateError;

/// Default external prefix stripped from inbound paths
pub const DEFAULT_EXTERNAL_PREFIX: &str = "/api";

/// Path under the backend base URL that all REST resources live under
pub const BACKEND_API_ROOT: &str = "/api/2";

const POLICIES: &str = "/policies/";
const COMMANDS: &str = "/commands/";

/// Credentials the gateway presents to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCredentials {
    pub username: String,
    pub password: String,
}

impl BackendCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(user:pass)>`
    pub fn basic_header(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {}", encoded)
    }

    /// The Basic header as a sensitive header value
    pub fn header_value(&self) -> HeaderValue {
        // base64 output is always a valid header value
        let mut value = HeaderValue::from_str(&self.basic_header())
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        value.set_sensitive(true);
        value
    }
}

/// A translated request, ready for the backend client to execute
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

/// A backend response prepared for relaying to the gateway caller
#[derive(Debug, Clone)]
pub struct PassthroughResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Maps gateway requests onto backend requests.
///
/// Rules are applied in a fixed order:
///
/// 1. strip the external prefix at a segment boundary
/// 2. `devices` as first segment becomes `things`
/// 3. a path containing `/policies/{id}` is replaced by `/policies/{id}`
/// 4. `{prefix}/commands/{subject}` becomes `{prefix}/inbox/messages/{subject}`
///
/// The query string is carried verbatim. Headers are copied minus hop-by-hop
/// headers, `Host` and `Content-Length`, and the backend's Basic credentials
/// replace any client `Authorization`.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    external_prefix: String,
    backend_root: String,
    root_path: String,
    credentials: BackendCredentials,
}

impl PathTranslator {
    /// Create a translator for the backend at `backend_url`
    /// (e.g. `http://ditto:8080`).
    pub fn new(backend_url: &Url, credentials: BackendCredentials) -> Self {
        let backend_root = format!(
            "{}{}",
            backend_url.as_str().trim_end_matches('/'),
            BACKEND_API_ROOT
        );
        let root_path = format!(
            "{}{}",
            backend_url.path().trim_end_matches('/'),
            BACKEND_API_ROOT
        );
        Self {
            external_prefix: DEFAULT_EXTERNAL_PREFIX.to_string(),
            backend_root,
            root_path,
            credentials,
        }
    }

    /// Use a different external prefix. An empty prefix or `/` disables
    /// prefix stripping.
    pub fn with_external_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.external_prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    /// `{backend_url}/api/2`
    pub fn backend_root(&self) -> &str {
        &self.backend_root
    }

    pub fn external_prefix(&self) -> &str {
        &self.external_prefix
    }

    pub fn credentials(&self) -> &BackendCredentials {
        &self.credentials
    }

    /// Translate an inbound path into a path relative to the backend root.
    ///
    /// ```
    /// # use twin_core::routing::{BackendCredentials, PathTranslator};
    /// # let base = url::Url::parse("http://ditto:8080").unwrap();
    /// let t = PathTranslator::new(&base, BackendCredentials::new("u", "p"));
    /// assert_eq!(t.translate_path("/api/devices/ns:x").unwrap(), "/things/ns:x");
    /// assert_eq!(t.translate_path("/api/x/policies/P").unwrap(), "/policies/P");
    /// assert_eq!(
    ///     t.translate_path("/api/devices/ns:x/commands/reboot").unwrap(),
    ///     "/things/ns:x/inbox/messages/reboot"
    /// );
    /// ```
    pub fn translate_path(&self, path: &str) -> Result<String, TranslateError> {
        if let Some(seg) = path.split(['/', '\\']).find(|s| is_dot_segment(s)) {
            return Err(TranslateError::RelativeSegment(seg.to_string()));
        }

        let mut path = strip_external_prefix(path, &self.external_prefix);

        if let Some(rest) = path.strip_prefix("/devices") {
            if rest.is_empty() || rest.starts_with('/') {
                path = format!("/things{}", rest);
            }
        }

        if let Some((_, id)) = split_keyword(&path, POLICIES, "policies")? {
            path = format!("/policies/{}", id);
        }

        if let Some((prefix, subject)) = split_keyword(&path, COMMANDS, "commands")? {
            path = format!("{}/inbox/messages/{}", prefix, subject);
        }

        Ok(path)
    }

    /// Full backend URL for a translated path plus the verbatim query string
    pub fn backend_url(&self, backend_path: &str, query: Option<&str>) -> Result<Url, TranslateError> {
        let mut url = Url::parse(&format!("{}{}", self.backend_root, backend_path))
            .map_err(|e| TranslateError::InvalidUrl(e.to_string()))?;

        // URL parsing resolves dot segments; the result must stay under the root
        let path = url.path();
        let under_root = path
            .strip_prefix(self.root_path.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if !under_root {
            return Err(TranslateError::OutsideRoot(path.to_string()));
        }

        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    /// Translate a whole inbound request
    pub fn translate(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<OutboundRequest, TranslateError> {
        let backend_path = self.translate_path(path)?;
        let url = self.backend_url(&backend_path, query)?;

        let mut out = HeaderMap::with_capacity(headers.len() + 1);
        for (name, value) in headers {
            if is_hop_by_hop_header(name.as_str())
                || name == HOST
                || name == CONTENT_LENGTH
                || name == AUTHORIZATION
            {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
        out.insert(AUTHORIZATION, self.credentials.header_value());

        Ok(OutboundRequest {
            method: method.clone(),
            url,
            headers: out,
        })
    }
}

/// Prepare a backend response for the gateway caller.
///
/// Hop-by-hop headers and `Content-Length` are dropped. A body that decodes
/// as JSON is re-encoded compactly and labelled `application/json`; anything
/// else is passed through with its original content type.
pub fn render_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> PassthroughResponse {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop_header(name.as_str()) || name == CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let body = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(json) => match serde_json::to_vec(&json) {
            Ok(encoded) => {
                out.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                );
                Bytes::from(encoded)
            }
            Err(_) => body,
        },
        Err(_) => body,
    };

    PassthroughResponse {
        status,
        headers: out,
        body,
    }
}

/// Headers that only apply to a single transport hop
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// `.` or `..`, also in percent-encoded form (`%2e`, `.%2E`, ...)
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

fn strip_external_prefix(path: &str, prefix: &str) -> String {
    let rest = if prefix.is_empty() {
        path
    } else {
        match path.strip_prefix(prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        }
    };

    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

/// Split `path` around a single occurrence of `keyword`.
fn split_keyword<'a>(
    path: &'a str,
    keyword: &str,
    name: &'static str,
) -> Result<Option<(&'a str, &'a str)>, TranslateError> {
    match path.matches(keyword).count() {
        0 => Ok(None),
        1 => {
            let Some((prefix, rest)) = path.split_once(keyword) else {
                return Ok(None);
            };
            if rest.is_empty() {
                return Err(TranslateError::EmptyIdentifier(name));
            }
            Ok(Some((prefix, rest)))
        }
        _ => Err(TranslateError::RepeatedSegment(name)),
    }
}
