//! Origin fetcher.
//!
//! Issues the upstream request, captures status/headers/body, and decides
//! cacheability per the RFC 7234 subset: a response is stored only for GET,
//! only when it carries a parseable future expiry (`Cache-Control: max-age`
//! taking precedence over `Expires`), and never when a deny token is
//! present on either side.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, ClientBuilder};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::UpstreamConfig,
    types::{HeaderBag, OriginResponse},
};

/// `Cache-Control` tokens that forbid storing a response.
const RESPONSE_DENY_TOKENS: &[&str] = &["no-cache", "no-store", "must-revalidate", "private"];

/// Errors reaching the origin. Upstream HTTP error statuses are not errors
/// here; they are captured responses forwarded to the client unchanged.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OriginError {
    /// The request exceeded the configured timeout.
    #[error("origin request timeout")]
    Timeout,

    /// Connection could not be established.
    #[error("origin connection failed: {0}")]
    ConnectionFailed(String),

    /// Other network-level failure from the HTTP client.
    #[error("origin network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The client could not be constructed.
    #[error("origin client build failed: {0}")]
    Build(String),
}

impl OriginError {
    /// Whether a retry may succeed. Background revalidation uses this to
    /// decide between requeueing and leaving the entry in place.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_) | Self::Network(_))
    }
}

/// Sanitizes network errors so upstream addresses never leak to clients.
fn sanitize_network_error(error: &reqwest::Error) -> String {
    if error.is_connect() {
        "connection refused or unreachable".to_string()
    } else if error.is_timeout() {
        "connection timed out".to_string()
    } else if error.is_body() {
        "response body error".to_string()
    } else {
        "network error".to_string()
    }
}

/// HTTP client bound to the single configured origin.
pub struct OriginFetcher {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl OriginFetcher {
    /// Builds the fetcher from upstream configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OriginError::Build`] if the underlying reqwest client fails
    /// to build.
    pub fn new(config: &UpstreamConfig) -> Result<Self, OriginError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("ledge/{}", crate::types::VERSION))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                warn!(error = %e, "failed to build origin client");
                OriginError::Build(e.to_string())
            })?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", config.host, config.port),
            timeout: Duration::from_secs(config.read_timeout_seconds),
        })
    }

    /// Issues a request for `relative_uri` (path plus query), forwarding the
    /// given request headers minus hop-by-hop ones.
    ///
    /// # Errors
    ///
    /// Returns [`OriginError`] only for transport-level failures; any HTTP
    /// status from the origin is a successful capture.
    pub async fn fetch(
        &self,
        method: &str,
        relative_uri: &str,
        headers: &HeaderBag,
        body: Option<Bytes>,
    ) -> Result<OriginResponse, OriginError> {
        let url = format!("{}{relative_uri}", self.base_url);
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| OriginError::Build(e.to_string()))?;

        let mut request = self.client.request(method, &url).timeout(self.timeout);
        for (name, value) in headers.without_hop_by_hop().iter() {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                OriginError::Timeout
            } else if e.is_connect() {
                OriginError::ConnectionFailed(sanitize_network_error(&e))
            } else {
                OriginError::Network(e)
            }
        })?;

        let status = response.status().as_u16();
        let mut captured = HeaderBag::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                captured.append(name.as_str(), value);
            }
        }
        let body = response.bytes().await.map_err(OriginError::Network)?;

        debug!(uri = relative_uri, status = status, bytes = body.len(), "origin fetched");
        Ok(OriginResponse { status, headers: captured, body })
    }
}

/// Whether the request permits caching at all: GET method and no bypass
/// headers (`Cache-Control: no-cache` / `Pragma: no-cache`). A bypassed
/// request still fetches, it just never stores.
#[must_use]
pub fn request_allows_caching(method: &str, headers: &HeaderBag) -> bool {
    if !method.eq_ignore_ascii_case("GET") {
        return false;
    }
    !(headers.has_directive("Cache-Control", "no-cache")
        || headers.has_directive("Pragma", "no-cache"))
}

/// Computes the storable expiry of a response as unix seconds, or `None`
/// when the response must not be cached.
#[must_use]
pub fn response_expiry(response: &OriginResponse, now: u64) -> Option<u64> {
    if response.headers.has_directive("Pragma", "no-cache") {
        return None;
    }
    for token in RESPONSE_DENY_TOKENS {
        if response.headers.has_directive("Cache-Control", token) {
            return None;
        }
    }

    // max-age (and its shared-cache variant) wins over Expires.
    let max_age = response
        .headers
        .directive_arg("Cache-Control", "s-maxage")
        .or_else(|| response.headers.directive_arg("Cache-Control", "max-age"));
    if let Some(max_age) = max_age {
        if max_age == 0 {
            return None;
        }
        return Some(now + max_age);
    }

    let expires = response.headers.get("Expires")?;
    let parsed = chrono::DateTime::parse_from_rfc2822(expires).ok()?;
    let expires = u64::try_from(parsed.timestamp()).ok()?;
    (expires > now).then_some(expires)
}

/// Strips `scheme://host` from a stored full URI, yielding the relative
/// part the fetcher needs when replaying a request.
#[must_use]
pub fn relative_uri(full_uri: &str) -> &str {
    let after_scheme = match full_uri.find("://") {
        Some(idx) => &full_uri[idx + 3..],
        None => return full_uri,
    };
    match after_scheme.find('/') {
        Some(idx) => &after_scheme[idx..],
        None => "/",
    }
}
