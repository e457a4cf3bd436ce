//! Core type definitions for cache state, requests, and the header bag.
//!
//! # Type Categories
//!
//! ## Cache classification
//! - [`CacheState`]: SUBZERO/COLD/WARM/HOT freshness classes
//! - [`CacheAction`]: how the response was obtained (fetched, collapsed, none)
//!
//! ## Wire types
//! - [`HeaderBag`]: insertion-order-preserving, case-preserving header map
//! - [`OriginResponse`]: captured upstream status/headers/body
//! - [`CacheEntry`]: the persisted metadata record for a fingerprint
//!
//! ## Request identity
//! - [`Fingerprint`]: canonical identifier for a cacheable request (method +
//!   URI + normalized query), the root of the key chain

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Crate version embedded into the `Via` header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headers that must not be persisted or forwarded downstream.
///
/// Hop-by-hop headers per RFC 7230 §6.1; they describe the connection, not
/// the entity.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Freshness classification of a cache entry relative to the current time.
///
/// Ordering matters: `X-Cache: HIT` is emitted iff the serving state is
/// `Warm` or better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheState {
    /// No metadata record, or the body entity is missing from storage.
    Subzero,
    /// Expired beyond the `serve_when_stale` window; treated as a miss.
    Cold,
    /// Expired but inside the `serve_when_stale` window; served immediately
    /// and revalidated in the background.
    Warm,
    /// Not yet expired.
    Hot,
}

impl CacheState {
    /// Static label for the `X-Cache-State` header and metrics counters.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subzero => "SUBZERO",
            Self::Cold => "COLD",
            Self::Warm => "WARM",
            Self::Hot => "HOT",
        }
    }

    /// Whether a response served in this state counts as a cache hit.
    #[must_use]
    pub fn is_hit(&self) -> bool {
        *self >= Self::Warm
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the response body was obtained, surfaced via `X-Cache-Action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// This request performed the origin fetch itself.
    Fetched,
    /// This request waited on another request's fetch and re-read the cache.
    Collapsed,
    /// Served straight from cache; no action header is emitted.
    None,
}

impl CacheAction {
    /// Header value, or `None` when no action header should be emitted.
    #[must_use]
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Self::Fetched => Some("FETCHED"),
            Self::Collapsed => Some("COLLAPSED"),
            Self::None => None,
        }
    }
}

/// Insertion-order-preserving, case-preserving header map.
///
/// Lookup is case-insensitive; the original capitalization is kept for
/// persistence and for replaying to the client. Repeated values for the same
/// name are kept as separate entries and collapsed by comma-joining on
/// [`HeaderBag::get_joined`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag {
    entries: Vec<(String, String)>,
}

impl HeaderBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all values for `name` with a single value. The new entry is
    /// appended at the end, preserving the order of unrelated headers.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Removes all values for `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` comma-joined, or `None` when absent.
    #[must_use]
    pub fn get_joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// Whether any value for `name` contains `token` as a comma-separated
    /// directive (case-insensitive). Used for `Cache-Control` inspection.
    #[must_use]
    pub fn has_directive(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|part| {
                let part = part.trim();
                let directive = part.split_once('=').map_or(part, |(d, _)| d).trim();
                directive.eq_ignore_ascii_case(token)
            })
    }

    /// Numeric argument of a `name: token=<n>` directive, e.g. `max-age=3600`.
    #[must_use]
    pub fn directive_arg(&self, name: &str, token: &str) -> Option<u64> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .find_map(|part| {
                let (directive, arg) = part.trim().split_once('=')?;
                if directive.trim().eq_ignore_ascii_case(token) {
                    arg.trim().trim_matches('"').parse().ok()
                } else {
                    None
                }
            })
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Copy of this bag without hop-by-hop headers.
    #[must_use]
    pub fn without_hop_by_hop(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(n, _)| !HOP_BY_HOP_HEADERS.iter().any(|h| n.eq_ignore_ascii_case(h)))
            .cloned()
            .collect();
        Self { entries }
    }
}

impl FromIterator<(String, String)> for HeaderBag {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Canonical identifier for a cacheable request: method + scheme + host +
/// path + normalized (sorted) query string.
///
/// The derived root string seeds the key chain; see [`crate::keys::KeyChain`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    method: String,
    uri: String,
}

impl Fingerprint {
    /// Builds a fingerprint, sorting query parameters so that
    /// `/p?a=1&b=2` and `/p?b=2&a=1` collapse to the same identity.
    #[must_use]
    pub fn new(method: &str, scheme: &str, host: &str, path: &str, query: Option<&str>) -> Self {
        let uri = match query {
            Some(q) if !q.is_empty() => {
                format!("{scheme}://{host}{path}?{}", Self::normalize_query(q))
            }
            _ => format!("{scheme}://{host}{path}"),
        };
        Self { method: method.to_ascii_uppercase(), uri }
    }

    fn normalize_query(query: &str) -> String {
        let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        pairs.sort_unstable();
        pairs.join("&")
    }

    /// The request method this fingerprint was derived from.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The full normalized URI (scheme://host/path?sorted-query).
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Root string for key chain derivation.
    #[must_use]
    pub fn root(&self) -> String {
        format!("{}:{}", self.method, self.uri)
    }
}

/// Captured upstream response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: HeaderBag,
    pub body: Bytes,
}

/// The persisted metadata record for a fingerprint: the `main` field map of
/// the key chain plus the entity reference into body storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Upstream status code at write time.
    pub status: u16,
    /// Full request URI, replayed by background revalidation.
    pub uri: String,
    /// Expiry as unix seconds. In the past means stale (WARM or COLD).
    pub expires: u64,
    /// Current body entity id in blob storage.
    pub entity: String,
    /// Response headers to replay (`h:<name>` fields).
    pub headers: HeaderBag,
    /// Request headers forwarded on background revalidation
    /// (`rh:<name>` fields), e.g. `Cookie` when configured.
    pub reval_headers: HeaderBag,
}

/// Unix seconds now. Single call site for time so tests can reason about it.
#[must_use]
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
