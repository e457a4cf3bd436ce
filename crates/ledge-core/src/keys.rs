//! Key chain derivation.
//!
//! A request fingerprint maps to a fixed set of co-located keys in the
//! metadata store. Derivation is a pure function of the root string; no two
//! distinct roots can collide because no suffix is a suffix of another.

use crate::types::Fingerprint;

/// Prefix namespacing every cache key in the store.
pub const KEY_PREFIX: &str = "ledge:cache:";

/// Global sorted set indexing entries by expiry (unix seconds → URI),
/// consumed by external priming and analysis tools.
pub const EXPIRES_QUEUE_KEY: &str = "ledge:expires_queue";

const SUFFIX_MAIN: &str = ":main";
const SUFFIX_ENTITIES: &str = ":entities";
const SUFFIX_FETCHING_LOCK: &str = ":fetching_lock";
const SUFFIX_REPSET: &str = ":repset";

/// The set of co-located keys derived from one request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChain {
    root: String,
}

impl KeyChain {
    /// Derives the chain for a fingerprint.
    #[must_use]
    pub fn from_fingerprint(fingerprint: &Fingerprint) -> Self {
        Self::from_root(&fingerprint.root())
    }

    /// Derives the chain from a raw root string (used by the background
    /// worker when mapping scanned `main` keys back to their chain).
    #[must_use]
    pub fn from_root(root: &str) -> Self {
        Self { root: format!("{KEY_PREFIX}{root}") }
    }

    /// Recovers a chain from a scanned `main` key, or `None` when the key is
    /// not a main key of this namespace.
    #[must_use]
    pub fn from_main_key(key: &str) -> Option<Self> {
        let prefixed = key.strip_suffix(SUFFIX_MAIN)?;
        prefixed.starts_with(KEY_PREFIX).then(|| Self { root: prefixed.to_string() })
    }

    /// The namespaced root, which doubles as the pub/sub channel for
    /// request collapsing.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Metadata field map: `status`, `expires`, `uri`, `entity`, `h:<name>`.
    #[must_use]
    pub fn main(&self) -> String {
        format!("{}{SUFFIX_MAIN}", self.root)
    }

    /// Set of every entity id ever written for this fingerprint (GC input).
    #[must_use]
    pub fn entities(&self) -> String {
        format!("{}{SUFFIX_ENTITIES}", self.root)
    }

    /// Ephemeral collapse lock; absent when no fetch is in progress.
    #[must_use]
    pub fn fetching_lock(&self) -> String {
        format!("{}{SUFFIX_FETCHING_LOCK}", self.root)
    }

    /// Pending subscriber/replica set for wildcard revalidation tracking.
    #[must_use]
    pub fn repset(&self) -> String {
        format!("{}{SUFFIX_REPSET}", self.root)
    }

    /// Keys whose TTLs move together under purge. The fetching lock is
    /// excluded; it manages its own TTL.
    #[must_use]
    pub fn ttl_bound_keys(&self) -> [String; 3] {
        [self.main(), self.entities(), self.repset()]
    }

    /// All keys removed by a delete purge, lock included.
    #[must_use]
    pub fn all_keys(&self) -> [String; 4] {
        [self.main(), self.entities(), self.fetching_lock(), self.repset()]
    }

    /// The `main`-key match pattern for a wildcard root (path containing
    /// `*`), fed to the keyspace scan.
    #[must_use]
    pub fn main_scan_pattern(&self) -> String {
        format!("{}{SUFFIX_MAIN}", self.root)
    }
}
