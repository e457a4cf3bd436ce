//! Metadata store adapter.
//!
//! The key-value store is the sole source of cross-request truth: the
//! metadata field map, the entity id set, the collapse lock, and the pub/sub
//! channel all live here. [`MetadataStore`] exposes the semantic operations
//! the engine needs; [`RedisMetadataStore`] maps them onto pipelined and
//! transactional Redis commands.
//!
//! Every trait method is a suspension point. No in-process locks are held
//! across them; cross-request coordination goes through the store itself.

mod redis_store;

pub use redis_store::RedisMetadataStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{keys::KeyChain, types::CacheEntry};

/// Errors from the key-value store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store is unreachable or a command failed at the protocol level.
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A reply did not have the expected shape (missing or malformed field).
    #[error("unexpected reply shape for {key}: {detail}")]
    UnexpectedShape { key: String, detail: String },

    /// A pub/sub subscription ended before a message arrived.
    #[error("subscription lost on channel {0}")]
    SubscriptionLost(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed. Callers apply their own
    /// retry policy; the adapter never retries internally.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::SubscriptionLost(_) => true,
            Self::UnexpectedShape { .. } => false,
        }
    }
}

/// Semantic operations over the external key-value store.
///
/// Implementations must make [`commit_entry`](MetadataStore::commit_entry),
/// [`expire_chain`](MetadataStore::expire_chain), and
/// [`delete_chain`](MetadataStore::delete_chain) atomic with respect to
/// other readers of the same chain: either every key in the chain observes
/// the new state or none does.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Reads the `main` field map into a [`CacheEntry`], or `None` when no
    /// record exists.
    async fn read_entry(&self, chain: &KeyChain) -> Result<Option<CacheEntry>, StoreError>;

    /// Commits a full entry in one transaction: replaces the `main` field
    /// map, adds the entity id to the `entities` set, applies `ttl` to every
    /// TTL-bound key in the chain, and indexes the expiry in the global
    /// expires queue.
    async fn commit_entry(
        &self,
        chain: &KeyChain,
        entry: &CacheEntry,
        ttl: u64,
    ) -> Result<(), StoreError>;

    /// Remaining TTL of the `main` key in seconds, or `None` when the key is
    /// missing or has no expiry.
    async fn chain_ttl(&self, chain: &KeyChain) -> Result<Option<u64>, StoreError>;

    /// Atomically expires a chain: sets `expires = now - 1` and reduces every
    /// TTL-bound key's TTL by the time the entry had left until expiry.
    ///
    /// Returns `Some(new_ttl)` when applied, `None` when the record is
    /// missing or already expired (no-op). The caller is responsible for
    /// applying the same TTL to the body entity in blob storage.
    async fn expire_chain(&self, chain: &KeyChain, now: u64) -> Result<Option<u64>, StoreError>;

    /// Deletes every key in the chain, lock included. Returns whether any
    /// key existed.
    async fn delete_chain(&self, chain: &KeyChain) -> Result<bool, StoreError>;

    /// Every entity id ever written for this chain.
    async fn entity_set(&self, chain: &KeyChain) -> Result<Vec<String>, StoreError>;

    /// Removes collected entity ids from the `entities` set.
    async fn remove_entities(&self, chain: &KeyChain, ids: &[String]) -> Result<(), StoreError>;

    /// Attempts to take the collapse lock with a conditional write
    /// (`SETNX`-with-TTL). Returns whether this caller became the leader.
    async fn try_acquire_lock(&self, chain: &KeyChain, ttl_secs: u64) -> Result<bool, StoreError>;

    /// Releases the collapse lock.
    async fn release_lock(&self, chain: &KeyChain) -> Result<(), StoreError>;

    /// Publishes a message on a channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Subscribes to `channel` and waits for one message, or `None` on
    /// timeout. The subscription is dropped on return either way.
    async fn await_message(
        &self,
        channel: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Scans the keyspace for `main` keys matching `pattern`, walking the
    /// cursor with the supplied batch size until exhausted.
    async fn scan_main_keys(
        &self,
        pattern: &str,
        batch: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
