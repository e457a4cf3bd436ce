//! Body blob storage.
//!
//! Bodies live outside the metadata record, addressed by an opaque entity
//! id. Entities are immutable: a re-fetch writes a new id and retires the
//! old one, so concurrent readers never observe a torn body.

mod redis_storage;

pub use redis_storage::RedisBodyStorage;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors from the blob store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The backing store is unreachable or a command failed.
    #[error("storage backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

impl StorageError {
    /// Whether retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
        }
    }
}

/// Opaque blob storage keyed by entity id.
///
/// Safe for concurrent read while one writer writes: ids are fresh random
/// tokens, so a new body never overwrites an id a reader may hold.
#[async_trait]
pub trait BodyStorage: Send + Sync + 'static {
    /// Writes a body under `id` with a TTL in seconds.
    async fn put(&self, id: &str, body: Bytes, ttl: u64) -> Result<(), StorageError>;

    /// Reads a body, or `None` when the entity is missing or expired.
    async fn get(&self, id: &str) -> Result<Option<Bytes>, StorageError>;

    /// Deletes a body. Deleting a missing entity is not an error.
    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Whether the entity currently exists.
    async fn exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Reduces or extends the entity's TTL in seconds.
    async fn set_ttl(&self, id: &str, ttl: u64) -> Result<(), StorageError>;
}

/// Generates a fresh 32-hex entity id.
#[must_use]
pub fn new_entity_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
