//! Cache writer.
//!
//! Persists a cacheable origin response: the body goes to blob storage
//! under a fresh entity id first, then one store transaction commits the
//! metadata referencing it. A transaction failure strands the new entity,
//! which the `entities` set hands to the collector job later; readers never
//! observe a record pointing at a body that was not fully written.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    jobs::{Job, JobQueue, QueueError},
    keys::KeyChain,
    storage::{new_entity_id, BodyStorage, StorageError},
    store::{MetadataStore, StoreError},
    types::{CacheEntry, HeaderBag, OriginResponse},
};

/// Errors committing a cache write.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Atomic multi-key writer for cacheable responses.
pub struct CacheWriter {
    store: Arc<dyn MetadataStore>,
    storage: Arc<dyn BodyStorage>,
    queue: Arc<dyn JobQueue>,
    serve_when_stale: u64,
    keep_cache_for: u64,
}

impl CacheWriter {
    #[must_use]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: Arc<dyn BodyStorage>,
        queue: Arc<dyn JobQueue>,
        serve_when_stale: u64,
        keep_cache_for: u64,
    ) -> Self {
        Self { store, storage, queue, serve_when_stale, keep_cache_for }
    }

    /// Storage TTL for an entry expiring at `expires`: time to expiry plus
    /// the stale-serving window plus post-expiry retention.
    #[must_use]
    pub fn storage_ttl(&self, expires: u64, now: u64) -> u64 {
        expires.saturating_sub(now) + self.serve_when_stale + self.keep_cache_for
    }

    /// Writes a response under `chain`, replacing any current entity.
    ///
    /// `prior_entity` is the entity id the entry referenced before this
    /// write (from the lifecycle's earlier read); when replaced, a
    /// collect-entity job reclaims it.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] when the body write or the metadata
    /// transaction fails. A failed transaction leaves the fresh entity
    /// orphaned for the collector.
    pub async fn write(
        &self,
        chain: &KeyChain,
        uri: &str,
        response: &OriginResponse,
        reval_headers: &HeaderBag,
        expires: u64,
        now: u64,
        prior_entity: Option<&str>,
    ) -> Result<CacheEntry, WriteError> {
        let ttl = self.storage_ttl(expires, now);
        let entity = new_entity_id();

        self.storage.put(&entity, response.body.clone(), ttl).await?;

        let entry = CacheEntry {
            status: response.status,
            uri: uri.to_string(),
            expires,
            entity,
            headers: response.headers.without_hop_by_hop(),
            reval_headers: reval_headers.clone(),
        };
        self.store.commit_entry(chain, &entry, ttl).await?;
        crate::metrics::record_cache_write();
        debug!(root = chain.root(), entity = %entry.entity, expires = expires, "cache write committed");

        if let Some(prior) = prior_entity {
            if prior != entry.entity {
                if let Err(e) = self.schedule_collection(chain).await {
                    warn!(root = chain.root(), error = %e, "failed to schedule entity collection");
                }
            }
        }

        Ok(entry)
    }

    async fn schedule_collection(&self, chain: &KeyChain) -> Result<(), QueueError> {
        self.queue.enqueue(&Job::collect_entity(chain.root())).await?;
        Ok(())
    }
}
