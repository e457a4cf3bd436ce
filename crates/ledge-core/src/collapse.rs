//! Request collapsing.
//!
//! When concurrent requests miss on the same fingerprint, exactly one (the
//! leader) fetches from origin; the rest (followers) subscribe on the chain
//! root channel and re-read the cache once the leader publishes. The lock
//! and the channel live in the shared store, so collapsing works across
//! worker processes, not just tasks.
//!
//! The lock TTL only bounds a crashed leader; it is not a fetch deadline.
//! The leader publishes after its cache write commits, so a follower that
//! observes `finished` is guaranteed to see the new entry on read.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    keys::KeyChain,
    store::{MetadataStore, StoreError},
};

const MSG_FINISHED: &str = "finished";
const MSG_FAILED: &str = "failed";

/// Role assigned to a request that attempted the collapse lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseRole {
    /// Holds the fetching lock; performs the origin fetch.
    Leader,
    /// Waits for the leader's publication.
    Follower,
}

/// What a follower observed while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The leader committed a cache write; re-read and serve.
    Finished,
    /// The leader fetched but could not cache; fall back to a direct fetch.
    Failed,
    /// No publication inside `follower_wait`; re-check the cache once, then
    /// fall back to a direct fetch.
    TimedOut,
}

/// Request-coalescing primitive over the shared store.
pub struct Collapser {
    store: Arc<dyn MetadataStore>,
    lock_ttl: u64,
    follower_wait: Duration,
}

impl Collapser {
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, lock_ttl: u64, follower_wait: Duration) -> Self {
        Self { store, lock_ttl, follower_wait }
    }

    /// Attempts the fetching lock. At most one caller per chain becomes the
    /// leader while the lock lives.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from the conditional write.
    pub async fn acquire(&self, chain: &KeyChain) -> Result<CollapseRole, StoreError> {
        if self.store.try_acquire_lock(chain, self.lock_ttl).await? {
            debug!(root = chain.root(), "collapse leader acquired");
            Ok(CollapseRole::Leader)
        } else {
            Ok(CollapseRole::Follower)
        }
    }

    /// Releases the lock and notifies followers. Called by the leader after
    /// its cache write committed (`success`) or after a non-cacheable or
    /// failed fetch (`!success`).
    ///
    /// Failures here are logged, not propagated: the response is already
    /// servable and followers recover via their timeout path.
    pub async fn finish(&self, chain: &KeyChain, success: bool) {
        if let Err(e) = self.store.release_lock(chain).await {
            warn!(root = chain.root(), error = %e, "failed to release fetching lock");
        }
        let message = if success { MSG_FINISHED } else { MSG_FAILED };
        if let Err(e) = self.store.publish(chain.root(), message).await {
            warn!(root = chain.root(), error = %e, "failed to publish collapse outcome");
        }
    }

    /// Follower path: waits for the leader's publication with a timeout.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from the subscription; a lost subscription
    /// is mapped to [`WaitOutcome::TimedOut`] so the caller falls back.
    pub async fn wait_for_leader(&self, chain: &KeyChain) -> Result<WaitOutcome, StoreError> {
        match self.store.await_message(chain.root(), self.follower_wait).await {
            Ok(Some(msg)) if msg == MSG_FINISHED => Ok(WaitOutcome::Finished),
            Ok(Some(_)) => Ok(WaitOutcome::Failed),
            Ok(None) => Ok(WaitOutcome::TimedOut),
            Err(StoreError::SubscriptionLost(channel)) => {
                warn!(channel = %channel, "collapse subscription lost, falling back");
                Ok(WaitOutcome::TimedOut)
            }
            Err(e) => Err(e),
        }
    }
}
