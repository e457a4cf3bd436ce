//! Purge coordinator.
//!
//! Exact-key purges run synchronously in three modes: `invalidate` reduces
//! every TTL in the chain so the entry is immediately stale, `delete`
//! removes the chain and its body entities, `revalidate` invalidates and
//! schedules a background re-fetch. Wildcard purges (path containing `*`)
//! are dispatched to the background worker as an idempotent scan job and
//! acknowledged immediately.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    jobs::{Job, JobDescriptor, QueueError},
    keys::KeyChain,
    lifecycle::{ClientRequest, SharedContext},
    storage::StorageError,
    store::StoreError,
    types::{unix_now, Fingerprint},
};

/// Purge behavior selected by the `X-Purge` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeMode {
    /// Reduce TTLs so the entry is immediately expired (default).
    Invalidate,
    /// Remove every key in the chain and the body entities.
    Delete,
    /// Invalidate, then schedule a background re-fetch.
    Revalidate,
}

impl PurgeMode {
    /// Parses the `X-Purge` header; absent means `invalidate`.
    ///
    /// # Errors
    ///
    /// Returns [`PurgeError::InvalidMode`] for unrecognized values.
    pub fn from_header(value: Option<&str>) -> Result<Self, PurgeError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Invalidate),
            Some(v) if v.eq_ignore_ascii_case("invalidate") => Ok(Self::Invalidate),
            Some(v) if v.eq_ignore_ascii_case("delete") => Ok(Self::Delete),
            Some(v) if v.eq_ignore_ascii_case("revalidate") => Ok(Self::Revalidate),
            Some(v) => Err(PurgeError::InvalidMode(v.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalidate => "invalidate",
            Self::Delete => "delete",
            Self::Revalidate => "revalidate",
        }
    }
}

/// Outcome label carried in the purge response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurgeResult {
    #[serde(rename = "purged")]
    Purged,
    #[serde(rename = "deleted")]
    Deleted,
    #[serde(rename = "already expired")]
    AlreadyExpired,
    #[serde(rename = "nothing to purge")]
    NothingToPurge,
    #[serde(rename = "scheduled")]
    Scheduled,
}

impl PurgeResult {
    /// Whether this outcome maps to HTTP 200 (action taken or scheduled)
    /// rather than 404.
    #[must_use]
    pub fn action_taken(&self) -> bool {
        matches!(self, Self::Purged | Self::Deleted | Self::Scheduled)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purged => "purged",
            Self::Deleted => "deleted",
            Self::AlreadyExpired => "already expired",
            Self::NothingToPurge => "nothing to purge",
            Self::Scheduled => "scheduled",
        }
    }
}

/// JSON body returned to purge clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purge_mode: PurgeMode,
    pub result: PurgeResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qless_job: Option<JobDescriptor>,
}

impl PurgeResponse {
    fn new(purge_mode: PurgeMode, result: PurgeResult, qless_job: Option<JobDescriptor>) -> Self {
        crate::metrics::record_purge(purge_mode.as_str(), result.as_str());
        Self { purge_mode, result, qless_job }
    }
}

/// Errors from the purge path. Missing targets are an outcome
/// ([`PurgeResult::NothingToPurge`]), not an error.
#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("invalid purge mode: {0}")]
    InvalidMode(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Synchronous purge for exact keys; scheduler for wildcard scans.
pub struct PurgeCoordinator {
    ctx: SharedContext,
    keyspace_scan_count: usize,
}

impl PurgeCoordinator {
    #[must_use]
    pub fn new(ctx: SharedContext, keyspace_scan_count: usize) -> Self {
        Self { ctx, keyspace_scan_count }
    }

    /// Entry point for `PURGE` requests. Purges always target the GET cache
    /// identity of the path, regardless of the purge verb itself.
    ///
    /// # Errors
    ///
    /// Returns [`PurgeError`] for store, storage, or queue failures.
    pub async fn purge(
        &self,
        request: &ClientRequest,
        mode: PurgeMode,
    ) -> Result<PurgeResponse, PurgeError> {
        let fingerprint = Fingerprint::new(
            "GET",
            &request.scheme,
            &request.host,
            &request.path,
            request.query.as_deref(),
        );
        let chain = KeyChain::from_fingerprint(&fingerprint);

        if request.path.contains('*') {
            self.schedule_wildcard(&chain, mode).await
        } else {
            self.purge_exact(&chain, mode).await
        }
    }

    /// Exact-key flow, also invoked per matched root by the scan worker.
    ///
    /// # Errors
    ///
    /// Returns [`PurgeError`] for store, storage, or queue failures.
    pub async fn purge_exact(
        &self,
        chain: &KeyChain,
        mode: PurgeMode,
    ) -> Result<PurgeResponse, PurgeError> {
        let Some(entry) = self.ctx.store.read_entry(chain).await? else {
            return Ok(PurgeResponse::new(mode, PurgeResult::NothingToPurge, None));
        };
        if entry.entity.is_empty() || !self.ctx.storage.exists(&entry.entity).await? {
            return Ok(PurgeResponse::new(mode, PurgeResult::NothingToPurge, None));
        }

        match mode {
            PurgeMode::Delete => {
                let mut entities = self.ctx.store.entity_set(chain).await?;
                if !entities.iter().any(|id| id == &entry.entity) {
                    entities.push(entry.entity.clone());
                }
                for id in &entities {
                    self.ctx.storage.delete(id).await?;
                }
                self.ctx.store.delete_chain(chain).await?;
                info!(root = chain.root(), entities = entities.len(), "entry deleted");
                Ok(PurgeResponse::new(mode, PurgeResult::Deleted, None))
            }
            PurgeMode::Invalidate | PurgeMode::Revalidate => {
                let job = if mode == PurgeMode::Revalidate {
                    let job = Job::revalidate(chain.root(), entry.uri.clone(), &entry.reval_headers);
                    Some(self.ctx.queue.enqueue(&job).await?)
                } else {
                    None
                };

                match self.ctx.store.expire_chain(chain, unix_now()).await? {
                    Some(new_ttl) => {
                        // The body entity's lifetime moves with its chain.
                        self.ctx.storage.set_ttl(&entry.entity, new_ttl).await?;
                        debug!(root = chain.root(), new_ttl = new_ttl, "entry purged");
                        Ok(PurgeResponse::new(mode, PurgeResult::Purged, job))
                    }
                    None => Ok(PurgeResponse::new(mode, PurgeResult::AlreadyExpired, job)),
                }
            }
        }
    }

    /// Wildcard flow: enqueue an idempotent scan job and acknowledge.
    async fn schedule_wildcard(
        &self,
        chain: &KeyChain,
        mode: PurgeMode,
    ) -> Result<PurgeResponse, PurgeError> {
        let job = Job::purge_scan(
            chain.root(),
            chain.main_scan_pattern(),
            self.keyspace_scan_count,
            mode,
        );
        let descriptor = self.ctx.queue.enqueue(&job).await?;
        info!(pattern = chain.main_scan_pattern(), jid = %descriptor.jid, "wildcard purge scheduled");
        Ok(PurgeResponse::new(mode, PurgeResult::Scheduled, Some(descriptor)))
    }
}
