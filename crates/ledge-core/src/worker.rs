//! Background worker.
//!
//! Consumes queued jobs: wildcard purge scans, entry revalidation, and
//! orphan entity collection. Job ids are deterministic, so a retried or
//! re-submitted job collapses onto the pending one and processing is
//! idempotent.
//!
//! The loop polls the queue on an interval and drains everything available
//! per tick; a broadcast shutdown signal stops it between jobs. Each tick
//! first sweeps expired job leases back onto the queue, so a job leased by
//! a worker that died mid-run is picked up again. A heartbeat timestamp is
//! refreshed on every pass for the health endpoint.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    jobs::{Job, JobPayload, QueueError},
    keys::KeyChain,
    lifecycle::SharedContext,
    origin::{relative_uri, response_expiry},
    purge::{PurgeCoordinator, PurgeMode},
    types::{unix_now, HeaderBag},
};

/// Last-activity timestamp shared with the health endpoint.
#[derive(Debug, Default)]
pub struct WorkerHeartbeat {
    last_tick: AtomicU64,
}

impl WorkerHeartbeat {
    fn beat(&self) {
        self.last_tick.store(unix_now(), Ordering::Relaxed);
    }

    /// Unix seconds of the last worker pass, or `None` before the first.
    #[must_use]
    pub fn last_tick(&self) -> Option<u64> {
        match self.last_tick.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Whether the worker ticked within the given window.
    #[must_use]
    pub fn is_live(&self, now: u64, within_secs: u64) -> bool {
        self.last_tick().is_some_and(|ts| now.saturating_sub(ts) <= within_secs)
    }
}

/// Job consumer over the shared queue.
pub struct Worker {
    ctx: SharedContext,
    purge: Arc<PurgeCoordinator>,
    poll_interval: Duration,
    heartbeat: Arc<WorkerHeartbeat>,
}

impl Worker {
    #[must_use]
    pub fn new(ctx: SharedContext, purge: Arc<PurgeCoordinator>, poll_interval_ms: u64) -> Self {
        Self {
            ctx,
            purge,
            poll_interval: Duration::from_millis(poll_interval_ms),
            heartbeat: Arc::new(WorkerHeartbeat::default()),
        }
    }

    /// Handle to this worker's liveness signal.
    #[must_use]
    pub fn heartbeat(&self) -> Arc<WorkerHeartbeat> {
        Arc::clone(&self.heartbeat)
    }

    /// Runs until the shutdown signal arrives. Jobs in flight complete; the
    /// queue keeps anything not yet dequeued.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("worker received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    loop {
                        match self.tick().await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                warn!(error = %e, "job dequeue failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("worker shutdown complete");
    }

    /// Processes at most one pending job. Returns whether one ran.
    ///
    /// Expired leases are swept back onto the queue first, so jobs orphaned
    /// by a dead worker are recovered here.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the queue itself fails; job execution
    /// failures are handled internally (logged, retried when transient).
    pub async fn tick(&self) -> Result<bool, QueueError> {
        self.heartbeat.beat();
        self.ctx.queue.requeue_expired(unix_now()).await?;

        let Some(job) = self.ctx.queue.dequeue().await? else {
            return Ok(false);
        };
        crate::metrics::record_job(&job.klass);
        debug!(jid = %job.jid, klass = %job.klass, "job started");

        let retry = self.process(&job).await;
        // Release the lease before any retry enqueue, so the re-queued
        // payload is not swept away with the completed lease.
        self.ctx.queue.complete(&job.jid).await?;
        if retry {
            if let Err(e) = self.ctx.queue.enqueue(&job).await {
                warn!(jid = %job.jid, error = %e, "failed to requeue job");
            }
        }
        Ok(true)
    }

    async fn process(&self, job: &Job) -> bool {
        match &job.payload {
            JobPayload::PurgeScan { pattern, keyspace_scan_count, purge_mode } => {
                self.run_purge_scan(pattern, *keyspace_scan_count, *purge_mode).await
            }
            JobPayload::Revalidate { root, uri, headers } => {
                self.run_revalidate(root, uri, headers).await
            }
            JobPayload::CollectEntity { root } => self.run_collect_entity(root).await,
        }
    }

    /// Walks the keyspace for the pattern and runs the exact purge flow on
    /// every matched root. Returns whether the job should be retried.
    async fn run_purge_scan(&self, pattern: &str, batch: usize, mode: PurgeMode) -> bool {
        let keys = match self.ctx.store.scan_main_keys(pattern, batch).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = pattern, error = %e, "purge scan failed");
                return e.is_transient();
            }
        };

        let mut purged = 0usize;
        for key in &keys {
            let Some(chain) = KeyChain::from_main_key(key) else {
                continue;
            };
            match self.purge.purge_exact(&chain, mode).await {
                Ok(response) if response.result.action_taken() => purged += 1,
                Ok(_) => {}
                Err(e) => warn!(root = chain.root(), error = %e, "purge of scanned root failed"),
            }
        }
        info!(pattern = pattern, matched = keys.len(), purged = purged, "purge scan complete");
        false
    }

    /// Replays the stored request and overwrites the entry. On origin
    /// failure the existing (reduced-TTL) entry stays in place.
    async fn run_revalidate(&self, root: &str, uri: &str, headers: &[(String, String)]) -> bool {
        let chain = KeyChain::from_root(root);
        let forward: HeaderBag =
            headers.iter().map(|(n, v)| (n.clone(), v.clone())).collect();

        let response = match self.ctx.fetcher.fetch("GET", relative_uri(uri), &forward, None).await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(uri = uri, error = %e, "revalidation fetch failed, keeping entry");
                return false;
            }
        };

        let now = unix_now();
        let Some(expires) = response_expiry(&response, now) else {
            debug!(uri = uri, "revalidated response not cacheable, keeping entry");
            return false;
        };

        let prior_entity = match self.ctx.store.read_entry(&chain).await {
            Ok(entry) => entry.map(|e| e.entity),
            Err(e) => {
                warn!(root = root, error = %e, "reading entry before revalidation write failed");
                return e.is_transient();
            }
        };

        match self
            .ctx
            .writer
            .write(&chain, uri, &response, &forward, expires, now, prior_entity.as_deref())
            .await
        {
            Ok(_) => {
                debug!(uri = uri, "entry revalidated");
                false
            }
            Err(e) => {
                warn!(uri = uri, error = %e, "revalidation write failed");
                false
            }
        }
    }

    /// Deletes entities no longer referenced by the entry, then forgets
    /// them. The currently referenced entity is always kept.
    async fn run_collect_entity(&self, root: &str) -> bool {
        let chain = KeyChain::from_root(root);

        let current = match self.ctx.store.read_entry(&chain).await {
            Ok(entry) => entry.map(|e| e.entity),
            Err(e) => {
                warn!(root = root, error = %e, "entity collection read failed");
                return e.is_transient();
            }
        };
        let ids = match self.ctx.store.entity_set(&chain).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(root = root, error = %e, "entity collection set read failed");
                return e.is_transient();
            }
        };

        let orphans: Vec<String> =
            ids.into_iter().filter(|id| Some(id.as_str()) != current.as_deref()).collect();
        if orphans.is_empty() {
            return false;
        }

        for id in &orphans {
            if let Err(e) = self.ctx.storage.delete(id).await {
                warn!(root = root, entity = %id, error = %e, "orphan delete failed");
            }
        }
        if let Err(e) = self.ctx.store.remove_entities(&chain, &orphans).await {
            warn!(root = root, error = %e, "orphan set cleanup failed");
        }
        debug!(root = root, collected = orphans.len(), "orphan entities collected");
        false
    }
}
