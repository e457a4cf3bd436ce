//! Background job queue.
//!
//! Jobs carry a deterministic 32-hex id derived from their intent, so
//! repeated identical submissions collapse to one queued job. The queue
//! orders by priority (higher first); jobs on the same id are serialized by
//! the dedup itself.
//!
//! Dequeueing takes a lease rather than consuming the job: the member moves
//! to an in-flight set scored by a deadline, and only
//! [`JobQueue::complete`] removes it for good. A worker that dies mid-job
//! leaves the lease to expire; [`JobQueue::requeue_expired`] sweeps expired
//! leases back onto the pending queue, where the deterministic id keeps the
//! retry idempotent.

use async_trait::async_trait;
use md5::{Digest, Md5};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::purge::PurgeMode;
use crate::types::HeaderBag;

/// Job class consuming wildcard purge scans.
pub const KLASS_PURGE: &str = "ledge.jobs.purge";
/// Job class re-fetching an entry from origin.
pub const KLASS_REVALIDATE: &str = "ledge.jobs.revalidate";
/// Job class collecting orphaned body entities.
pub const KLASS_COLLECT_ENTITY: &str = "ledge.jobs.collect_entity";

pub const PRIORITY_PURGE: u8 = 5;
pub const PRIORITY_REVALIDATE: u8 = 4;
pub const PRIORITY_COLLECT_ENTITY: u8 = 3;

/// How long a dequeued job may run before its lease expires and the job
/// becomes eligible for re-queueing.
pub const DEFAULT_JOB_LEASE_SECS: u64 = 60;

/// Errors from the job queue.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deterministic 32-hex job id: md5 over the job intent string.
#[must_use]
pub fn deterministic_jid(intent: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(intent.as_bytes());
    hex::encode(hasher.finalize())
}

/// Typed job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobPayload {
    /// Iterate the keyspace for `pattern` and purge every matched root.
    PurgeScan { pattern: String, keyspace_scan_count: usize, purge_mode: PurgeMode },
    /// Re-issue the original request and overwrite the entry.
    Revalidate { root: String, uri: String, headers: Vec<(String, String)> },
    /// Delete unreferenced entities for a root from body storage.
    CollectEntity { root: String },
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub klass: String,
    pub jid: String,
    pub tags: Vec<String>,
    pub priority: u8,
    pub payload: JobPayload,
}

impl Job {
    /// Wildcard purge scan; jid derived from the purge root so repeated
    /// identical wildcard purges collapse to one job.
    #[must_use]
    pub fn purge_scan(
        root: &str,
        pattern: String,
        keyspace_scan_count: usize,
        purge_mode: PurgeMode,
    ) -> Self {
        Self {
            klass: KLASS_PURGE.to_string(),
            jid: deterministic_jid(&format!("purge:{root}")),
            tags: vec!["purge".to_string()],
            priority: PRIORITY_PURGE,
            payload: JobPayload::PurgeScan { pattern, keyspace_scan_count, purge_mode },
        }
    }

    /// Background revalidation of one entry.
    #[must_use]
    pub fn revalidate(root: &str, uri: String, headers: &HeaderBag) -> Self {
        Self {
            klass: KLASS_REVALIDATE.to_string(),
            jid: deterministic_jid(&format!("revalidate:{root}")),
            tags: vec!["revalidate".to_string()],
            priority: PRIORITY_REVALIDATE,
            payload: JobPayload::Revalidate {
                root: root.to_string(),
                uri,
                headers: headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect(),
            },
        }
    }

    /// Orphan entity collection for one root.
    #[must_use]
    pub fn collect_entity(root: &str) -> Self {
        Self {
            klass: KLASS_COLLECT_ENTITY.to_string(),
            jid: deterministic_jid(&format!("collect_entity:{root}")),
            tags: vec!["gc".to_string()],
            priority: PRIORITY_COLLECT_ENTITY,
            payload: JobPayload::CollectEntity { root: root.to_string() },
        }
    }

    /// The wire descriptor included in purge response bodies.
    #[must_use]
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            klass: self.klass.clone(),
            jid: self.jid.clone(),
            options: JobOptions {
                tags: self.tags.clone(),
                jid: self.jid.clone(),
                priority: self.priority,
            },
        }
    }
}

/// Serialized job reference returned to purge clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub klass: String,
    pub jid: String,
    pub options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub tags: Vec<String>,
    pub jid: String,
    pub priority: u8,
}

/// A named queue with priorities, tags, idempotent ids, and leased
/// delivery.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueues a job. Submitting an id already pending replaces its payload
    /// and leaves a single queued instance.
    async fn enqueue(&self, job: &Job) -> Result<JobDescriptor, QueueError>;

    /// Leases the highest-priority pending job, or `None` when the queue is
    /// empty. The job stays in flight until [`complete`](JobQueue::complete)
    /// or its lease deadline passes. Non-blocking; the worker polls.
    async fn dequeue(&self) -> Result<Option<Job>, QueueError>;

    /// Releases a leased job for good. A job never completed is eventually
    /// re-queued by [`requeue_expired`](JobQueue::requeue_expired).
    async fn complete(&self, jid: &str) -> Result<(), QueueError>;

    /// Moves every in-flight job whose lease deadline is at or before `now`
    /// back onto the pending queue. Returns how many were re-queued.
    async fn requeue_expired(&self, now: u64) -> Result<usize, QueueError>;
}

const PENDING_KEY: &str = "ledge:jobs:pending";
const INFLIGHT_KEY: &str = "ledge:jobs:inflight";
const PAYLOAD_KEY: &str = "ledge:jobs:payloads";

/// Job queue over a shared Redis instance: a priority-scored sorted set of
/// pending jids, a deadline-scored sorted set of leased jids, and a payload
/// hash. The sorted-set member doubles as the dedup table, giving
/// deterministic-id idempotence for free.
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    lease_secs: u64,
}

impl RedisJobQueue {
    /// Connects to the queue at `url` with the default job lease.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] when the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager, lease_secs: DEFAULT_JOB_LEASE_SECS })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<JobDescriptor, QueueError> {
        let mut con = self.manager.clone();
        let encoded = serde_json::to_string(job)?;
        // Higher priority pops first: ZPOPMIN on a negated score.
        let score = -f64::from(job.priority);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zadd(PENDING_KEY, &job.jid, score).ignore();
        pipe.hset(PAYLOAD_KEY, &job.jid, encoded).ignore();
        let _: () = pipe.query_async(&mut con).await?;

        trace!(jid = %job.jid, klass = %job.klass, "job enqueued");
        Ok(job.descriptor())
    }

    async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let mut con = self.manager.clone();
        let popped: Vec<(String, f64)> =
            redis::cmd("ZPOPMIN").arg(PENDING_KEY).arg(1).query_async(&mut con).await?;
        let Some((jid, _)) = popped.into_iter().next() else {
            return Ok(None);
        };

        // Lease the job; the payload stays put until completion so an
        // expired lease can restore it.
        let deadline = crate::types::unix_now() + self.lease_secs;
        let _: () = con.zadd(INFLIGHT_KEY, &jid, deadline).await?;

        let encoded: Option<String> = con.hget(PAYLOAD_KEY, &jid).await?;
        match encoded {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            // Payload vanished between pop and read; drop the stray lease.
            None => {
                let _: () = con.zrem(INFLIGHT_KEY, &jid).await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, jid: &str) -> Result<(), QueueError> {
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(INFLIGHT_KEY, jid).ignore();
        pipe.hdel(PAYLOAD_KEY, jid).ignore();
        let _: () = pipe.query_async(&mut con).await?;
        trace!(jid = jid, "job completed");
        Ok(())
    }

    async fn requeue_expired(&self, now: u64) -> Result<usize, QueueError> {
        let mut con = self.manager.clone();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(INFLIGHT_KEY)
            .arg("-inf")
            .arg(now)
            .query_async(&mut con)
            .await?;

        let mut requeued = 0usize;
        for jid in expired {
            let encoded: Option<String> = con.hget(PAYLOAD_KEY, &jid).await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.zrem(INFLIGHT_KEY, &jid).ignore();
            if let Some(encoded) = &encoded {
                let job: Job = serde_json::from_str(encoded)?;
                pipe.zadd(PENDING_KEY, &jid, -f64::from(job.priority)).ignore();
                requeued += 1;
                warn!(jid = %jid, klass = %job.klass, "job lease expired, re-queueing");
            }
            let _: () = pipe.query_async(&mut con).await?;
        }
        Ok(requeued)
    }
}
