//! Integration tests for the purge coordinator.

use crate::mock_infrastructure::{request, request_with_headers, OriginMockBuilder, TestHarness};
use ledge_core::{
    purge::{PurgeMode, PurgeResult},
    storage::BodyStorage,
    store::MetadataStore,
};

#[tokio::test]
async fn test_prime_purge_repurge_reprime() {
    let mut origin = OriginMockBuilder::new().await;
    origin.mock_cacheable("/a", "TEST1", 3600).await;
    let harness = TestHarness::new(&origin).await;

    harness.lifecycle.handle(request("GET", "/a", None)).await.unwrap();

    // First purge takes effect.
    let purged =
        harness.purge.purge(&request("PURGE", "/a", None), PurgeMode::Invalidate).await.unwrap();
    assert_eq!(purged.result, PurgeResult::Purged);
    assert!(purged.result.action_taken());
    assert!(purged.qless_job.is_none());

    // Second purge finds the entry already expired.
    let again =
        harness.purge.purge(&request("PURGE", "/a", None), PurgeMode::Invalidate).await.unwrap();
    assert_eq!(again.result, PurgeResult::AlreadyExpired);
    assert!(!again.result.action_taken());

    // Re-prime fetches the new origin body.
    origin.reset().await;
    origin.mock_cacheable("/a", "TEST1-v2", 3600).await;
    let reprimed = harness.lifecycle.handle(request("GET", "/a", None)).await.unwrap();
    assert_eq!(&reprimed.body[..], b"TEST1-v2");
    assert_eq!(reprimed.headers.get("X-Cache"), Some("MISS"));
}

#[tokio::test]
async fn test_purge_unknown_key_is_nothing_to_purge() {
    let origin = OriginMockBuilder::new().await;
    let harness = TestHarness::new(&origin).await;

    let outcome = harness
        .purge
        .purge(&request("PURGE", "/nonexistent", None), PurgeMode::Invalidate)
        .await
        .unwrap();
    assert_eq!(outcome.result, PurgeResult::NothingToPurge);
    assert!(!outcome.result.action_taken());
}

#[tokio::test]
async fn test_purge_response_serializes_per_wire_contract() {
    let origin = OriginMockBuilder::new().await;
    let harness = TestHarness::new(&origin).await;

    let outcome = harness
        .purge
        .purge(&request("PURGE", "/missing", None), PurgeMode::Invalidate)
        .await
        .unwrap();
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["purge_mode"], "invalidate");
    assert_eq!(json["result"], "nothing to purge");
}

#[tokio::test]
async fn test_expire_reduces_every_chain_ttl_by_the_same_delta() {
    let mut origin = OriginMockBuilder::new().await;
    origin.mock_cacheable("/ttl", "T", 100).await;
    let harness = TestHarness::with_config(&origin, |config| {
        config.cache.serve_when_stale = 60;
        config.cache.keep_cache_for = 3600;
    })
    .await;

    harness.lifecycle.handle(request("GET", "/ttl", None)).await.unwrap();
    let chain = harness.chain("/ttl", None);
    let entry = harness.store.read_entry(&chain).await.unwrap().unwrap();

    // Storage TTL at write: time-to-expiry + stale window + retention.
    let written_ttl = harness.store.recorded_ttl(&chain.main()).unwrap();
    assert!((3758..=3760).contains(&written_ttl), "write ttl was {written_ttl}");

    let outcome =
        harness.purge.purge(&request("PURGE", "/ttl", None), PurgeMode::Invalidate).await.unwrap();
    assert_eq!(outcome.result, PurgeResult::Purged);

    // Every TTL-bound key and the body entity moved to the same target,
    // within a second of clock skew.
    let target = written_ttl - 100;
    for key in chain.ttl_bound_keys() {
        let ttl = harness.store.recorded_ttl(&key).unwrap();
        assert!(
            ttl.abs_diff(target) <= 1,
            "key {key} ttl {ttl} not within 1s of {target}"
        );
    }
    let entity_ttl = harness.storage.recorded_ttl(&entry.entity).unwrap();
    assert!(entity_ttl.abs_diff(target) <= 1);

    // The entry is now stale.
    let after = harness.store.read_entry(&chain).await.unwrap().unwrap();
    assert!(after.expires < ledge_core::types::unix_now());
}

#[tokio::test]
async fn test_delete_purge_removes_chain_and_entities() {
    let mut origin = OriginMockBuilder::new().await;
    let mock = origin.mock_cacheable_expect("/d", "D1", 3600, 2).await;
    let harness =
        TestHarness::with_config(&origin, |config| config.cache.keep_cache_for = 3600).await;

    harness.lifecycle.handle(request("GET", "/d", None)).await.unwrap();
    let chain = harness.chain("/d", None);
    let entity = harness.store.read_entry(&chain).await.unwrap().unwrap().entity;

    let outcome = harness
        .purge
        .purge(
            &request_with_headers("PURGE", "/d", None, &[("X-Purge", "delete")]),
            PurgeMode::Delete,
        )
        .await
        .unwrap();
    assert_eq!(outcome.result, PurgeResult::Deleted);

    assert!(harness.store.read_entry(&chain).await.unwrap().is_none());
    assert!(harness.storage.get(&entity).await.unwrap().is_none(), "body entity deleted");
    assert!(harness.store.entity_set(&chain).await.unwrap().is_empty());

    // No stale copy remains: the next GET goes to origin.
    let refetched = harness.lifecycle.handle(request("GET", "/d", None)).await.unwrap();
    assert_eq!(refetched.headers.get("X-Cache"), Some("MISS"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_revalidate_purge_schedules_job_and_refreshes() {
    let mut origin = OriginMockBuilder::new().await;
    origin.mock_cacheable_with_cookie("/r", "primed", "R1", 3600).await;
    let harness = TestHarness::new(&origin).await;

    // Prime with a cookie the origin echoes into its body.
    harness
        .lifecycle
        .handle(request_with_headers("GET", "/r", None, &[("Cookie", "primed")]))
        .await
        .unwrap();

    let outcome = harness
        .purge
        .purge(&request("PURGE", "/r", None), PurgeMode::Revalidate)
        .await
        .unwrap();
    assert_eq!(outcome.result, PurgeResult::Purged);
    let descriptor = outcome.qless_job.expect("revalidate purge carries a job descriptor");
    assert_eq!(descriptor.klass, "ledge.jobs.revalidate");
    assert_eq!(descriptor.options.priority, 4);
    assert_eq!(descriptor.options.tags, vec!["revalidate"]);
    assert_eq!(descriptor.jid.len(), 32);

    // The queued job replays the stored Cookie header.
    origin.reset().await;
    origin.mock_cacheable_with_cookie("/r", "primed", "R2", 3600).await;
    harness.drain_jobs().await;

    let refreshed = harness.lifecycle.handle(request("GET", "/r", None)).await.unwrap();
    assert_eq!(&refreshed.body[..], b"R2");
    assert_eq!(refreshed.headers.get("X-Cache"), Some("HIT"));
}

#[tokio::test]
async fn test_wildcard_purge_is_scheduled_and_idempotent() {
    let mut origin = OriginMockBuilder::new().await;
    origin.mock_cacheable("/p?t=1", "P1", 3600).await;
    origin.mock_cacheable("/p?t=2", "P2", 3600).await;
    let harness = TestHarness::new(&origin).await;

    harness.lifecycle.handle(request("GET", "/p", Some("t=1"))).await.unwrap();
    harness.lifecycle.handle(request("GET", "/p", Some("t=2"))).await.unwrap();

    let first =
        harness.purge.purge(&request("PURGE", "/p*", None), PurgeMode::Invalidate).await.unwrap();
    assert_eq!(first.result, PurgeResult::Scheduled);
    let descriptor = first.qless_job.expect("wildcard purge carries a job descriptor");
    assert_eq!(descriptor.klass, "ledge.jobs.purge");
    assert_eq!(descriptor.options.priority, 5);
    assert_eq!(descriptor.options.tags, vec!["purge"]);

    // Submitting the same pattern again yields the same jid, and the queue
    // holds a single pending job.
    let second =
        harness.purge.purge(&request("PURGE", "/p*", None), PurgeMode::Invalidate).await.unwrap();
    assert_eq!(second.qless_job.unwrap().jid, descriptor.jid);
    assert_eq!(
        harness.queue.pending().iter().filter(|j| j.jid == descriptor.jid).count(),
        1
    );

    // Running the scan invalidates both entries.
    harness.drain_jobs().await;
    let now = ledge_core::types::unix_now();
    for query in ["t=1", "t=2"] {
        let entry =
            harness.store.read_entry(&harness.chain("/p", Some(query))).await.unwrap().unwrap();
        assert!(entry.expires < now, "entry for {query} must be expired");
    }
}

#[tokio::test]
async fn test_purge_targets_only_matching_roots() {
    let mut origin = OriginMockBuilder::new().await;
    origin.mock_cacheable("/p?t=1", "P1", 3600).await;
    origin.mock_cacheable("/q", "Q", 3600).await;
    let harness = TestHarness::new(&origin).await;

    harness.lifecycle.handle(request("GET", "/p", Some("t=1"))).await.unwrap();
    harness.lifecycle.handle(request("GET", "/q", None)).await.unwrap();

    harness.purge.purge(&request("PURGE", "/p*", None), PurgeMode::Invalidate).await.unwrap();
    harness.drain_jobs().await;

    let now = ledge_core::types::unix_now();
    let purged = harness.store.read_entry(&harness.chain("/p", Some("t=1"))).await.unwrap().unwrap();
    assert!(purged.expires < now);

    let untouched = harness.store.read_entry(&harness.chain("/q", None)).await.unwrap().unwrap();
    assert!(untouched.expires > now, "unrelated entries keep their expiry");
}
