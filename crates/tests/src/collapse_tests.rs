//! Integration tests for request collapsing.

use std::{sync::Arc, time::Duration};

use crate::mock_infrastructure::{request, OriginMockBuilder, TestHarness};
use bytes::Bytes;
use ledge_core::{
    storage::BodyStorage,
    store::MetadataStore,
    types::{unix_now, CacheAction, CacheEntry, HeaderBag},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_miss_burst_collapses_to_one_fetch() {
    const BURST: usize = 20;

    let mut origin = OriginMockBuilder::new().await;
    let mock = origin
        .mock_slow_expect("/slow", "SLOW-BODY", 3600, Duration::from_millis(300), 1)
        .await;
    let harness = Arc::new(TestHarness::new(&origin).await);

    let mut handles = Vec::with_capacity(BURST);
    for _ in 0..BURST {
        let harness = Arc::clone(&harness);
        handles.push(tokio::spawn(async move {
            harness.lifecycle.handle(request("GET", "/slow", None)).await
        }));
    }

    let mut fetched = 0usize;
    let mut collapsed = 0usize;
    for handle in handles {
        let response = handle.await.expect("task must not panic").expect("request succeeds");
        assert_eq!(&response.body[..], b"SLOW-BODY", "all bodies must be identical");
        match response.action {
            CacheAction::Fetched => fetched += 1,
            CacheAction::Collapsed => collapsed += 1,
            CacheAction::None => panic!("burst responses must carry an action"),
        }
    }

    assert_eq!(fetched, 1, "exactly one request performs the origin fetch");
    assert_eq!(collapsed, BURST - 1, "all others are collapsed");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_follower_observing_finished_serves_committed_entry() {
    let mut origin = OriginMockBuilder::new().await;
    origin.mock_cacheable("/f", "MUST-NOT-FETCH", 3600).await;
    let harness = Arc::new(TestHarness::new(&origin).await);
    let chain = harness.chain("/f", None);

    // Another process holds the lock and commits while we wait.
    assert!(harness.store.try_acquire_lock(&chain, 10).await.unwrap());
    let store = Arc::clone(&harness.store);
    let storage = Arc::clone(&harness.storage);
    let leader_chain = chain.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        storage.put("ent-leader", Bytes::from_static(b"LEADER-BODY"), 3600).await.unwrap();
        let entry = CacheEntry {
            status: 200,
            uri: "http://example.com/f".to_string(),
            expires: unix_now() + 3600,
            entity: "ent-leader".to_string(),
            headers: HeaderBag::new(),
            reval_headers: HeaderBag::new(),
        };
        store.commit_entry(&leader_chain, &entry, 3600).await.unwrap();
        store.release_lock(&leader_chain).await.unwrap();
        store.publish(leader_chain.root(), "finished").await.unwrap();
    });

    let response = harness.lifecycle.handle(request("GET", "/f", None)).await.unwrap();
    assert_eq!(response.action, CacheAction::Collapsed);
    assert_eq!(&response.body[..], b"LEADER-BODY");
    assert_eq!(response.headers.get("X-Cache"), Some("HIT"));
}

#[tokio::test]
async fn test_follower_timeout_falls_back_to_direct_fetch() {
    let mut origin = OriginMockBuilder::new().await;
    let mock = origin.mock_cacheable_expect("/ft", "FALLBACK", 3600, 1).await;
    let harness = TestHarness::with_config(&origin, |config| config.cache.follower_wait = 1).await;
    let chain = harness.chain("/ft", None);

    // A crashed leader: lock held, no publication ever arrives.
    assert!(harness.store.try_acquire_lock(&chain, 10).await.unwrap());

    let response = harness.lifecycle.handle(request("GET", "/ft", None)).await.unwrap();
    assert_eq!(response.action, CacheAction::Fetched);
    assert_eq!(&response.body[..], b"FALLBACK");
    mock.assert_async().await;

    // The fallback fetch still cached the response.
    assert!(harness.store.read_entry(&chain).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_publication_triggers_fallback_fetch() {
    let mut origin = OriginMockBuilder::new().await;
    let mock = origin.mock_cacheable_expect("/fp", "OWN-FETCH", 3600, 1).await;
    let harness = Arc::new(TestHarness::new(&origin).await);
    let chain = harness.chain("/fp", None);

    assert!(harness.store.try_acquire_lock(&chain, 10).await.unwrap());
    let store = Arc::clone(&harness.store);
    let failed_chain = chain.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.release_lock(&failed_chain).await.unwrap();
        store.publish(failed_chain.root(), "failed").await.unwrap();
    });

    let response = harness.lifecycle.handle(request("GET", "/fp", None)).await.unwrap();
    assert_eq!(response.action, CacheAction::Fetched);
    assert_eq!(&response.body[..], b"OWN-FETCH");
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disabled_collapsing_fetches_independently() {
    let mut origin = OriginMockBuilder::new().await;
    let mock = origin
        .mock_slow_expect("/nc", "UNCOLLAPSED", 3600, Duration::from_millis(200), 2)
        .await;
    let harness = Arc::new(TestHarness::with_config(&origin, |config| {
        config.cache.collapse_origin_requests = false;
    })
    .await);

    let first = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.lifecycle.handle(request("GET", "/nc", None)).await })
    };
    let second = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.lifecycle.handle(request("GET", "/nc", None)).await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.action, CacheAction::Fetched);
    assert_eq!(second.action, CacheAction::Fetched);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_leader_releases_lock_after_commit() {
    let mut origin = OriginMockBuilder::new().await;
    origin.mock_cacheable("/lr", "L", 3600).await;
    let harness = TestHarness::new(&origin).await;
    let chain = harness.chain("/lr", None);

    harness.lifecycle.handle(request("GET", "/lr", None)).await.unwrap();
    assert!(!harness.store.lock_held(&chain), "leader must release the fetching lock");
}
