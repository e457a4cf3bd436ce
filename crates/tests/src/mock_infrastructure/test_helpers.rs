//! Engine harness over the in-memory mocks.
//!
//! Builds a full lifecycle/purge/worker stack against the memory store and
//! a mockito origin, with config overrides per test.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ledge_core::{
    collapse::Collapser,
    config::AppConfig,
    keys::KeyChain,
    lifecycle::{ClientRequest, Event, EventContext, EventSink, RequestLifecycle, SharedContext},
    origin::OriginFetcher,
    purge::PurgeCoordinator,
    types::{Fingerprint, HeaderBag},
    worker::Worker,
    writer::CacheWriter,
};

use super::{MemoryBodyStorage, MemoryJobQueue, MemoryMetadataStore, OriginMockBuilder};

/// Records emitted lifecycle events for order assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Event tags in emission order.
    #[must_use]
    pub fn taken(&self) -> Vec<String> {
        self.events.lock().expect("sink mutex poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("sink mutex poisoned").clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event, _ctx: &EventContext) {
        self.events.lock().expect("sink mutex poisoned").push(event.as_str().to_string());
    }
}

/// A fully wired engine over memory backends and a mockito origin.
pub struct TestHarness {
    pub store: Arc<MemoryMetadataStore>,
    pub storage: Arc<MemoryBodyStorage>,
    pub queue: Arc<MemoryJobQueue>,
    pub lifecycle: Arc<RequestLifecycle>,
    pub purge: Arc<PurgeCoordinator>,
    pub worker: Arc<Worker>,
    pub sink: Arc<RecordingSink>,
    pub config: AppConfig,
}

impl TestHarness {
    /// Builds a harness pointed at the given origin, with default config
    /// (collapse on, `serve_when_stale = 0`, short follower wait).
    pub async fn new(origin: &OriginMockBuilder) -> Self {
        Self::with_config(origin, |_| {}).await
    }

    /// Builds a harness with config overrides applied before wiring.
    pub async fn with_config(
        origin: &OriginMockBuilder,
        configure: impl FnOnce(&mut AppConfig),
    ) -> Self {
        let (host, port) = origin.host_and_port();
        let mut config = AppConfig::default();
        config.upstream.host = host;
        config.upstream.port = port;
        config.server.visible_hostname = "test-cache".to_string();
        // Keep follower fallbacks fast under test.
        config.cache.follower_wait = 2;
        configure(&mut config);
        config.validate().expect("test config must be valid");

        let store = Arc::new(MemoryMetadataStore::new());
        let storage = Arc::new(MemoryBodyStorage::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let fetcher =
            Arc::new(OriginFetcher::new(&config.upstream).expect("origin client builds"));
        let writer = Arc::new(CacheWriter::new(
            store.clone(),
            storage.clone(),
            queue.clone(),
            config.cache.serve_when_stale,
            config.cache.keep_cache_for,
        ));

        let ctx = SharedContext {
            store: store.clone(),
            storage: storage.clone(),
            fetcher,
            writer,
            queue: queue.clone(),
        };
        let collapser = Arc::new(Collapser::new(
            store.clone(),
            config.cache.lock_ttl,
            Duration::from_secs(config.cache.follower_wait),
        ));
        let sink = Arc::new(RecordingSink::new());
        let lifecycle = Arc::new(RequestLifecycle::new(
            ctx.clone(),
            collapser,
            &config,
            vec![sink.clone() as Arc<dyn EventSink>],
        ));
        let purge = Arc::new(PurgeCoordinator::new(ctx.clone(), config.cache.keyspace_scan_count));
        let worker = Arc::new(Worker::new(ctx, purge.clone(), config.worker.poll_interval_ms));

        Self { store, storage, queue, lifecycle, purge, worker, sink, config }
    }

    /// Key chain for a GET path on the canonical test host.
    #[must_use]
    pub fn chain(&self, path: &str, query: Option<&str>) -> KeyChain {
        let fingerprint = Fingerprint::new("GET", "http", "example.com", path, query);
        KeyChain::from_fingerprint(&fingerprint)
    }

    /// Drains and runs every pending background job.
    pub async fn drain_jobs(&self) {
        while self.worker.tick().await.expect("queue must not fail") {}
    }
}

/// A request against the canonical test host.
#[must_use]
pub fn request(method: &str, path: &str, query: Option<&str>) -> ClientRequest {
    request_with_headers(method, path, query, &[])
}

/// A request with extra headers.
#[must_use]
pub fn request_with_headers(
    method: &str,
    path: &str,
    query: Option<&str>,
    headers: &[(&str, &str)],
) -> ClientRequest {
    let mut bag = HeaderBag::new();
    for (name, value) in headers {
        bag.append(*name, *value);
    }
    ClientRequest {
        method: method.to_string(),
        scheme: "http".to_string(),
        host: "example.com".to_string(),
        path: path.to_string(),
        query: query.map(str::to_string),
        headers: bag,
        body: None,
    }
}
