//! Request lifecycle engine.
//!
//! The top-level state machine over the response-preparation phase:
//!
//! ```text
//!                  ┌──────────── request cacheable? no ──► FETCH ──► SEND
//!                  │
//! START ──► READ ──┼── HOT  ──► SEND
//!                  ├── WARM ──► enqueue revalidate; SEND
//!                  └── COLD/SUBZERO ──► COLLAPSE?
//!                                         │ no  ──► FETCH ──► SEND
//!                                         └ yes ──► leader/follower ──► SEND
//! ```
//!
//! The leader's fetch-and-store runs on a spawned task, so a client
//! disconnect cancels only the sending side; the cache is still populated
//! and the lock still released for waiting followers.

pub mod events;

pub use events::{Event, EventContext, EventSink};

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    collapse::{Collapser, CollapseRole, WaitOutcome},
    freshness,
    jobs::{Job, JobQueue},
    keys::KeyChain,
    origin::{response_expiry, OriginError, OriginFetcher},
    storage::BodyStorage,
    store::{MetadataStore, StoreError},
    types::{CacheAction, CacheEntry, CacheState, Fingerprint, HeaderBag, OriginResponse, unix_now, VERSION},
    writer::CacheWriter,
};

/// Shared dependencies for the request and purge paths.
///
/// Grouping the `Arc` references cuts per-handler clone noise; everything
/// here is cheap to clone and safe to move onto spawned tasks.
#[derive(Clone)]
pub struct SharedContext {
    pub store: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn BodyStorage>,
    pub fetcher: Arc<OriginFetcher>,
    pub writer: Arc<CacheWriter>,
    pub queue: Arc<dyn JobQueue>,
}

/// An incoming client request, already parsed by the HTTP embedding.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderBag,
    pub body: Option<Bytes>,
}

impl ClientRequest {
    /// Cache identity of this request. HEAD shares the GET identity: it is
    /// served from the GET cache but never populates it.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let method = if self.is_head() { "GET" } else { self.method.as_str() };
        Fingerprint::new(method, &self.scheme, &self.host, &self.path, self.query.as_deref())
    }

    /// Path plus raw query, as sent upstream.
    #[must_use]
    pub fn relative_uri(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{q}", self.path),
            _ => self.path.clone(),
        }
    }

    #[must_use]
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    #[must_use]
    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

/// The response handed back to the HTTP embedding.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: HeaderBag,
    pub body: Bytes,
    pub state: CacheState,
    pub action: CacheAction,
}

/// Errors surfacing from the request path. Coalesce timeouts and storage
/// read misses are recovered locally and never appear here.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The metadata store failed on the critical path; maps to 500.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The origin was unreachable on the critical path; maps to 502.
    #[error(transparent)]
    Origin(#[from] OriginError),

    /// A spawned leader task was lost (panic or runtime shutdown).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Prepends this proxy's `Via` element ahead of any existing value.
fn prepend_via(headers: &mut HeaderBag, hostname: &str) {
    let element = format!("1.1 {hostname} (Ledge/{VERSION})");
    let value = match headers.get_joined("Via") {
        Some(existing) => format!("{element}, {existing}"),
        None => element,
    };
    headers.set("Via", value);
}

/// Top-level request handler.
pub struct RequestLifecycle {
    ctx: SharedContext,
    collapser: Arc<Collapser>,
    collapse_enabled: bool,
    serve_when_stale: u64,
    visible_hostname: String,
    revalidate_forward_headers: Vec<String>,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl RequestLifecycle {
    /// Builds the lifecycle and emits `config_loaded` to every sink.
    #[must_use]
    pub fn new(
        ctx: SharedContext,
        collapser: Arc<Collapser>,
        config: &crate::config::AppConfig,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        let lifecycle = Self {
            ctx,
            collapser,
            collapse_enabled: config.cache.collapse_origin_requests,
            serve_when_stale: config.cache.serve_when_stale,
            visible_hostname: config.server.visible_hostname.clone(),
            revalidate_forward_headers: config.cache.revalidate_forward_headers.clone(),
            sinks: Arc::new(sinks),
        };
        lifecycle.emit(Event::ConfigLoaded, &EventContext::default());
        lifecycle
    }

    fn emit(&self, event: Event, ctx: &EventContext) {
        for sink in self.sinks.iter() {
            sink.emit(event, ctx);
        }
    }

    /// Classifies and serves one request.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] for store or origin failures on the
    /// critical path; everything else is recovered locally.
    pub async fn handle(&self, request: ClientRequest) -> Result<ClientResponse, LifecycleError> {
        let fingerprint = request.fingerprint();
        let chain = KeyChain::from_fingerprint(&fingerprint);
        let now = unix_now();

        let can_read = request.is_get() || request.is_head();
        let entry = if can_read { self.ctx.store.read_entry(&chain).await? } else { None };
        let entity_present = match &entry {
            Some(e) if !e.entity.is_empty() => {
                self.ctx.storage.exists(&e.entity).await.unwrap_or_else(|err| {
                    warn!(root = chain.root(), error = %err, "entity existence check failed");
                    false
                })
            }
            _ => false,
        };
        let state = freshness::classify(entry.as_ref(), entity_present, now, self.serve_when_stale);
        self.emit(
            Event::CacheAccessed,
            &EventContext { uri: fingerprint.uri().to_string(), state: Some(state), action: None },
        );

        // Bypass headers and non-GET/HEAD methods force an origin fetch and
        // disable caching for this request.
        let bypass = !can_read
            || request.headers.has_directive("Cache-Control", "no-cache")
            || request.headers.has_directive("Pragma", "no-cache");

        if bypass {
            let response = self.fetch_direct(&request, &fingerprint, &chain, false, None).await?;
            return Ok(self.build_response(&request, response, state, CacheAction::Fetched, false));
        }

        if state >= CacheState::Warm {
            let entry = entry.expect("state >= WARM implies a record");
            match self.ctx.storage.get(&entry.entity).await {
                Ok(Some(body)) => {
                    if state == CacheState::Warm {
                        self.schedule_revalidation(&chain, &entry).await;
                    }
                    return Ok(self.serve_entry(&request, &entry, body, state, CacheAction::None));
                }
                Ok(None) => {
                    debug!(root = chain.root(), "entity vanished between check and read");
                }
                Err(err) => {
                    warn!(root = chain.root(), error = %err, "entity read failed, treating as miss");
                }
            }
            // Storage let us down mid-serve; fall through as a miss.
            return self.handle_miss(&request, &fingerprint, &chain, CacheState::Subzero, None).await;
        }

        // A HEAD miss fetches directly and never populates the cache; only
        // GET enters the collapse-and-store path.
        if request.is_head() {
            let response = self.fetch_direct(&request, &fingerprint, &chain, false, None).await?;
            return Ok(self.build_response(&request, response, state, CacheAction::Fetched, false));
        }

        let prior_entity = entry.as_ref().map(|e| e.entity.clone());
        self.handle_miss(&request, &fingerprint, &chain, state, prior_entity).await
    }

    /// COLD/SUBZERO path: collapse when enabled, otherwise fetch directly.
    async fn handle_miss(
        &self,
        request: &ClientRequest,
        fingerprint: &Fingerprint,
        chain: &KeyChain,
        state: CacheState,
        prior_entity: Option<String>,
    ) -> Result<ClientResponse, LifecycleError> {
        if !self.collapse_enabled {
            let response =
                self.fetch_direct(request, fingerprint, chain, request.is_get(), prior_entity).await?;
            return Ok(self.build_response(request, response, state, CacheAction::Fetched, false));
        }

        match self.collapser.acquire(chain).await? {
            CollapseRole::Leader => {
                self.fetch_as_leader(request, fingerprint, chain, state, prior_entity).await
            }
            CollapseRole::Follower => {
                self.wait_as_follower(request, fingerprint, chain, state, prior_entity).await
            }
        }
    }

    /// Leader path: the fetch-and-store runs on its own task so client
    /// cancellation cannot strand followers or leave the cache cold.
    async fn fetch_as_leader(
        &self,
        request: &ClientRequest,
        fingerprint: &Fingerprint,
        chain: &KeyChain,
        state: CacheState,
        prior_entity: Option<String>,
    ) -> Result<ClientResponse, LifecycleError> {
        let job = FetchJob {
            ctx: self.ctx.clone(),
            sinks: Arc::clone(&self.sinks),
            chain: chain.clone(),
            uri: fingerprint.uri().to_string(),
            relative_uri: request.relative_uri(),
            method: request.method.clone(),
            forward_headers: request.headers.clone(),
            reval_headers: self.reval_headers_from(&request.headers),
            body: request.body.clone(),
            can_store: true,
            prior_entity,
        };
        let collapser = Arc::clone(&self.collapser);
        let task_chain = chain.clone();

        let handle = tokio::spawn(async move {
            let result = job.run().await;
            let stored = matches!(&result, Ok((_, true)));
            collapser.finish(&task_chain, stored).await;
            result
        });

        let (response, _stored) = handle
            .await
            .map_err(|e| LifecycleError::Internal(format!("leader fetch task lost: {e}")))??;
        Ok(self.build_response(request, response, state, CacheAction::Fetched, false))
    }

    /// Follower path: wait, then re-read; time out into a single fallback
    /// fetch (late subscribers re-check the cache first).
    async fn wait_as_follower(
        &self,
        request: &ClientRequest,
        fingerprint: &Fingerprint,
        chain: &KeyChain,
        state: CacheState,
        prior_entity: Option<String>,
    ) -> Result<ClientResponse, LifecycleError> {
        let outcome = self.collapser.wait_for_leader(chain).await?;

        if matches!(outcome, WaitOutcome::Finished | WaitOutcome::TimedOut) {
            if let Some(served) = self.try_serve_committed(request, chain).await? {
                return Ok(served);
            }
        }

        debug!(root = chain.root(), outcome = ?outcome, "follower falling back to direct fetch");
        let response =
            self.fetch_direct(request, fingerprint, chain, request.is_get(), prior_entity).await?;
        Ok(self.build_response(request, response, state, CacheAction::Fetched, false))
    }

    /// Re-reads the cache after a leader publication; serves when the entry
    /// committed and its body is readable.
    async fn try_serve_committed(
        &self,
        request: &ClientRequest,
        chain: &KeyChain,
    ) -> Result<Option<ClientResponse>, LifecycleError> {
        let now = unix_now();
        let Some(entry) = self.ctx.store.read_entry(chain).await? else {
            return Ok(None);
        };
        let entity_present = self.ctx.storage.exists(&entry.entity).await.unwrap_or(false);
        let state = freshness::classify(Some(&entry), entity_present, now, self.serve_when_stale);
        if state < CacheState::Warm {
            return Ok(None);
        }
        match self.ctx.storage.get(&entry.entity).await {
            Ok(Some(body)) => {
                Ok(Some(self.serve_entry(request, &entry, body, state, CacheAction::Collapsed)))
            }
            _ => Ok(None),
        }
    }

    /// Uncoalesced origin fetch; stores when `can_store` and the response is
    /// cacheable.
    async fn fetch_direct(
        &self,
        request: &ClientRequest,
        fingerprint: &Fingerprint,
        chain: &KeyChain,
        can_store: bool,
        prior_entity: Option<String>,
    ) -> Result<OriginResponse, LifecycleError> {
        let job = FetchJob {
            ctx: self.ctx.clone(),
            sinks: Arc::clone(&self.sinks),
            chain: chain.clone(),
            uri: fingerprint.uri().to_string(),
            relative_uri: request.relative_uri(),
            method: request.method.clone(),
            forward_headers: request.headers.clone(),
            reval_headers: self.reval_headers_from(&request.headers),
            body: request.body.clone(),
            can_store,
            prior_entity,
        };
        let (response, _stored) = job.run().await?;
        Ok(response)
    }

    /// Request headers stored with the entry and replayed on background
    /// revalidation (`Cookie` by default).
    fn reval_headers_from(&self, headers: &HeaderBag) -> HeaderBag {
        headers
            .iter()
            .filter(|(name, _)| {
                self.revalidate_forward_headers.iter().any(|n| name.eq_ignore_ascii_case(n))
            })
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    async fn schedule_revalidation(&self, chain: &KeyChain, entry: &CacheEntry) {
        let job = Job::revalidate(chain.root(), entry.uri.clone(), &entry.reval_headers);
        if let Err(e) = self.ctx.queue.enqueue(&job).await {
            warn!(root = chain.root(), error = %e, "failed to enqueue revalidation");
        }
    }

    fn serve_entry(
        &self,
        request: &ClientRequest,
        entry: &CacheEntry,
        body: Bytes,
        state: CacheState,
        action: CacheAction,
    ) -> ClientResponse {
        let response =
            OriginResponse { status: entry.status, headers: entry.headers.clone(), body };
        self.build_response(request, response, state, action, state.is_hit())
    }

    /// Decorates and finalizes the client response, emitting the tail of
    /// the event sequence.
    fn build_response(
        &self,
        request: &ClientRequest,
        response: OriginResponse,
        state: CacheState,
        action: CacheAction,
        hit: bool,
    ) -> ClientResponse {
        let mut headers = response.headers.without_hop_by_hop();
        prepend_via(&mut headers, &self.visible_hostname);
        headers.set("X-Cache", if hit { "HIT" } else { "MISS" });
        headers.set("X-Cache-State", state.as_str());
        if let Some(value) = action.header_value() {
            headers.set("X-Cache-Action", value);
        }
        // Actual bytes override any origin value; HEAD advertises the GET
        // length while sending no body.
        headers.set("Content-Length", response.body.len().to_string());
        let body = if request.is_head() { Bytes::new() } else { response.body };

        let ctx = EventContext {
            uri: request.relative_uri(),
            state: Some(state),
            action: Some(action),
        };
        self.emit(Event::ResponseReady, &ctx);
        self.emit(Event::ResponseSent, &ctx);
        self.emit(Event::Finished, &ctx);
        crate::metrics::record_response(state, action, hit);

        ClientResponse { status: response.status, headers, body, state, action }
    }
}

/// Owned context for one origin round trip, movable onto a spawned task.
struct FetchJob {
    ctx: SharedContext,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
    chain: KeyChain,
    uri: String,
    relative_uri: String,
    method: String,
    forward_headers: HeaderBag,
    reval_headers: HeaderBag,
    body: Option<Bytes>,
    can_store: bool,
    prior_entity: Option<String>,
}

impl FetchJob {
    fn emit(&self, event: Event) {
        let ctx = EventContext { uri: self.uri.clone(), state: None, action: None };
        for sink in self.sinks.iter() {
            sink.emit(event, &ctx);
        }
    }

    /// Fetches from origin and stores when permitted and cacheable.
    /// Returns the captured response and whether a cache write committed.
    async fn run(self) -> Result<(OriginResponse, bool), LifecycleError> {
        self.emit(Event::OriginRequired);
        let response = self
            .ctx
            .fetcher
            .fetch(&self.method, &self.relative_uri, &self.forward_headers, self.body.clone())
            .await?;
        self.emit(Event::OriginFetched);
        crate::metrics::record_origin_fetch(response.status);

        if !self.can_store {
            return Ok((response, false));
        }
        let now = unix_now();
        let Some(expires) = response_expiry(&response, now) else {
            return Ok((response, false));
        };

        match self
            .ctx
            .writer
            .write(
                &self.chain,
                &self.uri,
                &response,
                &self.reval_headers,
                expires,
                now,
                self.prior_entity.as_deref(),
            )
            .await
        {
            Ok(_) => Ok((response, true)),
            Err(e) => {
                // The response is still valid for this client; only the
                // cache write is lost. Orphans go to the collector.
                warn!(root = self.chain.root(), error = %e, "cache write failed");
                Ok((response, false))
            }
        }
    }
}
