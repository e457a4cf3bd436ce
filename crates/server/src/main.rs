use anyhow::Result;
use axum::{routing::get, serve, Router};
use ledge_core::{
    collapse::Collapser,
    config::AppConfig,
    jobs::RedisJobQueue,
    lifecycle::{EventSink, RequestLifecycle, SharedContext},
    origin::OriginFetcher,
    purge::PurgeCoordinator,
    storage::RedisBodyStorage,
    store::RedisMetadataStore,
    worker::Worker,
    writer::CacheWriter,
};
use server::{observe::TraceEventSink, router};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};
use tower::limit::ConcurrencyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system based on the configuration.
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,ledge_core={level},server={level}",
            level = config.logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty().with_target(false)).init();
    }
}

/// Container for initialized core services.
struct CoreServices {
    state: router::AppState,
    worker: Arc<Worker>,
}

/// Initializes stores, the origin client, and the engine.
async fn init_core_services(config: &AppConfig) -> Result<CoreServices> {
    ledge_core::metrics::install_prometheus();

    let store = Arc::new(
        RedisMetadataStore::connect(&config.redis.url)
            .await
            .map_err(|e| anyhow::anyhow!("metadata store initialization failed: {e}"))?,
    );
    let storage = Arc::new(
        RedisBodyStorage::connect(&config.redis.url)
            .await
            .map_err(|e| anyhow::anyhow!("body storage initialization failed: {e}"))?,
    );
    let queue = Arc::new(
        RedisJobQueue::connect(&config.redis.url)
            .await
            .map_err(|e| anyhow::anyhow!("job queue initialization failed: {e}"))?,
    );
    let fetcher = Arc::new(
        OriginFetcher::new(&config.upstream)
            .map_err(|e| anyhow::anyhow!("origin client initialization failed: {e}"))?,
    );
    let writer = Arc::new(CacheWriter::new(
        store.clone(),
        storage.clone(),
        queue.clone(),
        config.cache.serve_when_stale,
        config.cache.keep_cache_for,
    ));

    let ctx = SharedContext {
        store: store.clone(),
        storage,
        fetcher,
        writer,
        queue,
    };
    let collapser = Arc::new(Collapser::new(
        ctx.store.clone(),
        config.cache.lock_ttl,
        Duration::from_secs(config.cache.follower_wait),
    ));
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TraceEventSink)];
    let lifecycle = Arc::new(RequestLifecycle::new(ctx.clone(), collapser, config, sinks));
    let purge = Arc::new(PurgeCoordinator::new(ctx.clone(), config.cache.keyspace_scan_count));
    let worker = Arc::new(Worker::new(ctx, purge.clone(), config.worker.poll_interval_ms));

    Ok(CoreServices {
        state: router::AppState {
            lifecycle,
            purge,
            store,
            worker_heartbeat: worker.heartbeat(),
            request_body_limit: config.server.request_body_limit_bytes,
        },
        worker,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("configuration loading failed: {e}"))?;
    init_logging(&config);
    info!(
        bind_port = config.server.bind_port,
        upstream = format!("{}:{}", config.upstream.host, config.upstream.port),
        collapse = config.cache.collapse_origin_requests,
        "starting ledge"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let services = init_core_services(&config).await?;

    let worker = services.worker.clone();
    let worker_shutdown = shutdown_tx.subscribe();
    let worker_handle = tokio::spawn(async move {
        worker.run(worker_shutdown).await;
    });

    let app = Router::new()
        .route("/_ledge/health", get(router::handle_health))
        .route("/_ledge/metrics", get(router::handle_metrics))
        .fallback(router::handle_request)
        .layer(ConcurrencyLimitLayer::new(config.server.max_concurrent_requests))
        .with_state(services.state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.bind_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "ledge listening");

    if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "server error occurred");
    }

    let _ = shutdown_tx.send(());
    let _ = worker_handle.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}
