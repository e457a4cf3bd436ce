//! Metrics collection.
//!
//! Counters go through the `metrics` facade; the server exposes them via a
//! process-wide Prometheus recorder. Recording is lock-free and safe on the
//! request hot path.

use std::sync::OnceLock;

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::types::{CacheAction, CacheState};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the process-wide Prometheus recorder, or returns the existing
/// handle when already installed (tests construct the engine repeatedly).
pub fn install_prometheus() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus recorder installation cannot fail before any other recorder")
    })
}

/// Renders the current metrics in Prometheus text exposition format.
#[must_use]
pub fn render() -> String {
    install_prometheus().render()
}

/// Counts a served response by its final cache state and hit/miss class.
pub fn record_response(state: CacheState, action: CacheAction, hit: bool) {
    counter!("ledge_responses_total", "state" => state.as_str()).increment(1);
    counter!("ledge_cache_total", "result" => if hit { "HIT" } else { "MISS" }).increment(1);
    if let Some(action) = action.header_value() {
        counter!("ledge_cache_actions_total", "action" => action).increment(1);
    }
}

/// Counts an origin round trip by status class.
pub fn record_origin_fetch(status: u16) {
    let class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    counter!("ledge_origin_fetches_total", "class" => class).increment(1);
}

/// Counts a committed cache write.
pub fn record_cache_write() {
    counter!("ledge_cache_writes_total").increment(1);
}

/// Counts a purge by mode and result label.
pub fn record_purge(mode: &'static str, result: &'static str) {
    counter!("ledge_purges_total", "mode" => mode, "result" => result).increment(1);
}

/// Counts a consumed background job by class.
pub fn record_job(klass: &str) {
    counter!("ledge_jobs_total", "klass" => klass.to_string()).increment(1);
}
