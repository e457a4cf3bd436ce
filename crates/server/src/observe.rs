//! Lifecycle event sink backed by tracing.
//!
//! Keeps the stable event sequence visible in logs without the engine
//! knowing anything about the logging stack.

use ledge_core::lifecycle::{Event, EventContext, EventSink};
use tracing::debug;

/// Emits every lifecycle event at debug level with its request context.
#[derive(Debug, Default)]
pub struct TraceEventSink;

impl EventSink for TraceEventSink {
    fn emit(&self, event: Event, ctx: &EventContext) {
        debug!(
            event = event.as_str(),
            uri = %ctx.uri,
            state = ctx.state.map(|s| s.as_str()).unwrap_or("-"),
            action = ctx.action.and_then(|a| a.header_value()).unwrap_or("-"),
            "lifecycle event"
        );
    }
}
