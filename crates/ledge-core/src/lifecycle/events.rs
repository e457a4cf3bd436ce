//! Lifecycle event hooks.
//!
//! Emission points are a polymorphic sink rather than mutable hook lists:
//! plugins and tests implement [`EventSink`] and receive an event tag plus
//! request context. Emission order per request is stable:
//! `cache_accessed → (origin_required → origin_fetched)? → response_ready →
//! response_sent → finished`, with `config_loaded` once at engine
//! construction.

use crate::types::{CacheAction, CacheState};

/// Observable lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ConfigLoaded,
    CacheAccessed,
    OriginRequired,
    OriginFetched,
    ResponseReady,
    ResponseSent,
    Finished,
}

impl Event {
    /// Stable snake_case tag, matching the emission point names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigLoaded => "config_loaded",
            Self::CacheAccessed => "cache_accessed",
            Self::OriginRequired => "origin_required",
            Self::OriginFetched => "origin_fetched",
            Self::ResponseReady => "response_ready",
            Self::ResponseSent => "response_sent",
            Self::Finished => "finished",
        }
    }
}

/// Request context passed with each emission.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Full request URI, empty for `config_loaded`.
    pub uri: String,
    /// Classified state, once evaluation has happened.
    pub state: Option<CacheState>,
    /// Response action, once decided.
    pub action: Option<CacheAction>,
}

/// Polymorphic event sink.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: Event, ctx: &EventContext);
}
