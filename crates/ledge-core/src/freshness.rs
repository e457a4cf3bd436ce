//! Freshness evaluation.
//!
//! Classifies a fetched metadata record into SUBZERO/COLD/WARM/HOT given the
//! current time and the configured `serve_when_stale` grace window.
//!
//! Boundary rules: `expires == now` is WARM when `serve_when_stale > 0`,
//! COLD otherwise. `expires <= now - serve_when_stale` is COLD.

use crate::types::{CacheEntry, CacheState};

/// Classifies an entry. `entity_present` is whether the referenced body
/// entity exists in blob storage; a missing body forces SUBZERO regardless
/// of metadata freshness.
#[must_use]
pub fn classify(
    entry: Option<&CacheEntry>,
    entity_present: bool,
    now: u64,
    serve_when_stale: u64,
) -> CacheState {
    let Some(entry) = entry else {
        return CacheState::Subzero;
    };
    if entry.entity.is_empty() || !entity_present {
        return CacheState::Subzero;
    }

    if entry.expires > now {
        CacheState::Hot
    } else if now < entry.expires + serve_when_stale {
        CacheState::Warm
    } else {
        CacheState::Cold
    }
}
