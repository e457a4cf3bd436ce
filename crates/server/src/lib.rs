//! HTTP server embedding for Ledge.
//!
//! - `router`: request parsing, the caching/purge dispatch, and the admin
//!   endpoints (`/_ledge/health`, `/_ledge/metrics`)
//! - `observe`: a tracing-backed lifecycle event sink

pub mod observe;
pub mod router;
