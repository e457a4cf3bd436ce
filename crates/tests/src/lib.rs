//! Integration tests for the Ledge reverse-proxy cache.
//!
//! This crate contains the test modules:
//!
//! - `lifecycle_tests`: prime/hit round trips, bypass headers, HEAD
//!   handling, WARM revalidation, and storage-miss recovery
//! - `collapse_tests`: concurrent miss bursts, follower timeout fallback,
//!   and disabled collapsing
//! - `purge_tests`: the three purge modes, TTL reduction invariants, and
//!   wildcard scheduling
//! - `worker_tests`: purge scans, background revalidation, and orphan
//!   entity collection
//! - `mock_infrastructure`: reusable in-memory store/storage/queue doubles
//!   and a mockito-backed origin builder
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```
//!
//! No external services are required: the metadata store, body storage, and
//! job queue run in memory, and the origin is a mockito server.


#[cfg(test)]
mod collapse_tests;

#[cfg(test)]
mod purge_tests;


/// Mock infrastructure for testing
pub mod mock_infrastructure;
