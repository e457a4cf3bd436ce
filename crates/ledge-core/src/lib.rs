//! # Ledge Core
//!
//! Core library for the Ledge HTTP reverse-proxy cache.
//!
//! This crate provides the foundational components for:
//!
//! - **[`lifecycle`]**: The request lifecycle engine — classifies each
//!   request against cache state, collapses concurrent misses into one
//!   origin fetch, and decorates responses.
//!
//! - **[`purge`]**: Synchronous exact-key purges in three modes
//!   (invalidate / delete / revalidate) plus asynchronous wildcard purges.
//!
//! - **[`worker`]**: The background job consumer for purge scans,
//!   revalidation, and orphan entity collection.
//!
//! - **[`store`] / [`storage`] / [`jobs`]**: Adapters over the shared
//!   key-value store for metadata, body blobs, and the job queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RequestLifecycle                      │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────┐   │
//! │  │ MetadataStore│  │ OriginFetcher │  │  CacheWriter   │   │
//! │  └──────┬───────┘  └───────┬───────┘  └───────┬────────┘   │
//! │         │                  │                  │            │
//! │  ┌──────▼───────┐  ┌───────▼───────┐  ┌───────▼────────┐   │
//! │  │  Collapser   │  │  BodyStorage  │  │   JobQueue     │   │
//! │  │ (lock+pubsub)│  │ (entity blobs)│  │ (idempotent id)│   │
//! │  └──────────────┘  └───────────────┘  └───────┬────────┘   │
//! │                                               │            │
//! │  ┌─────────────────┐                  ┌───────▼────────┐   │
//! │  │ PurgeCoordinator│─── wildcard ────►│     Worker     │   │
//! │  └─────────────────┘                  └────────────────┘   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────┐
//! │ Cache Read  │──► classify: SUBZERO / COLD / WARM / HOT
//! └──────┬──────┘
//!        │
//!   HOT ─┼─► serve from cache
//!  WARM ─┼─► serve from cache + enqueue revalidate job
//!  miss ─┴─► collapse lock ──► leader: fetch + store + publish
//!                         └──► follower: wait ──► re-read ──► serve
//! ```
//!
//! All cross-request coordination (collapse lock, publication, purge TTLs)
//! lives in the shared key-value store, so multiple worker processes
//! cooperate on the same cache.

pub mod collapse;
pub mod config;
pub mod freshness;
pub mod jobs;
pub mod keys;
pub mod lifecycle;
pub mod metrics;
pub mod origin;
pub mod purge;
pub mod storage;
pub mod store;
pub mod types;
pub mod worker;
pub mod writer;
