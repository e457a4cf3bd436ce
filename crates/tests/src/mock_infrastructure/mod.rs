//! Reusable mock types for testing.
//!
//! - [`memory_store`]: in-memory [`MetadataStore`], [`BodyStorage`], and
//!   [`JobQueue`] implementations with recorded TTLs and broadcast pub/sub
//! - [`origin_mock`]: mockito-backed origin response builders
//! - [`test_helpers`]: a full engine harness wired over the mocks
//!
//! [`MetadataStore`]: ledge_core::store::MetadataStore
//! [`BodyStorage`]: ledge_core::storage::BodyStorage
//! [`JobQueue`]: ledge_core::jobs::JobQueue

mod origin_mock;
mod test_helpers;

pub use memory_store::{MemoryBodyStorage, MemoryJobQueue, MemoryMetadataStore};
pub use origin_mock::OriginMockBuilder;
pub use test_helpers::{request, request_with_headers, RecordingSink, TestHarness};
