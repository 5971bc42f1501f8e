//! Read-through cache for offline reads.
//!
//! This module keeps the last successful response for every
//! (scope, signature) pair in the durable store:
//! - successful online reads overwrite the entry
//! - offline reads are answered from the entry when present
//! - a whole scope is purged on logout so tenants never see each other's data
//!
//! Entries carry an `updated_at` timestamp but no TTL; interpreting staleness
//! is left to callers.

mod entry;
mod layer;

pub use entry::{signature, CacheEntry};
pub use layer::ReadThroughCache;
