//! Content-addressed result caching
//!
//! This module provides:
//! - Stable fingerprints over the determinism-relevant request fields
//! - A byte-bounded store with TTL, tag invalidation, and tiered eviction
//! - Hit/miss accounting feeding the runtime status payload

pub mod fingerprint;
pub mod store;

pub use fingerprint::{fingerprint, FingerprintInputs};
pub use store::{CacheError, CacheResult, CacheStats, CacheTier, FingerprintCache};
