//! Embedding storage and approximate nearest-neighbor search
//!
//! This module provides:
//! - A uniform store contract over pluggable index backends (flat scan,
//!   graph-based, and partitioned)
//! - Typed, exact-match-filterable record metadata
//! - On-disk persistence with a recovery copy of the embedding file
//! - A memoized search cache and rolling latency telemetry

pub mod backend;
pub mod flat;
pub mod hnsw;
pub mod ivf;
pub mod persistence;
pub mod record;
pub mod store;

pub use backend::{BackendConfig, IndexBackend, IndexKind, Metric, VectorData};
pub use record::{MetaValue, Metadata, NewRecord, SearchHit, VectorRecord};
pub use store::{VectorStore, VectorStoreConfig, VectorStoreError, VectorStoreResult};
