//! # BARRISTER - Privacy-First Local Inference Runtime
//!
//! A local-only inference runtime for legal-assistant workloads, built in
//! Rust.
//!
//! ## Architecture
//!
//! - `hardware`: host probing, capability tiers, threading plans
//! - `memory`: pooled power-of-two block allocation
//! - `cache`: fingerprint-addressed result caching with tiered eviction
//! - `chunking`: sentence-aware document chunking for ingestion
//! - `vector`: embedding storage and ANN search over pluggable backends
//! - `optimizer`: KV-cache and batch planning composed per request
//! - `models`: descriptors, residency state machine, load orchestration
//! - `scheduling`: admission, prioritization, and the dispatch loop
//! - `streaming`: bounded per-connection token delivery with backpressure
//! - `controller`: lifecycle, the public API, and background workers

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration and the caller-facing error taxonomy
pub mod config;
pub mod error;

// Hardware introspection
pub mod hardware;

// Memory pooling
pub mod memory;

// Fingerprint cache
pub mod cache;

// Document chunking
pub mod chunking;

// Vector storage and search
pub mod vector;

// Per-request optimization
pub mod optimizer;

// Model registry
pub mod models;

// Request scheduling
pub mod scheduling;

// Token streaming
pub mod streaming;

// Unified controller
pub mod controller;

// Re-export the surface most callers need
pub use config::RuntimeConfig;
pub use controller::{GenerationResponse, SystemStatus, UnifiedController};
pub use error::{RuntimeError, RuntimeResult};
pub use scheduling::{
    FinishReason, GenerationParams, GenerationRequest, GenerationResult, Priority,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
