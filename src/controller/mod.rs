//! Runtime lifecycle and the public API surface
//!
//! This module provides:
//! - The unified controller wiring cache, registry, scheduler, streaming,
//!   and optimizer together
//! - Cache short-circuiting around generation
//! - Background workers (metrics, cleanup, advisory auto-optimization)
//! - The nested status payload

pub mod controller;
pub mod status;

pub use controller::{GenerationResponse, UnifiedController};
pub use status::{EngineState, ResourceStatus, RuntimeMetrics, SystemStatus};
