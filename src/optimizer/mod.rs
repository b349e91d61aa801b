//! Per-request optimization planning
//!
//! This module provides:
//! - KV-cache sizing with compression and chunked-attention fallback
//! - Batch-size planning against available memory with performance history
//! - A façade composing both with the hardware probe into a single plan

pub mod batch;
pub mod kv_cache;
pub mod planner;

pub use batch::{BatchPlanner, ModelSizeClass, PerfSample};
pub use kv_cache::{KvCachePlanner, KvPlan, ModelShape};
pub use planner::{Optimizer, Plan, PlanRequest};
