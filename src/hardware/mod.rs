//! Hardware introspection and capability tiers
//!
//! This module provides:
//! - One-shot sampling of RAM, CPU topology, and accelerator presence
//! - A hardware tier classification driving default model/context choices
//! - Memory budget fractions and threading plans consumed by the optimizer

pub mod probe;

pub use probe::{
    AcceleratorInfo, HardwareProbe, HardwareSnapshot, HardwareTier, MemoryBudget, ThreadingPlan,
    WorkloadClass,
};
