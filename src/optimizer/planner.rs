//! Optimizer façade composing the probe and both planners

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::hardware::{HardwareProbe, MemoryBudget, ThreadingPlan, WorkloadClass};
use crate::optimizer::batch::{BatchPlanner, ModelSizeClass};
use crate::optimizer::kv_cache::{KvCachePlanner, KvPlan, ModelShape};

/// Everything a dispatch needs to know about how to run one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub effective_batch_size: u32,
    pub threading: ThreadingPlan,
    pub kv_plan: KvPlan,
    pub memory_allocation: MemoryBudget,
}

/// Inputs describing the request being planned
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub model_id: &'a str,
    /// Declared transformer shape, when the descriptor carries one
    pub model_shape: Option<ModelShape>,
    /// Model footprint for size classification, when known
    pub footprint_bytes: Option<u64>,
    /// Prompt length plus requested generation budget, in tokens
    pub sequence_length: u32,
    pub workload: WorkloadClass,
}

/// Pure composition of the hardware probe, KV planner, and batch planner
///
/// Plans are cheap to recompute; only the KV planner memoizes internally.
pub struct Optimizer {
    probe: Arc<HardwareProbe>,
    kv: KvCachePlanner,
    batch: BatchPlanner,
    max_batch_size: u32,
}

impl Optimizer {
    /// Build an optimizer over a shared probe
    pub fn new(probe: Arc<HardwareProbe>, kv_ceiling_bytes: u64, max_batch_size: u32) -> Self {
        Self {
            probe,
            kv: KvCachePlanner::new(kv_ceiling_bytes),
            batch: BatchPlanner::new(),
            max_batch_size,
        }
    }

    /// Produce the plan for one request
    pub fn plan(&self, request: &PlanRequest<'_>) -> Plan {
        let memory_allocation = self.probe.memory_budget();
        let threading = self.probe.threading_plan(request.workload);

        let class = request
            .footprint_bytes
            .map(ModelSizeClass::from_footprint_bytes);
        let available = memory_allocation.kv_cache_mb * 1024 * 1024;
        let effective_batch_size = self.batch.plan_batch(
            class,
            request.sequence_length,
            available,
            self.max_batch_size,
        );

        let kv_plan = self.kv.plan(
            request.model_id,
            request.model_shape,
            request.sequence_length,
            effective_batch_size,
        );

        Plan {
            effective_batch_size,
            threading,
            kv_plan,
            memory_allocation,
        }
    }

    /// The batch planner, for recording performance samples
    pub fn batch_planner(&self) -> &BatchPlanner {
        &self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> Optimizer {
        Optimizer::new(Arc::new(HardwareProbe::new()), 1024 * 1024 * 1024, 8)
    }

    fn request(seq: u32) -> PlanRequest<'static> {
        PlanRequest {
            model_id: "mA",
            model_shape: None,
            footprint_bytes: Some(4 * 1024 * 1024 * 1024),
            sequence_length: seq,
            workload: WorkloadClass::Inference,
        }
    }

    #[test]
    fn test_plan_is_complete() {
        let plan = optimizer().plan(&request(512));
        assert!(plan.effective_batch_size >= 1);
        assert!(plan.effective_batch_size <= 8);
        assert!(plan.threading.inference_threads >= 1);
        assert!(plan.kv_plan.cache_size_bytes > 0);
        assert!(plan.memory_allocation.model_cache_mb > 0);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let optimizer = optimizer();
        let first = optimizer.plan(&request(512));
        let second = optimizer.plan(&request(512));
        assert_eq!(first.effective_batch_size, second.effective_batch_size);
        assert_eq!(first.kv_plan, second.kv_plan);
    }

    #[test]
    fn test_longer_sequences_shrink_batches() {
        let optimizer = optimizer();
        let short = optimizer.plan(&request(128));
        let long = optimizer.plan(&request(32_768));
        assert!(long.effective_batch_size <= short.effective_batch_size);
    }
}
