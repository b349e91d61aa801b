//! System probe for memory, CPU, and accelerator capabilities

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

/// Fraction of total RAM suggested for the model cache
const MODEL_CACHE_FRACTION: f64 = 0.40;
/// Fraction of total RAM suggested for the inference (fingerprint) cache
const INFERENCE_CACHE_FRACTION: f64 = 0.20;
/// Fraction of total RAM suggested for KV caches
const KV_CACHE_FRACTION: f64 = 0.20;

/// Capability tier derived from installed RAM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareTier {
    /// 64 GB and up: large models, long contexts
    Workstation,
    /// 32-64 GB: mid-size models at full context
    Performance,
    /// 16-32 GB: quantized mid-size models
    Balanced,
    /// Below 16 GB: small quantized models only
    Constrained,
}

impl HardwareTier {
    fn from_total_ram_mb(total_mb: u64) -> Self {
        match total_mb {
            mb if mb >= 64 * 1024 => Self::Workstation,
            mb if mb >= 32 * 1024 => Self::Performance,
            mb if mb >= 16 * 1024 => Self::Balanced,
            _ => Self::Constrained,
        }
    }

    /// Suggested ceiling for a single resident model
    pub fn suggested_model_memory_mb(&self) -> u64 {
        match self {
            Self::Workstation => 32 * 1024,
            Self::Performance => 16 * 1024,
            Self::Balanced => 8 * 1024,
            Self::Constrained => 4 * 1024,
        }
    }

    /// Default context window for models without a declared one
    pub fn default_context_length(&self) -> u32 {
        match self {
            Self::Workstation => 32_768,
            Self::Performance => 16_384,
            Self::Balanced => 8_192,
            Self::Constrained => 4_096,
        }
    }
}

/// Workload class parameterizing the threading plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadClass {
    /// Latency-sensitive interactive generation
    Inference,
    /// Throughput-oriented batch processing
    Batch,
    /// Both kinds sharing the host
    Mixed,
}

/// Accelerator presence and capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    /// Device identifier as reported by the driver node
    pub device: String,
    /// Dedicated accelerator memory, if known
    pub memory_mb: Option<u64>,
}

/// Suggested split of total RAM between the runtime's memory consumers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub model_cache_mb: u64,
    pub inference_cache_mb: u64,
    pub kv_cache_mb: u64,
    pub reserve_mb: u64,
}

/// Thread counts per class for a given workload
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThreadingPlan {
    pub inference_threads: usize,
    pub io_threads: usize,
    pub background_threads: usize,
}

/// Point-in-time sample of host capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub total_ram_mb: u64,
    pub available_ram_mb: u64,
    pub logical_cores: usize,
    pub accelerator: Option<AcceleratorInfo>,
    pub tier: HardwareTier,
}

/// Read-only view of host hardware, sampled at construction
///
/// The snapshot never changes underneath callers; `refresh()` replaces it
/// wholesale with a new sample.
pub struct HardwareProbe {
    snapshot: RwLock<HardwareSnapshot>,
}

impl HardwareProbe {
    /// Sample the host and build a probe
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Self::sample()),
        }
    }

    fn sample() -> HardwareSnapshot {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let total_ram_mb = sys.total_memory() / (1024 * 1024);
        let available_ram_mb = sys.available_memory() / (1024 * 1024);
        let logical_cores = sys.cpus().len().max(1);
        let accelerator = Self::detect_accelerator();
        let tier = HardwareTier::from_total_ram_mb(total_ram_mb);

        tracing::debug!(
            total_ram_mb,
            available_ram_mb,
            logical_cores,
            ?tier,
            accelerator = accelerator.is_some(),
            "hardware probe sampled"
        );

        HardwareSnapshot {
            total_ram_mb,
            available_ram_mb,
            logical_cores,
            accelerator,
            tier,
        }
    }

    fn detect_accelerator() -> Option<AcceleratorInfo> {
        // Dedicated GPU memory is not exposed through a portable API; the
        // override lets deployments declare it when the driver node exists.
        let memory_mb = std::env::var("BARRISTER_ACCELERATOR_MB")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        for device in ["/dev/nvidia0", "/dev/dri/renderD128"] {
            if Path::new(device).exists() {
                return Some(AcceleratorInfo {
                    device: device.to_string(),
                    memory_mb,
                });
            }
        }
        None
    }

    /// Re-sample the host, replacing the snapshot
    pub fn refresh(&self) {
        *self.snapshot.write() = Self::sample();
    }

    /// Current snapshot
    pub fn snapshot(&self) -> HardwareSnapshot {
        self.snapshot.read().clone()
    }

    /// Capability tier
    pub fn tier(&self) -> HardwareTier {
        self.snapshot.read().tier
    }

    /// Suggested memory split as fixed fractions of total RAM
    pub fn memory_budget(&self) -> MemoryBudget {
        let total = self.snapshot.read().total_ram_mb as f64;
        let model_cache_mb = (total * MODEL_CACHE_FRACTION) as u64;
        let inference_cache_mb = (total * INFERENCE_CACHE_FRACTION) as u64;
        let kv_cache_mb = (total * KV_CACHE_FRACTION) as u64;
        MemoryBudget {
            model_cache_mb,
            inference_cache_mb,
            kv_cache_mb,
            reserve_mb: (total as u64)
                .saturating_sub(model_cache_mb + inference_cache_mb + kv_cache_mb),
        }
    }

    /// Thread counts for a workload class
    pub fn threading_plan(&self, workload: WorkloadClass) -> ThreadingPlan {
        let cores = self.snapshot.read().logical_cores;
        match workload {
            WorkloadClass::Inference => ThreadingPlan {
                inference_threads: cores.saturating_sub(2).max(1),
                io_threads: 2,
                background_threads: 1,
            },
            WorkloadClass::Batch => ThreadingPlan {
                inference_threads: cores.max(1),
                io_threads: 1,
                background_threads: 1,
            },
            WorkloadClass::Mixed => ThreadingPlan {
                inference_threads: (cores / 2).max(1),
                io_threads: 2,
                background_threads: 1,
            },
        }
    }

    /// Whether accelerator-specific fast paths may be enabled
    pub fn accelerator_available(&self) -> bool {
        self.snapshot.read().accelerator.is_some()
    }
}

impl Default for HardwareProbe {
    fn default() -> Self {
        Self::new()
    }
}
