//! Model descriptors and residency state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use crate::optimizer::ModelShape;

/// Where a model currently sits in its load lifecycle
///
/// Transitions run one way (Unloaded → Loading → Loaded → Unloading →
/// Unloaded); any state may fall to Error on explicit failure, and recovery
/// from Error goes through Unloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResidencyState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error(String),
}

impl ResidencyState {
    /// Stable name for status payloads
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
            Self::Error(_) => "error",
        }
    }

    /// Whether the state counts against the residency bound
    pub fn is_resident(&self) -> bool {
        matches!(self, Self::Loading | Self::Loaded)
    }
}

/// Static model configuration supplied at registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Declared context window; the hardware tier default applies when zero
    pub context_window: u32,
    /// Quantization tag, e.g. "q4_k_m"
    pub quantization: Option<String>,
    /// Declared transformer dimensions for KV estimation
    pub shape: Option<ModelShape>,
    /// Free-form metadata
    pub tags: HashMap<String, String>,
}

/// Rolling generation-time statistics for a loaded model
#[derive(Debug, Clone, Copy, Default)]
pub struct GenStats {
    pub count: u64,
    pub total_ms: u64,
}

impl GenStats {
    /// Record one generation
    pub fn record(&mut self, elapsed_ms: u64) {
        self.count += 1;
        self.total_ms += elapsed_ms;
    }

    /// Mean generation time, if any samples exist
    pub fn mean_ms(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.total_ms as f64 / self.count as f64)
        }
    }
}

/// Registry entry for one model
#[derive(Debug)]
pub struct ModelDescriptor {
    pub alias: String,
    pub path: PathBuf,
    pub config: ModelConfig,
    pub state: ResidencyState,
    pub registered_at: DateTime<Utc>,
    pub loaded_at: Option<Instant>,
    pub load_duration_ms: Option<u64>,
    pub last_used: Option<Instant>,
    pub footprint_bytes: Option<u64>,
    pub gen_stats: GenStats,
    /// Generations currently running against this model; nonzero blocks
    /// eviction
    pub in_use: Arc<AtomicUsize>,
}

impl ModelDescriptor {
    /// Fresh, unloaded descriptor
    pub fn new(alias: impl Into<String>, path: PathBuf, config: ModelConfig) -> Self {
        Self {
            alias: alias.into(),
            path,
            config,
            state: ResidencyState::Unloaded,
            registered_at: Utc::now(),
            loaded_at: None,
            load_duration_ms: None,
            last_used: None,
            footprint_bytes: None,
            gen_stats: GenStats::default(),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Serializable view of a descriptor for the status payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub alias: String,
    pub state: String,
    pub footprint_mb: Option<u64>,
    pub load_duration_ms: Option<u64>,
    pub mean_generation_ms: Option<f64>,
    pub generation_count: u64,
}

impl From<&ModelDescriptor> for ModelInfo {
    fn from(descriptor: &ModelDescriptor) -> Self {
        Self {
            alias: descriptor.alias.clone(),
            state: descriptor.state.name().to_string(),
            footprint_mb: descriptor.footprint_bytes.map(|b| b / (1024 * 1024)),
            load_duration_ms: descriptor.load_duration_ms,
            mean_generation_ms: descriptor.gen_stats.mean_ms(),
            generation_count: descriptor.gen_stats.count,
        }
    }
}
