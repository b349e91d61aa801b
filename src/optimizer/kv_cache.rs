//! KV-cache sizing and compression planning

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Chunked-attention chunk size never exceeds this
const MAX_ATTENTION_CHUNK: u32 = 512;

/// Transformer dimensions used for the KV estimate
///
/// When a model does not declare its shape, estimation assumes this profile
/// rather than refusing to plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub hidden_size: u32,
    pub layer_count: u32,
    pub head_count: u32,
    /// Bytes per stored activation value
    pub precision_bytes: u32,
}

impl Default for ModelShape {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            layer_count: 32,
            head_count: 32,
            precision_bytes: 2,
        }
    }
}

/// Outcome of KV planning for one (model, sequence, batch) shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KvPlan {
    /// Whether the cache must be compressed to fit
    pub compression: bool,
    /// Target compression ratio (1.0 when uncompressed)
    pub ratio: f64,
    /// Whether attention should run in chunks
    pub chunked_attention: bool,
    /// Chunk length when chunked attention is on
    pub chunk_size: u32,
    /// Estimated (uncompressed) cache size in bytes
    pub cache_size_bytes: u64,
}

/// Plans KV-cache placement under a byte ceiling, memoized per shape
pub struct KvCachePlanner {
    ceiling_bytes: u64,
    memo: Mutex<HashMap<(String, u32, u32), KvPlan>>,
}

impl KvCachePlanner {
    /// Create a planner with the configured ceiling
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            ceiling_bytes,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Estimate KV bytes: keys and values across every layer and position
    pub fn estimate_bytes(shape: &ModelShape, seq_len: u32, batch_size: u32) -> u64 {
        2u64 * shape.layer_count as u64
            * shape.hidden_size as u64
            * shape.precision_bytes as u64
            * seq_len as u64
            * batch_size as u64
    }

    /// Plan the KV cache for a request shape
    pub fn plan(
        &self,
        model_id: &str,
        shape: Option<ModelShape>,
        seq_len: u32,
        batch_size: u32,
    ) -> KvPlan {
        let key = (model_id.to_string(), seq_len, batch_size);
        if let Some(plan) = self.memo.lock().get(&key) {
            return *plan;
        }

        let shape = shape.unwrap_or_default();
        let estimate = Self::estimate_bytes(&shape, seq_len, batch_size);

        let plan = if estimate <= self.ceiling_bytes {
            KvPlan {
                compression: false,
                ratio: 1.0,
                chunked_attention: false,
                chunk_size: 0,
                cache_size_bytes: estimate,
            }
        } else {
            KvPlan {
                compression: true,
                ratio: self.ceiling_bytes as f64 / estimate as f64,
                chunked_attention: true,
                chunk_size: MAX_ATTENTION_CHUNK.min(seq_len / 4).max(1),
                cache_size_bytes: estimate,
            }
        };

        self.memo.lock().insert(key, plan);
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_matches_shape() {
        let shape = ModelShape::default();
        // 2 * 32 layers * 4096 hidden * 2 bytes = 512 KiB per token.
        assert_eq!(KvCachePlanner::estimate_bytes(&shape, 1, 1), 524_288);
        assert_eq!(
            KvCachePlanner::estimate_bytes(&shape, 2048, 4),
            524_288 * 2048 * 4
        );
    }

    #[test]
    fn test_small_sequence_uncompressed() {
        let planner = KvCachePlanner::new(1024 * 1024 * 1024);
        let plan = planner.plan("m", None, 512, 1);
        assert!(!plan.compression);
        assert!(!plan.chunked_attention);
        assert!((plan.ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_over_ceiling_compresses_and_chunks() {
        // 64 MB ceiling, 4096-token sequence needs 2 GB.
        let planner = KvCachePlanner::new(64 * 1024 * 1024);
        let plan = planner.plan("m", None, 4096, 1);
        assert!(plan.compression);
        assert!(plan.chunked_attention);
        assert!(plan.ratio < 1.0 && plan.ratio > 0.0);
        assert_eq!(plan.chunk_size, 512); // min(512, 4096 / 4)
    }

    #[test]
    fn test_chunk_size_tracks_short_sequences() {
        let planner = KvCachePlanner::new(1);
        let plan = planner.plan("m", None, 1024, 1);
        assert_eq!(plan.chunk_size, 256); // min(512, 1024 / 4)
    }

    #[test]
    fn test_memoized_by_shape() {
        let planner = KvCachePlanner::new(64 * 1024 * 1024);
        let first = planner.plan("m", None, 4096, 2);
        let second = planner.plan("m", None, 4096, 2);
        assert_eq!(first, second);
        assert_eq!(planner.memo.lock().len(), 1);

        planner.plan("m", None, 4096, 4);
        assert_eq!(planner.memo.lock().len(), 2);
    }

    #[test]
    fn test_declared_shape_overrides_default() {
        let planner = KvCachePlanner::new(u64::MAX);
        let small = ModelShape {
            hidden_size: 1024,
            layer_count: 8,
            head_count: 8,
            precision_bytes: 2,
        };
        let plan = planner.plan("small", Some(small), 128, 1);
        assert_eq!(
            plan.cache_size_bytes,
            KvCachePlanner::estimate_bytes(&small, 128, 1)
        );
    }
}
