//! Batch-size planning against available memory

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Per-config history length before truncation
const HISTORY_KEEP: usize = 100;
/// History length after truncation
const HISTORY_TRUNCATE_TO: usize = 50;
/// Fallback per-token bytes when no size class is known
const FALLBACK_BYTES_PER_TOKEN: u64 = 512 * 1024;

/// Coarse model sizing used for the per-sample memory lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelSizeClass {
    /// Up to roughly 7B parameters quantized
    Small,
    /// Mid-size models
    Medium,
    /// Everything larger
    Large,
}

impl ModelSizeClass {
    /// Classify from the on-disk footprint
    pub fn from_footprint_bytes(bytes: u64) -> Self {
        const GB: u64 = 1024 * 1024 * 1024;
        match bytes {
            b if b < 8 * GB => Self::Small,
            b if b < 20 * GB => Self::Medium,
            _ => Self::Large,
        }
    }

    fn bytes_per_token(&self) -> u64 {
        match self {
            Self::Small => 256 * 1024,
            Self::Medium => 512 * 1024,
            Self::Large => 1024 * 1024,
        }
    }
}

/// One observed execution of a planned batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerfSample {
    pub batch_size: u32,
    pub throughput_tokens_per_s: f64,
    pub latency_ms: f64,
    /// Throughput per batch slot
    pub efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConfigKey {
    model_id: String,
    batch_size: u32,
}

/// Plans batch sizes and accumulates per-config performance history
pub struct BatchPlanner {
    histories: Mutex<HashMap<ConfigKey, VecDeque<PerfSample>>>,
}

impl BatchPlanner {
    /// Create an empty planner
    pub fn new() -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Per-sample memory for one sequence of `seq_len` tokens
    fn per_sample_bytes(class: Option<ModelSizeClass>, seq_len: u32) -> u64 {
        let per_token = class
            .map(|c| c.bytes_per_token())
            .unwrap_or(FALLBACK_BYTES_PER_TOKEN);
        per_token * seq_len.max(1) as u64
    }

    /// Largest batch that fits `available_bytes`, snapped to a friendly size
    ///
    /// The result is the largest member of {powers of two} ∪ {multiples of
    /// eight} not exceeding the raw fit, never less than 1, and never more
    /// than `cap`.
    pub fn plan_batch(
        &self,
        class: Option<ModelSizeClass>,
        seq_len: u32,
        available_bytes: u64,
        cap: u32,
    ) -> u32 {
        let per_sample = Self::per_sample_bytes(class, seq_len);
        let raw = (available_bytes / per_sample.max(1)) as u32;
        snap_batch(raw).min(cap.max(1))
    }

    /// Record an observed sample for future policy refinement
    pub fn record_sample(&self, model_id: &str, sample: PerfSample) {
        let key = ConfigKey {
            model_id: model_id.to_string(),
            batch_size: sample.batch_size,
        };
        let mut histories = self.histories.lock();
        let history = histories.entry(key).or_default();
        history.push_back(sample);
        if history.len() > HISTORY_KEEP {
            while history.len() > HISTORY_TRUNCATE_TO {
                history.pop_front();
            }
        }
    }

    /// Mean efficiency observed for a config, if any samples exist
    pub fn mean_efficiency(&self, model_id: &str, batch_size: u32) -> Option<f64> {
        let key = ConfigKey {
            model_id: model_id.to_string(),
            batch_size,
        };
        let histories = self.histories.lock();
        let history = histories.get(&key)?;
        if history.is_empty() {
            return None;
        }
        Some(history.iter().map(|s| s.efficiency).sum::<f64>() / history.len() as f64)
    }
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest power of two or multiple of eight not exceeding `raw`, min 1
fn snap_batch(raw: u32) -> u32 {
    if raw <= 1 {
        return 1;
    }
    let pow2 = 1u32 << (31 - raw.leading_zeros());
    let mult8 = (raw / 8) * 8;
    pow2.max(mult8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_batch() {
        assert_eq!(snap_batch(0), 1);
        assert_eq!(snap_batch(1), 1);
        assert_eq!(snap_batch(3), 2);
        assert_eq!(snap_batch(7), 4);
        assert_eq!(snap_batch(9), 8);
        assert_eq!(snap_batch(20), 16);
        assert_eq!(snap_batch(25), 24); // multiple of 8 beats power of two
        assert_eq!(snap_batch(33), 32);
        assert_eq!(snap_batch(47), 40);
    }

    #[test]
    fn test_plan_scales_with_memory() {
        let planner = BatchPlanner::new();
        // Small model, 512-token sequences: 128 MB per sample.
        let per_sample = 256 * 1024 * 512u64;
        let batch = planner.plan_batch(Some(ModelSizeClass::Small), 512, per_sample * 9, 64);
        assert_eq!(batch, 8);

        let one = planner.plan_batch(Some(ModelSizeClass::Small), 512, per_sample / 2, 64);
        assert_eq!(one, 1);
    }

    #[test]
    fn test_cap_applies() {
        let planner = BatchPlanner::new();
        let batch = planner.plan_batch(Some(ModelSizeClass::Small), 16, u64::MAX / 2, 8);
        assert_eq!(batch, 8);
    }

    #[test]
    fn test_fallback_heuristic_when_class_unknown() {
        let planner = BatchPlanner::new();
        let available = FALLBACK_BYTES_PER_TOKEN * 256 * 3;
        assert_eq!(planner.plan_batch(None, 256, available, 64), 2);
    }

    #[test]
    fn test_size_class_from_footprint() {
        const GB: u64 = 1024 * 1024 * 1024;
        assert_eq!(
            ModelSizeClass::from_footprint_bytes(4 * GB),
            ModelSizeClass::Small
        );
        assert_eq!(
            ModelSizeClass::from_footprint_bytes(13 * GB),
            ModelSizeClass::Medium
        );
        assert_eq!(
            ModelSizeClass::from_footprint_bytes(40 * GB),
            ModelSizeClass::Large
        );
    }

    #[test]
    fn test_history_truncation() {
        let planner = BatchPlanner::new();
        for i in 0..HISTORY_KEEP + 1 {
            planner.record_sample(
                "m",
                PerfSample {
                    batch_size: 8,
                    throughput_tokens_per_s: i as f64,
                    latency_ms: 10.0,
                    efficiency: i as f64 / 8.0,
                },
            );
        }
        let histories = planner.histories.lock();
        let history = histories
            .get(&ConfigKey {
                model_id: "m".into(),
                batch_size: 8,
            })
            .unwrap();
        assert_eq!(history.len(), HISTORY_TRUNCATE_TO);
        // Truncation drops the oldest samples.
        assert_eq!(history.front().unwrap().throughput_tokens_per_s, 51.0);
    }

    #[test]
    fn test_mean_efficiency() {
        let planner = BatchPlanner::new();
        assert!(planner.mean_efficiency("m", 8).is_none());
        for efficiency in [1.0, 2.0, 3.0] {
            planner.record_sample(
                "m",
                PerfSample {
                    batch_size: 8,
                    throughput_tokens_per_s: 0.0,
                    latency_ms: 0.0,
                    efficiency,
                },
            );
        }
        assert!((planner.mean_efficiency("m", 8).unwrap() - 2.0).abs() < f64::EPSILON);
    }
}
