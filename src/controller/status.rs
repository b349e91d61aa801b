//! Status payload types

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;

/// Overall runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Initializing,
    Ready,
    Busy,
    Overloaded,
    Error,
    Shutdown,
}

impl EngineState {
    /// Stable name used in the status payload
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Overloaded => "overloaded",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Rolling performance metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub requests_per_second: f64,
    pub tokens_per_second: f64,
    pub average_latency_ms: f64,
    pub queue_depth: usize,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
}

/// Resource occupancy snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub memory_usage_mb: u64,
    pub active_models: usize,
    pub loaded_models: Vec<String>,
}

/// Full nested status payload returned by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub status: String,
    pub uptime_seconds: u64,
    pub config: RuntimeConfig,
    pub metrics: RuntimeMetrics,
    pub resources: ResourceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_nested() {
        let status = SystemStatus {
            status: EngineState::Ready.name().to_string(),
            uptime_seconds: 12,
            config: RuntimeConfig::default(),
            metrics: RuntimeMetrics {
                queue_depth: 3,
                ..Default::default()
            },
            resources: ResourceStatus {
                memory_usage_mb: 512,
                active_models: 1,
                loaded_models: vec!["mA".into()],
            },
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "ready");
        assert_eq!(value["metrics"]["queue_depth"], 3);
        assert_eq!(value["resources"]["loaded_models"][0], "mA");
        assert_eq!(value["config"]["max_concurrent_models"], 2);
    }
}
