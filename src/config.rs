//! Runtime configuration
//!
//! Every tunable recognized by the controller lives here with its documented
//! default. Omitted fields take defaults when deserializing from JSON or an
//! environment-derived map; `validate()` rejects values that would wedge the
//! runtime at startup rather than at first use.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RuntimeError, RuntimeResult};

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Maximum number of models simultaneously Loaded or Loading (M_max)
    pub max_concurrent_models: usize,

    /// Upper bound on any planned batch size
    pub max_batch_size: u32,

    /// Request admission queue capacity (Q_req)
    pub max_queue_size: usize,

    /// Fingerprint cache byte ceiling, in megabytes (S_max)
    pub cache_size_mb: u64,

    /// Memory pool allocation ceiling, in megabytes
    pub memory_pool_mb: u64,

    /// KV-cache planning ceiling, in megabytes
    pub kv_cache_mb: u64,

    /// Default queue-wait deadline applied when a request carries none
    pub queue_timeout_seconds: u64,

    /// Idle timeout after which a stream connection is closed
    pub stream_timeout_seconds: u64,

    /// Interval between cleanup sweeps (streams and expired cache entries)
    pub cleanup_interval_seconds: u64,

    /// Interval between metrics recomputations
    pub metrics_update_interval_seconds: u64,

    /// Consult and populate the fingerprint cache around generation
    pub enable_caching: bool,

    /// Allow streaming responses
    pub enable_streaming: bool,

    /// Run the advisory auto-optimization worker
    pub auto_optimization: bool,

    /// Maximum simultaneously open stream connections (C_max)
    pub max_connections: usize,

    /// Per-connection outbound queue capacity (Q)
    pub stream_queue_capacity: usize,

    /// TTL applied to cached generation results
    pub cache_ttl_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_models: 2,
            max_batch_size: 8,
            max_queue_size: 1000,
            cache_size_mb: 2048,
            memory_pool_mb: 1024,
            kv_cache_mb: 1024,
            queue_timeout_seconds: 30,
            stream_timeout_seconds: 300,
            cleanup_interval_seconds: 30,
            metrics_update_interval_seconds: 10,
            enable_caching: true,
            enable_streaming: true,
            auto_optimization: true,
            max_connections: 100,
            stream_queue_capacity: 1000,
            cache_ttl_seconds: 3600,
        }
    }
}

impl RuntimeConfig {
    /// Reject configurations that cannot run
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.max_concurrent_models == 0 {
            return Err(RuntimeError::InvalidArgument(
                "max_concurrent_models must be at least 1".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(RuntimeError::InvalidArgument(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(RuntimeError::InvalidArgument(
                "max_queue_size must be at least 1".into(),
            ));
        }
        if self.cache_size_mb == 0 && self.enable_caching {
            return Err(RuntimeError::InvalidArgument(
                "cache_size_mb must be nonzero when caching is enabled".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(RuntimeError::InvalidArgument(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.stream_queue_capacity == 0 {
            return Err(RuntimeError::InvalidArgument(
                "stream_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Fingerprint cache ceiling in bytes
    pub fn cache_capacity_bytes(&self) -> u64 {
        self.cache_size_mb * 1024 * 1024
    }

    /// KV planning ceiling in bytes
    pub fn kv_ceiling_bytes(&self) -> u64 {
        self.kv_cache_mb * 1024 * 1024
    }

    /// Default queue-wait deadline
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_seconds)
    }

    /// Stream idle timeout
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_seconds)
    }

    /// Cleanup sweep interval
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Metrics recomputation interval
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_update_interval_seconds)
    }

    /// TTL for cached generation results
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_models, 2);
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.cache_capacity_bytes(), 2048 * 1024 * 1024);
    }

    #[test]
    fn test_zero_models_rejected() {
        let config = RuntimeConfig {
            max_concurrent_models: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let parsed: Result<RuntimeConfig, _> =
            serde_json::from_str(r#"{"max_queue_size": 10, "bogus": true}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_omitted_fields_take_defaults() {
        let parsed: RuntimeConfig = serde_json::from_str(r#"{"max_queue_size": 10}"#).unwrap();
        assert_eq!(parsed.max_queue_size, 10);
        assert_eq!(parsed.max_batch_size, 8);
    }
}
