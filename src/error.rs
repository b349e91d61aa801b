//! Unified error taxonomy for the inference runtime
//!
//! Subsystems carry their own error enums; everything that crosses the
//! controller boundary is normalized into [`RuntimeError`] so callers see a
//! single, stable set of error kinds regardless of which component failed.

use thiserror::Error;

use crate::cache::CacheError;
use crate::memory::PoolError;
use crate::models::RegistryError;
use crate::scheduling::SchedulerError;
use crate::streaming::StreamError;
use crate::vector::VectorStoreError;

/// Caller-facing error kinds surfaced by the runtime API
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("queue full: capacity {0} reached")]
    QueueFull(usize),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("model not ready: {0}")]
    ModelNotReady(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error [{trace_id}]: {message}")]
    Internal { message: String, trace_id: String },
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    /// Wrap an unexpected failure with a fresh opaque trace id
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            trace_id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
        }
    }
}

impl From<PoolError> for RuntimeError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfCapacity { .. } => Self::ResourceExhausted(err.to_string()),
            PoolError::InvalidSize(_) => Self::InvalidArgument(err.to_string()),
        }
    }
}

impl From<CacheError> for RuntimeError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::EntryTooLarge { .. } => Self::ResourceExhausted(err.to_string()),
            CacheError::Serialization(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<RegistryError> for RuntimeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownAlias(alias) => Self::NotFound(alias),
            RegistryError::PathMissing(_) | RegistryError::AlreadyRegistered(_) => {
                Self::InvalidArgument(err.to_string())
            }
            RegistryError::InvalidTransition { .. } => Self::internal(err.to_string()),
            RegistryError::LoadFailed { alias, .. } => Self::ModelNotReady(alias),
        }
    }
}

impl From<SchedulerError> for RuntimeError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::QueueFull(cap) => Self::QueueFull(cap),
            SchedulerError::DeadlineExceeded => Self::DeadlineExceeded,
            SchedulerError::Cancelled => Self::Cancelled,
            SchedulerError::NoModelAvailable => {
                Self::InvalidArgument("no model specified and no default loaded".into())
            }
            SchedulerError::UnknownModel(alias) => Self::NotFound(alias),
            SchedulerError::ModelNotReady(alias) => Self::ModelNotReady(alias),
            SchedulerError::InvalidRequest(msg) => Self::InvalidArgument(msg),
            SchedulerError::Internal(msg) => Self::internal(msg),
        }
    }
}

impl From<StreamError> for RuntimeError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::UnknownConnection(id) => Self::NotFound(id),
            StreamError::AtCapacity(cap) => Self::ResourceExhausted(format!(
                "connection limit {} reached",
                cap
            )),
            StreamError::Closed(_) | StreamError::Transport(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<VectorStoreError> for RuntimeError {
    fn from(err: VectorStoreError) -> Self {
        match err {
            VectorStoreError::NotFound(id) => Self::NotFound(id),
            VectorStoreError::DimensionMismatch { .. } | VectorStoreError::DuplicateId(_) => {
                Self::InvalidArgument(err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}
