//! Request admission, prioritization, and dispatch
//!
//! This module provides:
//! - Request/result types and cooperative cancellation tokens
//! - A bounded priority queue (class first, submission order within class)
//! - The dispatch loop: residency enforcement with LRU eviction, deadline
//!   checks, and hand-off to the model handle

pub mod dispatcher;
pub mod queue;
pub mod request;

use thiserror::Error;

pub use dispatcher::{CompletionEvent, Scheduler};
pub use queue::{RequestQueue, Responder, Submission};
pub use request::{
    CancelToken, FinishReason, GenerationParams, GenerationRequest, GenerationResult, Priority,
    SubmitPayload,
};

/// Scheduler errors
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("queue full: capacity {0} reached")]
    QueueFull(usize),

    #[error("queue-wait deadline exceeded")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,

    #[error("no model specified and no default loaded")]
    NoModelAvailable,

    #[error("unknown model alias: {0}")]
    UnknownModel(String),

    #[error("model not ready: {0}")]
    ModelNotReady(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("scheduler internal error: {0}")]
    Internal(String),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
