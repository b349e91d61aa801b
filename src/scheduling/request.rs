//! Request, result, and cancellation types

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Request priority classes; higher dispatches first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Decoding parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 1.0,
            top_k: 0,
            stop_sequences: Vec::new(),
        }
    }
}

impl GenerationParams {
    /// Check every parameter range
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tokens == 0 {
            return Err("max_tokens must be at least 1".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("top_p {} outside [0, 1]", self.top_p));
        }
        Ok(())
    }
}

/// A generation request; immutable once admitted
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: String,
    pub prompt: String,
    /// Target model alias; the controller's default applies when absent
    pub model: Option<String>,
    pub params: GenerationParams,
    pub priority: Priority,
    pub stream: bool,
    pub submitted_at: Instant,
    /// Maximum tolerated queue wait
    pub deadline: Option<Duration>,
}

impl GenerationRequest {
    /// Build a request with a fresh id and default parameters
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            model: None,
            params: GenerationParams::default(),
            priority: Priority::Normal,
            stream: false,
            submitted_at: Instant::now(),
            deadline: None,
        }
    }

    /// Target a specific model
    pub fn with_model(mut self, alias: impl Into<String>) -> Self {
        self.model = Some(alias.into());
        self
    }

    /// Override decoding parameters
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Request a token stream instead of a complete response
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Bound the queue wait
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Wire form of a submit request
///
/// Unknown fields are rejected at parse time; omitted decoding parameters
/// take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitPayload {
    pub request_id: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub top_k: u32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub stream: bool,
}

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

impl SubmitPayload {
    /// Materialize the runtime request this payload describes
    pub fn into_request(self) -> GenerationRequest {
        GenerationRequest {
            id: self.request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            prompt: self.prompt,
            model: self.model,
            params: GenerationParams {
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
                stop_sequences: self.stop_sequences,
            },
            priority: self.priority,
            stream: self.stream,
            submitted_at: Instant::now(),
            deadline: None,
        }
    }
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
    Error,
}

impl FinishReason {
    /// Wire-format name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// Outcome of a completed (non-streaming or fully drained) generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub request_id: String,
    /// The model that actually served the request
    pub model_id: String,
    pub text: String,
    pub token_count: u32,
    pub queue_wait_ms: u64,
    pub processing_ms: u64,
    pub cache_hit: bool,
    pub finish_reason: FinishReason,
}

/// Shared cancellation flag checked at every suspension point
///
/// Cancellation is one-way and idempotent: only the first `cancel()`
/// reports having had an effect.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; true when this call flipped it
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::Low as i32, 0);
        assert_eq!(Priority::Critical as i32, 3);
    }

    #[test]
    fn test_params_validation() {
        assert!(GenerationParams::default().validate().is_ok());

        let mut params = GenerationParams::default();
        params.max_tokens = 0;
        assert!(params.validate().is_err());

        let mut params = GenerationParams::default();
        params.temperature = 2.5;
        assert!(params.validate().is_err());

        let mut params = GenerationParams::default();
        params.top_p = -0.1;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_cancel_token_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(token.is_cancelled());
        assert!(!token.cancel(), "second cancel reports no effect");
    }

    #[test]
    fn test_submit_payload_rejects_unknown_fields() {
        let err: Result<SubmitPayload, _> =
            serde_json::from_str(r#"{"prompt": "hi", "bogus": 1}"#);
        assert!(err.is_err());

        let payload: SubmitPayload =
            serde_json::from_str(r#"{"prompt": "hi", "priority": "High", "stream": true}"#)
                .unwrap();
        let request = payload.into_request();
        assert_eq!(request.priority, Priority::High);
        assert!(request.stream);
        assert_eq!(request.params.max_tokens, 256);
    }

    #[test]
    fn test_request_builder() {
        let request = GenerationRequest::new("Summarize.")
            .with_model("mA")
            .with_priority(Priority::High)
            .streaming()
            .with_deadline(Duration::from_secs(5));
        assert_eq!(request.model.as_deref(), Some("mA"));
        assert_eq!(request.priority, Priority::High);
        assert!(request.stream);
        assert!(!request.id.is_empty());
    }
}
