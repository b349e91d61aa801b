//! The opaque model-handle contract and the built-in simulated backend

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::optimizer::ModelShape;
use crate::scheduling::request::{CancelToken, FinishReason, GenerationParams};

/// Model backend errors
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("model file rejected: {0}")]
    InvalidModel(String),
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;

/// Channel end the handle emits token pieces into
pub type TokenSender = mpsc::Sender<String>;

/// An in-memory model able to serve generations
///
/// The runtime treats the execution library as opaque: a handle consumes a
/// prompt and decoding parameters and emits token pieces through `tokens`.
/// Implementations must stop at the next safe boundary once `cancel` is set
/// and must stop emitting if the receiving side goes away.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Run one generation, emitting pieces as they are produced
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancelToken,
        tokens: TokenSender,
    ) -> ModelResult<FinishReason>;

    /// Measured memory footprint, when the backend reports one
    fn footprint_bytes(&self) -> Option<u64> {
        None
    }

    /// Declared transformer dimensions, when the backend reports them
    fn shape(&self) -> Option<ModelShape> {
        None
    }
}

/// Factory turning a registered model file into a live handle
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Load the model at `path` into memory
    async fn load(&self, alias: &str, path: &Path) -> ModelResult<Arc<dyn ModelHandle>>;
}

/// Deterministic in-process model used for tests and smoke runs
///
/// Emits the prompt's words cyclically, one piece per token, with a fixed
/// per-token delay. Runs to `max_tokens` (finish reason `length`) unless a
/// stop sequence matches the accumulated output or the request is
/// cancelled.
pub struct SimulatedModel {
    alias: String,
    token_delay: Duration,
    footprint: Option<u64>,
}

impl SimulatedModel {
    /// Create a simulated model emitting one token every `token_delay`
    pub fn new(alias: impl Into<String>, token_delay: Duration) -> Self {
        Self {
            alias: alias.into(),
            token_delay,
            footprint: None,
        }
    }

    /// Declare a synthetic memory footprint
    pub fn with_footprint(mut self, bytes: u64) -> Self {
        self.footprint = Some(bytes);
        self
    }
}

#[async_trait]
impl ModelHandle for SimulatedModel {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancelToken,
        tokens: TokenSender,
    ) -> ModelResult<FinishReason> {
        tracing::debug!(model = %self.alias, max_tokens = params.max_tokens, "simulated generation");
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let vocabulary: &[&str] = if words.is_empty() {
            &["the", "court", "finds", "as", "follows"]
        } else {
            &words
        };

        let mut emitted = String::new();
        for index in 0..params.max_tokens {
            if cancel.is_cancelled() {
                return Ok(FinishReason::Cancelled);
            }
            if self.token_delay > Duration::ZERO {
                tokio::time::sleep(self.token_delay).await;
            }

            let piece = format!("{} ", vocabulary[index as usize % vocabulary.len()]);
            emitted.push_str(&piece);
            if tokens.send(piece).await.is_err() {
                // Receiver went away; cease at this boundary.
                return Ok(FinishReason::Cancelled);
            }

            if params
                .stop_sequences
                .iter()
                .any(|stop| !stop.is_empty() && emitted.contains(stop))
            {
                return Ok(FinishReason::Stop);
            }
        }
        Ok(FinishReason::Length)
    }

    fn footprint_bytes(&self) -> Option<u64> {
        self.footprint
    }
}

/// Loader producing [`SimulatedModel`] handles
///
/// `fail_aliases` lets tests exercise the load-failure path; everything
/// else loads after `load_delay`.
pub struct SimulatedLoader {
    load_delay: Duration,
    token_delay: Duration,
    fail_aliases: HashSet<String>,
}

impl SimulatedLoader {
    /// Loader with no artificial delays
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Loader with the given load and per-token delays
    pub fn new(load_delay: Duration, token_delay: Duration) -> Self {
        Self {
            load_delay,
            token_delay,
            fail_aliases: HashSet::new(),
        }
    }

    /// Make loading `alias` fail
    pub fn failing(mut self, alias: impl Into<String>) -> Self {
        self.fail_aliases.insert(alias.into());
        self
    }
}

#[async_trait]
impl ModelLoader for SimulatedLoader {
    async fn load(&self, alias: &str, path: &Path) -> ModelResult<Arc<dyn ModelHandle>> {
        if self.load_delay > Duration::ZERO {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.fail_aliases.contains(alias) {
            return Err(ModelError::Backend(format!(
                "simulated load failure for {}",
                alias
            )));
        }
        if !path.exists() {
            return Err(ModelError::InvalidModel(format!(
                "no model file at {}",
                path.display()
            )));
        }
        Ok(Arc::new(SimulatedModel::new(alias, self.token_delay)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_tokens: u32) -> GenerationParams {
        GenerationParams {
            max_tokens,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_runs_to_length() {
        let model = SimulatedModel::new("m", Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(64);
        let reason = model
            .generate("one two three", &params(5), CancelToken::new(), tx)
            .await
            .unwrap();
        assert_eq!(reason, FinishReason::Length);

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_stop_sequence_halts_early() {
        let model = SimulatedModel::new("m", Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(64);
        let mut p = params(50);
        p.stop_sequences = vec!["three".to_string()];
        let reason = model
            .generate("one two three four", &p, CancelToken::new(), tx)
            .await
            .unwrap();
        assert_eq!(reason, FinishReason::Stop);

        let mut pieces = Vec::new();
        while let Some(piece) = rx.recv().await {
            pieces.push(piece);
        }
        assert_eq!(pieces.len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_emission() {
        let model = SimulatedModel::new("m", Duration::from_millis(1));
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancelToken::new();
        cancel.cancel();
        let reason = model
            .generate("word", &params(100), cancel, tx)
            .await
            .unwrap();
        assert_eq!(reason, FinishReason::Cancelled);
    }

    #[tokio::test]
    async fn test_loader_fails_for_configured_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, b"weights").unwrap();

        let loader = SimulatedLoader::instant().failing("bad");
        assert!(loader.load("bad", &path).await.is_err());
        assert!(loader.load("good", &path).await.is_ok());
        assert!(loader
            .load("good", &dir.path().join("missing.gguf"))
            .await
            .is_err());
    }
}
