//! Dispatch loop: residency enforcement, deadlines, and generation hand-off

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::models::{ModelHandle, ModelRegistry, ResidencyState};
use crate::scheduling::queue::{RequestQueue, Responder, Submission};
use crate::scheduling::request::{
    CancelToken, FinishReason, GenerationRequest, GenerationResult,
};
use crate::scheduling::{SchedulerError, SchedulerResult};
use crate::streaming::{MetadataFrame, StreamingCore, TokenFrame};

/// Tokens between periodic metadata frames on a stream
const METADATA_EVERY: u64 = 10;
/// Retry spacing when a stream queue is full or residency is contended
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Terminal notification for every request, successful or not
///
/// The controller consumes these for metrics and cache population.
pub struct CompletionEvent {
    pub request_id: String,
    pub model_id: Option<String>,
    /// Present only when the result should be cached
    pub cache_key: Option<String>,
    pub result: SchedulerResult<GenerationResult>,
}

/// Cooperative dispatcher over the admission queue
///
/// A single loop pops requests in priority order and settles model
/// residency inline (evicting by LRU at the bound); generations then run on
/// their own tasks, gated by the inference-thread semaphore.
pub struct Scheduler {
    queue: Arc<RequestQueue>,
    registry: Arc<ModelRegistry>,
    streaming: Arc<StreamingCore>,
    max_resident: usize,
    default_model: RwLock<Option<String>>,
    cancels: DashMap<String, CancelToken>,
    inference_permits: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<CompletionEvent>,
    active: AtomicUsize,
}

impl Scheduler {
    /// Wire a scheduler over its collaborators
    pub fn new(
        queue: Arc<RequestQueue>,
        registry: Arc<ModelRegistry>,
        streaming: Arc<StreamingCore>,
        max_resident: usize,
        inference_threads: usize,
        completions: mpsc::UnboundedSender<CompletionEvent>,
    ) -> Self {
        Self {
            queue,
            registry,
            streaming,
            max_resident: max_resident.max(1),
            default_model: RwLock::new(None),
            cancels: DashMap::new(),
            inference_permits: Arc::new(Semaphore::new(inference_threads.max(1))),
            completions,
            active: AtomicUsize::new(0),
        }
    }

    /// Admit a submission; never blocks
    pub fn submit(&self, submission: Submission) -> SchedulerResult<()> {
        let id = submission.request.id.clone();
        self.cancels.insert(id.clone(), submission.cancel.clone());
        if let Err(err) = self.queue.push(submission) {
            self.cancels.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Cancel a request wherever it currently is
    ///
    /// True only when this call flipped the token: queued requests are
    /// skipped at pop, running ones stop at the next safe boundary. A
    /// request already finished (or already cancelled) returns false.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.cancels.get(request_id) {
            Some(token) => token.cancel(),
            None => false,
        }
    }

    /// Model used when a request names none
    pub fn set_default_model(&self, alias: &str) {
        *self.default_model.write() = Some(alias.to_string());
    }

    /// Currently configured default model
    pub fn default_model(&self) -> Option<String> {
        self.default_model.read().clone()
    }

    /// Requests waiting for dispatch
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Generations currently running
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The dispatch loop; exits when `shutdown` flips true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.queue.wait_nonempty() => {
                    while let Some(submission) = self.queue.pop() {
                        if *shutdown.borrow() {
                            self.fail(submission, SchedulerError::Cancelled);
                            continue;
                        }
                        self.dispatch_one(submission).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.drain_cancelled();
    }

    /// Fail everything still queued with `Cancelled`; used at shutdown
    pub fn drain_cancelled(&self) {
        while let Some(submission) = self.queue.pop() {
            self.fail(submission, SchedulerError::Cancelled);
        }
    }

    async fn dispatch_one(self: &Arc<Self>, submission: Submission) {
        if submission.cancel.is_cancelled() {
            self.fail(submission, SchedulerError::Cancelled);
            return;
        }

        let queue_wait = submission.request.submitted_at.elapsed();
        if let Some(deadline) = submission.request.deadline {
            if queue_wait > deadline {
                self.fail(submission, SchedulerError::DeadlineExceeded);
                return;
            }
        }

        let alias = match submission
            .request
            .model
            .clone()
            .or_else(|| self.default_model())
        {
            Some(alias) => alias,
            None => {
                self.fail(submission, SchedulerError::NoModelAvailable);
                return;
            }
        };

        if let Err(err) = self.ensure_resident(&alias, &submission.cancel).await {
            self.fail(submission, err);
            return;
        }

        let (lease, handle) = match (self.registry.lease(&alias), self.registry.handle(&alias)) {
            (Some(lease), Some(handle)) => (lease, handle),
            _ => {
                self.fail(submission, SchedulerError::ModelNotReady(alias));
                return;
            }
        };

        let permit = match Arc::clone(&self.inference_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.fail(submission, SchedulerError::Internal("scheduler stopping".into()));
                return;
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let scheduler = Arc::clone(self);
        let queue_wait_ms = queue_wait.as_millis() as u64;
        tokio::spawn(async move {
            let Submission {
                request,
                cancel,
                responder,
                cache_key,
                plan,
            } = submission;
            if let Some(plan) = &plan {
                tracing::debug!(
                    request_id = %request.id,
                    batch = plan.effective_batch_size,
                    kv_compression = plan.kv_plan.compression,
                    "dispatching with plan"
                );
            }
            scheduler
                .run_generation(request, cancel, responder, cache_key, alias, handle, queue_wait_ms)
                .await;
            drop(lease);
            drop(permit);
            scheduler.active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Foreground load path: settle `alias` into Loaded state under the
    /// same residency enforcement the dispatch loop applies
    pub async fn ensure_model(&self, alias: &str) -> SchedulerResult<()> {
        self.ensure_resident(alias, &CancelToken::new()).await
    }

    /// Settle the target model into Loaded state, evicting by LRU when the
    /// residency bound is reached
    async fn ensure_resident(
        &self,
        alias: &str,
        cancel: &CancelToken,
    ) -> SchedulerResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            match self.registry.state(alias) {
                None => return Err(SchedulerError::UnknownModel(alias.to_string())),
                Some(ResidencyState::Loaded) => {
                    self.registry.touch(alias);
                    return Ok(());
                }
                Some(ResidencyState::Loading) | Some(ResidencyState::Unloading) => {
                    // Wait the in-flight transition out, then re-evaluate.
                    if self.registry.load(alias).await.is_err() {
                        return Err(SchedulerError::ModelNotReady(alias.to_string()));
                    }
                }
                Some(ResidencyState::Unloaded) | Some(ResidencyState::Error(_)) => {
                    while self.registry.occupancy() >= self.max_resident {
                        if cancel.is_cancelled() {
                            return Err(SchedulerError::Cancelled);
                        }
                        match self.registry.lru_candidate(alias) {
                            Some(victim) => {
                                if self.registry.unload(&victim).is_ok() {
                                    tracing::info!(
                                        victim = %victim,
                                        target = alias,
                                        "evicted least recently used model"
                                    );
                                }
                            }
                            None => {
                                // Every resident model is mid-generation;
                                // yield until a lease drops.
                                tokio::time::sleep(RETRY_DELAY).await;
                            }
                        }
                    }
                    self.registry.load(alias).await.map_err(|err| {
                        tracing::warn!(alias, error = %err, "model load failed during dispatch");
                        SchedulerError::ModelNotReady(alias.to_string())
                    })?;
                    return Ok(());
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_generation(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
        responder: Responder,
        cache_key: Option<String>,
        alias: String,
        handle: Arc<dyn ModelHandle>,
        queue_wait_ms: u64,
    ) {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::channel::<String>(64);

        let generation = {
            let handle = Arc::clone(&handle);
            let prompt = request.prompt.clone();
            let params = request.params.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handle.generate(&prompt, &params, cancel, tx).await })
        };

        let stream_id = match &responder {
            Responder::Stream { connection_id } => Some(connection_id.clone()),
            Responder::Complete(_) => None,
        };

        let mut text = String::new();
        let mut index: u64 = 0;
        while let Some(piece) = rx.recv().await {
            text.push_str(&piece);
            if let Some(conn) = &stream_id {
                let frame = TokenFrame::new(piece, index);
                // Bounded queue: retry the enqueue until the consumer makes
                // room, giving up on cancellation or a vanished connection.
                while !self.streaming.send_token(conn, frame.clone()).await {
                    if cancel.is_cancelled() || self.streaming.connection(conn).is_none() {
                        break;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }

                if (index + 1) % METADATA_EVERY == 0 {
                    let elapsed = started.elapsed();
                    let _ = self
                        .streaming
                        .send_metadata(
                            conn,
                            MetadataFrame {
                                stream_id: conn.clone(),
                                request_id: request.id.clone(),
                                model_id: alias.clone(),
                                total_tokens: index + 1,
                                tokens_per_second: (index + 1) as f64
                                    / elapsed.as_secs_f64().max(f64::EPSILON),
                                latency_ms: elapsed.as_millis() as f64,
                            },
                        )
                        .await;
                }
            }
            index += 1;
        }

        let finish = match generation.await {
            Ok(Ok(reason)) => reason,
            Ok(Err(err)) => {
                tracing::error!(request_id = %request.id, error = %err, "generation failed");
                FinishReason::Error
            }
            Err(join_err) => {
                tracing::error!(request_id = %request.id, error = %join_err, "generation task panicked");
                FinishReason::Error
            }
        };
        let finish = if cancel.is_cancelled() && finish != FinishReason::Error {
            FinishReason::Cancelled
        } else {
            finish
        };

        let processing_ms = started.elapsed().as_millis() as u64;
        if let Some(conn) = &stream_id {
            let mut terminal = TokenFrame::new("", index).with_finish(finish.as_str());
            terminal.is_special = true;
            let _ = self.streaming.send_token(conn, terminal).await;
            self.streaming.close(conn, finish.as_str(), None);
        }

        self.registry.record_generation(&alias, processing_ms);

        let result = GenerationResult {
            request_id: request.id.clone(),
            model_id: alias.clone(),
            text,
            token_count: index as u32,
            queue_wait_ms,
            processing_ms,
            cache_hit: false,
            finish_reason: finish,
        };

        let outcome = match finish {
            FinishReason::Error => Err(SchedulerError::Internal(
                "generation terminated with error".into(),
            )),
            _ => Ok(result),
        };

        if let Responder::Complete(tx) = responder {
            let _ = tx.send(outcome.clone());
        }
        let cacheable = matches!(finish, FinishReason::Stop | FinishReason::Length);
        let _ = self.completions.send(CompletionEvent {
            request_id: request.id.clone(),
            model_id: Some(alias),
            cache_key: if cacheable { cache_key } else { None },
            result: outcome,
        });
        self.cancels.remove(&request.id);
    }

    fn fail(&self, submission: Submission, err: SchedulerError) {
        let Submission {
            request,
            responder,
            ..
        } = submission;
        match responder {
            Responder::Complete(tx) => {
                let _ = tx.send(Err(err.clone()));
            }
            Responder::Stream { connection_id } => {
                let reason = if matches!(err, SchedulerError::Cancelled) {
                    "cancelled"
                } else {
                    "error"
                };
                self.streaming.close(&connection_id, reason, Some(err.to_string()));
            }
        }
        let _ = self.completions.send(CompletionEvent {
            request_id: request.id.clone(),
            model_id: None,
            cache_key: None,
            result: Err(err),
        });
        self.cancels.remove(&request.id);
    }
}
