//! The unified controller: lifecycle, API surface, and background workers

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

use crate::cache::{fingerprint, FingerprintCache, FingerprintInputs};
use crate::config::RuntimeConfig;
use crate::controller::status::{EngineState, ResourceStatus, RuntimeMetrics, SystemStatus};
use crate::error::{RuntimeError, RuntimeResult};
use crate::hardware::{HardwareProbe, WorkloadClass};
use crate::memory::MemoryPool;
use crate::models::{ModelConfig, ModelLoader, ModelRegistry};
use crate::optimizer::Optimizer;
use crate::scheduling::dispatcher::CompletionEvent;
use crate::scheduling::queue::{Responder, Submission};
use crate::scheduling::{
    CancelToken, GenerationRequest, GenerationResult, RequestQueue, Scheduler,
};
use crate::streaming::{InternalStream, StreamingConfig, StreamingCore, TokenFrame};

/// Queue-depth fraction above which the runtime reports Overloaded
const OVERLOAD_QUEUE_FRACTION: f64 = 0.8;
/// Poll spacing while waiting out in-flight generations at shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// What `generate` hands back, per the request's stream flag
#[derive(Debug)]
pub enum GenerationResponse {
    /// The full result, available immediately or after completion
    Complete(GenerationResult),
    /// A pull handle yielding frames as the model produces them
    Stream(InternalStream),
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    tokens: AtomicU64,
    latency_ms_total: AtomicU64,
}

/// Long-lived owner of every runtime subsystem
///
/// Construction wires components in dependency order (probe, cache,
/// registry, scheduler, streaming, workers); `shutdown` unwinds in reverse.
/// All API methods are safe to call from any task.
pub struct UnifiedController {
    config: RuntimeConfig,
    probe: Arc<HardwareProbe>,
    cache: Arc<FingerprintCache>,
    cache_degraded: AtomicBool,
    memory_pool: Arc<MemoryPool>,
    registry: Arc<ModelRegistry>,
    scheduler: Arc<Scheduler>,
    streaming: Arc<StreamingCore>,
    optimizer: Arc<Optimizer>,
    queue: Arc<RequestQueue>,
    state: RwLock<EngineState>,
    started_at: Instant,
    counters: Arc<Counters>,
    metrics: Arc<RwLock<RuntimeMetrics>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl UnifiedController {
    /// Bring the runtime up with the given model loader
    pub async fn start(
        config: RuntimeConfig,
        loader: Arc<dyn ModelLoader>,
    ) -> RuntimeResult<Arc<Self>> {
        config.validate()?;

        let probe = Arc::new(HardwareProbe::new());
        let cache = Arc::new(FingerprintCache::new(config.cache_capacity_bytes()));
        let memory_pool = Arc::new(MemoryPool::new(config.memory_pool_mb));
        let registry = Arc::new(ModelRegistry::new(loader));
        let queue = Arc::new(RequestQueue::new(config.max_queue_size));
        let streaming = Arc::new(StreamingCore::new(StreamingConfig {
            max_connections: config.max_connections,
            queue_capacity: config.stream_queue_capacity,
            idle_timeout: config.stream_timeout(),
            ..Default::default()
        }));
        let optimizer = Arc::new(Optimizer::new(
            Arc::clone(&probe),
            config.kv_ceiling_bytes(),
            config.max_batch_size,
        ));

        let inference_threads = probe
            .threading_plan(WorkloadClass::Inference)
            .inference_threads;
        let (completions_tx, completions_rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&streaming),
            config.max_concurrent_models,
            inference_threads,
            completions_tx,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Arc::new(Self {
            config,
            probe,
            cache,
            cache_degraded: AtomicBool::new(false),
            memory_pool,
            registry,
            scheduler,
            streaming,
            optimizer,
            queue,
            state: RwLock::new(EngineState::Initializing),
            started_at: Instant::now(),
            counters: Arc::new(Counters::default()),
            metrics: Arc::new(RwLock::new(RuntimeMetrics::default())),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::new();
        workers.push(tokio::spawn(
            Arc::clone(&controller.scheduler).run(shutdown_rx.clone()),
        ));
        workers.push(controller.registry.spawn_background_loader());
        workers.push(controller.spawn_completion_consumer(completions_rx));
        workers.push(controller.spawn_metrics_worker(shutdown_rx.clone()));
        workers.push(controller.spawn_cleanup_worker(shutdown_rx.clone()));
        if controller.config.auto_optimization {
            workers.push(controller.spawn_auto_optimization_worker(shutdown_rx));
        }
        *controller.workers.lock() = workers;

        *controller.state.write() = EngineState::Ready;
        tracing::info!("inference runtime ready");
        Ok(controller)
    }

    /// Register a model file under an alias
    pub fn register_model(
        &self,
        alias: &str,
        path: impl Into<PathBuf>,
        config: ModelConfig,
    ) -> RuntimeResult<()> {
        self.registry.register(alias, path, config)?;
        Ok(())
    }

    /// Load a model, either inline or via the background queue
    ///
    /// Foreground loads enforce the residency bound, evicting the least
    /// recently used model when necessary. The first successful foreground
    /// load becomes the default model.
    pub async fn load_model(&self, alias: &str, background: bool) -> RuntimeResult<()> {
        if !self.registry.contains(alias) {
            return Err(RuntimeError::NotFound(alias.to_string()));
        }
        if background {
            self.registry.request_load(alias);
            return Ok(());
        }
        self.scheduler.ensure_model(alias).await?;
        if self.scheduler.default_model().is_none() {
            self.scheduler.set_default_model(alias);
        }
        Ok(())
    }

    /// Unload a model, releasing its memory
    pub fn unload_model(&self, alias: &str) -> RuntimeResult<()> {
        self.registry.unload(alias)?;
        Ok(())
    }

    /// Serve one generation request
    ///
    /// The fingerprint cache is consulted first; hits return without
    /// touching the scheduler. Misses are admitted, dispatched in priority
    /// order, and cached on natural completion.
    pub async fn generate(&self, mut request: GenerationRequest) -> RuntimeResult<GenerationResponse> {
        if *self.state.read() == EngineState::Shutdown {
            return Err(RuntimeError::Cancelled);
        }
        request
            .params
            .validate()
            .map_err(RuntimeError::InvalidArgument)?;
        if request.deadline.is_none() {
            request.deadline = Some(self.config.queue_timeout());
        }
        if request.stream && !self.config.enable_streaming {
            return Err(RuntimeError::InvalidArgument(
                "streaming is disabled".into(),
            ));
        }
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let cache_key = self.cache_key_for(&request);
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache_lookup(key, &request) {
                return hit;
            }
        }

        let plan = self.plan_for(&request);
        let cancel = CancelToken::new();
        if request.stream {
            let connection_id = request.id.clone();
            let (_, stream) = self
                .streaming
                .open_internal(&connection_id)
                .map_err(RuntimeError::from)?;
            let submission = Submission {
                responder: Responder::Stream {
                    connection_id: connection_id.clone(),
                },
                request,
                cancel,
                cache_key,
                plan,
            };
            if let Err(err) = self.scheduler.submit(submission) {
                // Roll the connection back so the id is reusable.
                self.streaming.close(&connection_id, "error", None);
                return Err(err.into());
            }
            Ok(GenerationResponse::Stream(stream))
        } else {
            let (tx, rx) = oneshot::channel();
            let submission = Submission {
                responder: Responder::Complete(tx),
                request,
                cancel,
                cache_key,
                plan,
            };
            self.scheduler.submit(submission)?;
            let result = rx
                .await
                .map_err(|_| RuntimeError::internal("scheduler dropped the request"))??;
            Ok(GenerationResponse::Complete(result))
        }
    }

    /// Cancel a request by id; see the scheduler for exact semantics
    pub fn cancel(&self, request_id: &str) -> bool {
        self.scheduler.cancel(request_id)
    }

    /// Assemble the nested status payload
    pub fn status(&self) -> SystemStatus {
        let mut metrics = self.metrics.read().clone();
        metrics.queue_depth = self.queue.depth();
        metrics.cache_hit_rate = self.cache.stats().hit_rate();

        let loaded_models = self.registry.loaded_aliases();
        let model_memory_mb: u64 = self
            .registry
            .list()
            .iter()
            .filter_map(|m| m.footprint_mb)
            .sum();
        let pool_mb = self.memory_pool.stats().pooled_bytes / (1024 * 1024);

        SystemStatus {
            status: self.state.read().name().to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            config: self.config.clone(),
            metrics,
            resources: ResourceStatus {
                memory_usage_mb: model_memory_mb + pool_mb,
                active_models: loaded_models.len(),
                loaded_models,
            },
        }
    }

    /// Whether the cache has been bypassed after a subsystem failure
    pub fn cache_degraded(&self) -> bool {
        self.cache_degraded.load(Ordering::Relaxed)
    }

    /// The hardware probe
    pub fn probe(&self) -> &Arc<HardwareProbe> {
        &self.probe
    }

    /// The optimizer façade
    pub fn optimizer(&self) -> &Arc<Optimizer> {
        &self.optimizer
    }

    /// The pooled byte allocator
    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    /// Invalidate cached results carrying any of `tags`
    pub fn invalidate_cache_tags(&self, tags: &[String]) -> usize {
        self.cache.invalidate_tags(tags)
    }

    /// Drain and stop the runtime
    ///
    /// New submits are refused, queued requests are cancelled, in-flight
    /// generations get `grace` to finish, then streams are force-closed.
    pub async fn shutdown(&self, grace: Duration) {
        *self.state.write() = EngineState::Shutdown;
        let _ = self.shutdown_tx.send(true);
        self.scheduler.drain_cancelled();

        let deadline = Instant::now() + grace;
        while self.scheduler.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        self.streaming.close_all("shutdown");
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        tracing::info!("inference runtime stopped");
    }

    fn plan_for(&self, request: &GenerationRequest) -> Option<crate::optimizer::Plan> {
        let alias = request
            .model
            .clone()
            .or_else(|| self.scheduler.default_model())?;
        let prompt_tokens = request.prompt.split_whitespace().count() as u32;
        Some(self.optimizer.plan(&crate::optimizer::PlanRequest {
            model_id: &alias,
            model_shape: self.registry.shape_of(&alias),
            footprint_bytes: self.registry.footprint_of(&alias),
            sequence_length: prompt_tokens + request.params.max_tokens,
            workload: WorkloadClass::Inference,
        }))
    }

    fn cache_key_for(&self, request: &GenerationRequest) -> Option<String> {
        if !self.config.enable_caching || self.cache_degraded.load(Ordering::Relaxed) {
            return None;
        }
        let model_id = request
            .model
            .clone()
            .or_else(|| self.scheduler.default_model())?;
        Some(fingerprint(&FingerprintInputs {
            prompt: &request.prompt,
            model_id: &model_id,
            max_tokens: request.params.max_tokens,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            top_k: request.params.top_k,
        }))
    }

    fn cache_lookup(
        &self,
        key: &str,
        request: &GenerationRequest,
    ) -> Option<RuntimeResult<GenerationResponse>> {
        let payload = self.cache.get(key)?;
        let mut cached: GenerationResult = match serde_json::from_slice(&payload) {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(error = %err, "cache payload undecodable, bypassing");
                return None;
            }
        };
        cached.request_id = request.id.clone();
        cached.cache_hit = true;
        cached.queue_wait_ms = 0;
        cached.processing_ms = 0;
        tracing::debug!(request_id = %request.id, "fingerprint cache hit");

        if request.stream {
            // Short-circuit into the streaming core: one frame carrying the
            // whole cached text, then a clean close.
            let (connection, stream) = match self.streaming.open_internal(&request.id) {
                Ok(pair) => pair,
                Err(err) => return Some(Err(err.into())),
            };
            let mut frame = TokenFrame::new(cached.text.clone(), 0);
            frame.finish_reason = Some(cached.finish_reason.as_str().to_string());
            connection.send_token(frame);
            self.streaming
                .close(&request.id, cached.finish_reason.as_str(), None);
            Some(Ok(GenerationResponse::Stream(stream)))
        } else {
            Some(Ok(GenerationResponse::Complete(cached)))
        }
    }

    fn spawn_completion_consumer(
        self: &Arc<Self>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<CompletionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match &event.result {
                    Ok(result) => {
                        controller.counters.completed.fetch_add(1, Ordering::Relaxed);
                        controller
                            .counters
                            .tokens
                            .fetch_add(result.token_count as u64, Ordering::Relaxed);
                        controller
                            .counters
                            .latency_ms_total
                            .fetch_add(result.processing_ms, Ordering::Relaxed);

                        if let Some(key) = &event.cache_key {
                            controller.cache_insert(key, result);
                        }
                        if result.processing_ms > 0 && result.token_count > 0 {
                            let throughput = result.token_count as f64
                                / (result.processing_ms as f64 / 1000.0);
                            controller.optimizer.batch_planner().record_sample(
                                &result.model_id,
                                crate::optimizer::PerfSample {
                                    batch_size: 1,
                                    throughput_tokens_per_s: throughput,
                                    latency_ms: result.processing_ms as f64,
                                    efficiency: throughput,
                                },
                            );
                        }
                    }
                    Err(_) => {
                        controller.counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    }

    fn cache_insert(&self, key: &str, result: &GenerationResult) {
        if self.cache_degraded.load(Ordering::Relaxed) {
            return;
        }
        let payload = match serde_json::to_vec(result) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "result not cacheable");
                return;
            }
        };
        let tags = [result.model_id.clone()];
        if let Err(err) = self
            .cache
            .insert(key, payload, Some(self.config.cache_ttl()), tags)
        {
            match err {
                crate::cache::CacheError::EntryTooLarge { .. } => {
                    tracing::debug!("result larger than cache, skipped");
                }
                other => {
                    tracing::error!(error = %other, "cache degraded to bypass");
                    self.cache_degraded.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn spawn_metrics_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let interval = self.config.metrics_interval();
        tokio::spawn(async move {
            let mut last_completed = 0u64;
            let mut last_tokens = 0u64;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }

                let completed = controller.counters.completed.load(Ordering::Relaxed);
                let errors = controller.counters.errors.load(Ordering::Relaxed);
                let requests = controller.counters.requests.load(Ordering::Relaxed);
                let tokens = controller.counters.tokens.load(Ordering::Relaxed);
                let latency_total =
                    controller.counters.latency_ms_total.load(Ordering::Relaxed);
                let secs = interval.as_secs_f64();

                {
                    let mut metrics = controller.metrics.write();
                    metrics.requests_per_second =
                        (completed + errors).saturating_sub(last_completed) as f64 / secs;
                    metrics.tokens_per_second =
                        tokens.saturating_sub(last_tokens) as f64 / secs;
                    metrics.average_latency_ms = if completed > 0 {
                        latency_total as f64 / completed as f64
                    } else {
                        0.0
                    };
                    metrics.queue_depth = controller.queue.depth();
                    metrics.cache_hit_rate = controller.cache.stats().hit_rate();
                    metrics.error_rate = if requests > 0 {
                        errors as f64 / requests as f64
                    } else {
                        0.0
                    };
                }
                last_completed = completed + errors;
                last_tokens = tokens;

                let depth = controller.queue.depth();
                let new_state = if depth as f64
                    > controller.config.max_queue_size as f64 * OVERLOAD_QUEUE_FRACTION
                {
                    EngineState::Overloaded
                } else if controller.scheduler.active_count() > 0 {
                    EngineState::Busy
                } else {
                    EngineState::Ready
                };
                let mut state = controller.state.write();
                if *state != EngineState::Shutdown {
                    *state = new_state;
                }
            }
        })
    }

    fn spawn_cleanup_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
                let swept = controller.streaming.sweep_idle();
                let purged = controller.cache.purge_expired();
                if swept > 0 || purged > 0 {
                    tracing::debug!(swept, purged, "cleanup sweep finished");
                }
            }
        })
    }

    /// Observes metrics and logs advisory decisions; the runtime's bounds
    /// stay static for the controller's lifetime.
    fn spawn_auto_optimization_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let interval = self.config.metrics_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
                let metrics = controller.metrics.read().clone();
                if metrics.queue_depth as f64
                    > controller.config.max_queue_size as f64 * OVERLOAD_QUEUE_FRACTION
                {
                    tracing::info!(
                        queue_depth = metrics.queue_depth,
                        "advisory: sustained queue pressure, consider a larger max_queue_size"
                    );
                }
                if metrics.cache_hit_rate < 0.1 && metrics.requests_per_second > 1.0 {
                    tracing::info!(
                        hit_rate = metrics.cache_hit_rate,
                        "advisory: low cache hit rate under load"
                    );
                }
            }
        })
    }
}
