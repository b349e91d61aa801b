//! Model registry: residency state machine and load orchestration

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::models::descriptor::{ModelConfig, ModelDescriptor, ModelInfo, ResidencyState};
use crate::models::handle::{ModelHandle, ModelLoader};

/// Estimated in-memory overhead over the on-disk model size
const FOOTPRINT_OVERHEAD: f64 = 1.2;

/// Registry errors
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("unknown model alias: {0}")]
    UnknownAlias(String),

    #[error("model path does not exist: {0}")]
    PathMissing(String),

    #[error("alias already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid transition for {alias}: {from} -> {to}")]
    InvalidTransition {
        alias: String,
        from: String,
        to: String,
    },

    #[error("load failed for {alias}: {message}")]
    LoadFailed { alias: String, message: String },
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Guard holding a model in use; eviction is blocked while any lease lives
pub struct ModelLease {
    counter: Arc<AtomicUsize>,
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tracks descriptors, their residency, and the live handles
pub struct ModelRegistry {
    descriptors: RwLock<HashMap<String, ModelDescriptor>>,
    handles: RwLock<HashMap<String, Arc<dyn ModelHandle>>>,
    loader: Arc<dyn ModelLoader>,
    /// Bumped on every state change; waiters watch this
    changed_tx: watch::Sender<u64>,
    changed_rx: watch::Receiver<u64>,
    background_tx: mpsc::UnboundedSender<String>,
    background_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ModelRegistry {
    /// Create a registry using `loader` to materialize handles
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let (changed_tx, changed_rx) = watch::channel(0u64);
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        Self {
            descriptors: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            loader,
            changed_tx,
            changed_rx,
            background_tx,
            background_rx: parking_lot::Mutex::new(Some(background_rx)),
        }
    }

    fn notify(&self) {
        self.changed_tx.send_modify(|v| *v += 1);
    }

    /// Register a model; the path must exist
    pub fn register(
        &self,
        alias: &str,
        path: impl Into<PathBuf>,
        config: ModelConfig,
    ) -> RegistryResult<()> {
        let path = path.into();
        if !path.exists() {
            return Err(RegistryError::PathMissing(path.display().to_string()));
        }
        let mut descriptors = self.descriptors.write();
        if descriptors.contains_key(alias) {
            return Err(RegistryError::AlreadyRegistered(alias.to_string()));
        }
        descriptors.insert(
            alias.to_string(),
            ModelDescriptor::new(alias, path, config),
        );
        tracing::info!(alias, "model registered");
        Ok(())
    }

    /// Current state of a descriptor
    pub fn state(&self, alias: &str) -> Option<ResidencyState> {
        self.descriptors.read().get(alias).map(|d| d.state.clone())
    }

    /// Whether an alias is registered
    pub fn contains(&self, alias: &str) -> bool {
        self.descriptors.read().contains_key(alias)
    }

    /// Count of descriptors holding residency (Loading or Loaded)
    pub fn occupancy(&self) -> usize {
        self.descriptors
            .read()
            .values()
            .filter(|d| d.state.is_resident())
            .count()
    }

    /// Aliases currently Loaded
    pub fn loaded_aliases(&self) -> Vec<String> {
        self.descriptors
            .read()
            .values()
            .filter(|d| d.state == ResidencyState::Loaded)
            .map(|d| d.alias.clone())
            .collect()
    }

    /// Serializable descriptor views for the status payload
    pub fn list(&self) -> Vec<ModelInfo> {
        self.descriptors.read().values().map(ModelInfo::from).collect()
    }

    /// Declared transformer shape, when the descriptor carries one
    pub fn shape_of(&self, alias: &str) -> Option<crate::optimizer::ModelShape> {
        self.descriptors.read().get(alias).and_then(|d| d.config.shape)
    }

    /// Measured or estimated footprint of a loaded model
    pub fn footprint_of(&self, alias: &str) -> Option<u64> {
        self.descriptors.read().get(alias).and_then(|d| d.footprint_bytes)
    }

    /// Load a model into memory, waiting out concurrent transitions
    ///
    /// Returns once the descriptor is Loaded, or fails leaving it in Error.
    /// Residency-bound enforcement is the scheduler's job; the registry
    /// performs the transition it is asked for.
    pub async fn load(&self, alias: &str) -> RegistryResult<()> {
        enum Action {
            Done,
            Wait,
            Load(PathBuf),
        }

        loop {
            let mut rx = self.changed_rx.clone();
            let action = {
                let mut descriptors = self.descriptors.write();
                let descriptor = descriptors
                    .get_mut(alias)
                    .ok_or_else(|| RegistryError::UnknownAlias(alias.to_string()))?;
                match &descriptor.state {
                    ResidencyState::Loaded => Action::Done,
                    ResidencyState::Loading | ResidencyState::Unloading => Action::Wait,
                    ResidencyState::Unloaded | ResidencyState::Error(_) => {
                        descriptor.state = ResidencyState::Loading;
                        Action::Load(descriptor.path.clone())
                    }
                }
            };

            match action {
                Action::Done => return Ok(()),
                Action::Wait => {
                    let _ = rx.changed().await;
                    // Another task finished its transition; re-evaluate. If
                    // it failed, this attempt takes over from Error.
                    if matches!(self.state(alias), Some(ResidencyState::Error(_))) {
                        continue;
                    }
                    if matches!(self.state(alias), Some(ResidencyState::Loaded)) {
                        return Ok(());
                    }
                }
                Action::Load(path) => {
                    self.notify();
                    return self.run_load(alias, path).await;
                }
            }
        }
    }

    async fn run_load(&self, alias: &str, path: PathBuf) -> RegistryResult<()> {
        let started = Instant::now();
        let outcome = self.loader.load(alias, &path).await;
        let mut descriptors = self.descriptors.write();
        let descriptor = descriptors
            .get_mut(alias)
            .ok_or_else(|| RegistryError::UnknownAlias(alias.to_string()))?;

        match outcome {
            Ok(handle) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                descriptor.state = ResidencyState::Loaded;
                descriptor.loaded_at = Some(Instant::now());
                descriptor.load_duration_ms = Some(elapsed_ms);
                descriptor.last_used = Some(Instant::now());
                descriptor.footprint_bytes = handle.footprint_bytes().or_else(|| {
                    std::fs::metadata(&path)
                        .ok()
                        .map(|m| (m.len() as f64 * FOOTPRINT_OVERHEAD) as u64)
                });
                self.handles.write().insert(alias.to_string(), handle);
                drop(descriptors);
                self.notify();
                tracing::info!(alias, elapsed_ms, "model loaded");
                Ok(())
            }
            Err(err) => {
                descriptor.state = ResidencyState::Error(err.to_string());
                drop(descriptors);
                self.notify();
                tracing::error!(alias, error = %err, "model load failed");
                Err(RegistryError::LoadFailed {
                    alias: alias.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Unload a model, releasing its handle
    ///
    /// Legal from Loaded and, as operator recovery, from Error. Refused
    /// while generations hold the model in use.
    pub fn unload(&self, alias: &str) -> RegistryResult<()> {
        let mut descriptors = self.descriptors.write();
        let descriptor = descriptors
            .get_mut(alias)
            .ok_or_else(|| RegistryError::UnknownAlias(alias.to_string()))?;

        match &descriptor.state {
            ResidencyState::Loaded => {
                if descriptor.in_use.load(Ordering::SeqCst) > 0 {
                    return Err(RegistryError::InvalidTransition {
                        alias: alias.to_string(),
                        from: "loaded(in-use)".into(),
                        to: "unloading".into(),
                    });
                }
                descriptor.state = ResidencyState::Unloading;
                self.handles.write().remove(alias);
                descriptor.state = ResidencyState::Unloaded;
                descriptor.loaded_at = None;
                descriptor.footprint_bytes = None;
                descriptor.last_used = None;
                drop(descriptors);
                self.notify();
                tracing::info!(alias, "model unloaded");
                Ok(())
            }
            ResidencyState::Error(_) => {
                descriptor.state = ResidencyState::Unloaded;
                drop(descriptors);
                self.notify();
                Ok(())
            }
            other => Err(RegistryError::InvalidTransition {
                alias: alias.to_string(),
                from: other.name().into(),
                to: "unloading".into(),
            }),
        }
    }

    /// Refresh last-used; a no-op unless Loaded
    pub fn touch(&self, alias: &str) {
        let mut descriptors = self.descriptors.write();
        if let Some(descriptor) = descriptors.get_mut(alias) {
            if descriptor.state == ResidencyState::Loaded {
                descriptor.last_used = Some(Instant::now());
            }
        }
    }

    /// The live handle for a Loaded model
    pub fn handle(&self, alias: &str) -> Option<Arc<dyn ModelHandle>> {
        self.handles.read().get(alias).cloned()
    }

    /// Mark a model in use for the duration of the returned lease
    pub fn lease(&self, alias: &str) -> Option<ModelLease> {
        let descriptors = self.descriptors.read();
        let descriptor = descriptors.get(alias)?;
        if descriptor.state != ResidencyState::Loaded {
            return None;
        }
        descriptor.in_use.fetch_add(1, Ordering::SeqCst);
        Some(ModelLease {
            counter: Arc::clone(&descriptor.in_use),
        })
    }

    /// Least-recently-used Loaded model eligible for eviction
    ///
    /// Skips `exclude` and anything currently in use.
    pub fn lru_candidate(&self, exclude: &str) -> Option<String> {
        self.descriptors
            .read()
            .values()
            .filter(|d| {
                d.alias != exclude
                    && d.state == ResidencyState::Loaded
                    && d.in_use.load(Ordering::SeqCst) == 0
            })
            .min_by_key(|d| d.last_used)
            .map(|d| d.alias.clone())
    }

    /// Fold one generation's duration into the model's rolling stats
    pub fn record_generation(&self, alias: &str, elapsed_ms: u64) {
        let mut descriptors = self.descriptors.write();
        if let Some(descriptor) = descriptors.get_mut(alias) {
            descriptor.gen_stats.record(elapsed_ms);
            if descriptor.state == ResidencyState::Loaded {
                descriptor.last_used = Some(Instant::now());
            }
        }
    }

    /// Queue a background load; the worker drains FIFO
    pub fn request_load(&self, alias: &str) {
        let _ = self.background_tx.send(alias.to_string());
    }

    /// Spawn the single worker draining the background load queue
    ///
    /// Aliases already Loaded or Loading are skipped. Panics if called
    /// twice.
    pub fn spawn_background_loader(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self
            .background_rx
            .lock()
            .take()
            .expect("background loader already running");
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(alias) = rx.recv().await {
                match registry.state(&alias) {
                    Some(ResidencyState::Loaded) | Some(ResidencyState::Loading) => continue,
                    None => continue,
                    _ => {}
                }
                if let Err(err) = registry.load(&alias).await {
                    tracing::warn!(alias, error = %err, "background load failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::handle::SimulatedLoader;
    use std::time::Duration;

    fn model_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"weights").unwrap();
        path
    }

    fn registry(loader: SimulatedLoader) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new(Arc::new(loader)))
    }

    #[tokio::test]
    async fn test_register_requires_existing_path() {
        let registry = registry(SimulatedLoader::instant());
        let err = registry
            .register("ghost", "/nonexistent/model.gguf", ModelConfig::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::PathMissing(_)));
    }

    #[tokio::test]
    async fn test_load_unload_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(SimulatedLoader::instant());
        registry
            .register("mA", model_file(&dir, "a.gguf"), ModelConfig::default())
            .unwrap();
        assert_eq!(registry.state("mA"), Some(ResidencyState::Unloaded));

        registry.load("mA").await.unwrap();
        assert_eq!(registry.state("mA"), Some(ResidencyState::Loaded));
        assert_eq!(registry.occupancy(), 1);
        assert!(registry.handle("mA").is_some());

        registry.unload("mA").unwrap();
        assert_eq!(registry.state("mA"), Some(ResidencyState::Unloaded));
        assert_eq!(registry.occupancy(), 0);
        assert!(registry.handle("mA").is_none());
    }

    #[tokio::test]
    async fn test_load_failure_poisons_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(SimulatedLoader::instant().failing("mBad"));
        registry
            .register("mBad", model_file(&dir, "bad.gguf"), ModelConfig::default())
            .unwrap();

        assert!(registry.load("mBad").await.is_err());
        assert!(matches!(
            registry.state("mBad"),
            Some(ResidencyState::Error(_))
        ));

        // Recovery path: Error -> Unloaded via unload.
        registry.unload("mBad").unwrap();
        assert_eq!(registry.state("mBad"), Some(ResidencyState::Unloaded));
    }

    #[tokio::test]
    async fn test_touch_only_when_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(SimulatedLoader::instant());
        registry
            .register("mA", model_file(&dir, "a.gguf"), ModelConfig::default())
            .unwrap();

        registry.touch("mA");
        assert!(registry.descriptors.read().get("mA").unwrap().last_used.is_none());

        registry.load("mA").await.unwrap();
        registry.touch("mA");
        assert!(registry.descriptors.read().get("mA").unwrap().last_used.is_some());
    }

    #[tokio::test]
    async fn test_lease_blocks_unload_and_lru() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(SimulatedLoader::instant());
        registry
            .register("mA", model_file(&dir, "a.gguf"), ModelConfig::default())
            .unwrap();
        registry.load("mA").await.unwrap();

        let lease = registry.lease("mA").unwrap();
        assert!(registry.unload("mA").is_err());
        assert!(registry.lru_candidate("other").is_none());

        drop(lease);
        assert_eq!(registry.lru_candidate("other"), Some("mA".to_string()));
        registry.unload("mA").unwrap();
    }

    #[tokio::test]
    async fn test_lru_candidate_orders_by_last_use() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(SimulatedLoader::instant());
        for alias in ["mA", "mB"] {
            registry
                .register(
                    alias,
                    model_file(&dir, &format!("{}.gguf", alias)),
                    ModelConfig::default(),
                )
                .unwrap();
            registry.load(alias).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(2)).await;
        registry.touch("mA");

        assert_eq!(registry.lru_candidate(""), Some("mB".to_string()));
        assert_eq!(registry.lru_candidate("mB"), Some("mA".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_loads_settle_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(SimulatedLoader::new(
            Duration::from_millis(20),
            Duration::ZERO,
        ));
        registry
            .register("mA", model_file(&dir, "a.gguf"), ModelConfig::default())
            .unwrap();

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.load("mA").await })
        };
        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.load("mA").await })
        };

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(registry.occupancy(), 1);
    }

    #[tokio::test]
    async fn test_background_loader_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(SimulatedLoader::instant());
        for alias in ["mA", "mB"] {
            registry
                .register(
                    alias,
                    model_file(&dir, &format!("{}.gguf", alias)),
                    ModelConfig::default(),
                )
                .unwrap();
        }

        let worker = registry.spawn_background_loader();
        registry.request_load("mA");
        registry.request_load("mB");
        registry.request_load("mA"); // duplicate, skipped once loaded

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if registry.loaded_aliases().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("background loads did not finish");
        worker.abort();
    }
}
