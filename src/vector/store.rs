//! The vector store: uniform contract over pluggable index backends

use chrono::Utc;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::vector::backend::{BackendConfig, IndexBackend, IndexKind, Metric, VectorData};
use crate::vector::flat::FlatBackend;
use crate::vector::hnsw::HnswBackend;
use crate::vector::ivf::IvfBackend;
use crate::vector::persistence::{IndexMetadata, StoredRecord, VectorFiles, FORMAT_VERSION};
use crate::vector::record::{matches_filter, Metadata, NewRecord, SearchHit, VectorRecord};

/// Memoized search results retained
const SEARCH_CACHE_SIZE: usize = 100;
/// Rolling search-latency window length
const LATENCY_WINDOW: usize = 100;
/// Weight of the vector score when lexical re-ranking is enabled
const RERANK_VECTOR_WEIGHT: f32 = 0.7;
/// Weight of term overlap when lexical re-ranking is enabled
const RERANK_LEXICAL_WEIGHT: f32 = 0.3;

/// Vector store errors
#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("duplicate record id: {0}")]
    DuplicateId(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for store operations
pub type VectorStoreResult<T> = Result<T, VectorStoreError>;

/// Store construction parameters
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    /// Embedding dimension, fixed for the store's lifetime
    pub dimension: usize,
    /// Similarity metric
    pub metric: Metric,
    /// Index backend selection
    pub backend: BackendConfig,
    /// Persistence directory; `None` keeps everything in memory
    pub storage_dir: Option<PathBuf>,
    /// Memoize recent search results
    pub enable_search_cache: bool,
    /// Blend term-overlap into scores when query text is supplied
    pub lexical_rerank: bool,
}

impl VectorStoreConfig {
    /// In-memory flat store for `dimension`-dimensional vectors
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: Metric::Cosine,
            backend: BackendConfig::Flat,
            storage_dir: None,
            enable_search_cache: true,
            lexical_rerank: false,
        }
    }

    /// Select a backend
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Persist under `dir`
    pub fn with_storage(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }
}

fn build_backend(config: &BackendConfig) -> Box<dyn IndexBackend> {
    match config {
        BackendConfig::Flat => Box::new(FlatBackend::new()),
        BackendConfig::Hnsw { m, ef_search } => Box::new(HnswBackend::new(*m, *ef_search)),
        BackendConfig::Ivf { nlist, nprobe } => Box::new(IvfBackend::new(*nlist, *nprobe)),
    }
}

fn restore_backend(config: &BackendConfig, bytes: &[u8]) -> Option<Box<dyn IndexBackend>> {
    match config {
        BackendConfig::Flat => Some(Box::new(FlatBackend::new())),
        BackendConfig::Hnsw { .. } => {
            HnswBackend::from_bytes(bytes).map(|b| Box::new(b) as Box<dyn IndexBackend>)
        }
        BackendConfig::Ivf { .. } => {
            IvfBackend::from_bytes(bytes).map(|b| Box::new(b) as Box<dyn IndexBackend>)
        }
    }
}

#[derive(Debug)]
struct StoreInner {
    data: VectorData,
    backend: Box<dyn IndexBackend>,
    records: HashMap<String, StoredRecord>,
    row_to_id: HashMap<usize, String>,
    files: Option<VectorFiles>,
    last_rebuild_ms: i64,
}

/// Embedding store with exact-match metadata filtering and ANN search
///
/// One read-write lock guards the index and matrix: searches run shared,
/// mutations exclusive, and a `batch_add` is observable only as a whole.
#[derive(Debug)]
pub struct VectorStore {
    config: VectorStoreConfig,
    inner: RwLock<StoreInner>,
    search_cache: Mutex<LruCache<String, Vec<SearchHit>>>,
    latencies: Mutex<VecDeque<Duration>>,
}

impl VectorStore {
    /// Create or reopen a store per `config`
    pub fn open(config: VectorStoreConfig) -> VectorStoreResult<Self> {
        if config.dimension == 0 {
            return Err(VectorStoreError::DimensionMismatch {
                expected: 1,
                got: 0,
            });
        }

        let inner = match &config.storage_dir {
            Some(dir) => {
                let files = VectorFiles::open(dir)?;
                if let Some(meta) = files.load_metadata()? {
                    if meta.dimension != config.dimension {
                        return Err(VectorStoreError::DimensionMismatch {
                            expected: meta.dimension,
                            got: config.dimension,
                        });
                    }
                }
                if files.has_embeddings() {
                    Self::load_existing(&config, files)?
                } else {
                    StoreInner {
                        data: VectorData::new(config.dimension, config.metric),
                        backend: build_backend(&config.backend),
                        records: HashMap::new(),
                        row_to_id: HashMap::new(),
                        files: Some(files),
                        last_rebuild_ms: 0,
                    }
                }
            }
            None => StoreInner {
                data: VectorData::new(config.dimension, config.metric),
                backend: build_backend(&config.backend),
                records: HashMap::new(),
                row_to_id: HashMap::new(),
                files: None,
                last_rebuild_ms: 0,
            },
        };

        Ok(Self {
            config,
            inner: RwLock::new(inner),
            search_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEARCH_CACHE_SIZE).expect("nonzero cache size"),
            )),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        })
    }

    fn load_existing(
        config: &VectorStoreConfig,
        files: VectorFiles,
    ) -> VectorStoreResult<StoreInner> {
        let records = files.load_records()?;
        let raw = files.load_embeddings(config.dimension)?;
        let live_rows: Vec<usize> = records.iter().map(|r| r.row).collect();
        let data = VectorData::from_raw(config.dimension, config.metric, raw, &live_rows);

        let mut backend = files
            .load_index(kind_of(&config.backend))
            .and_then(|bytes| restore_backend(&config.backend, &bytes))
            .unwrap_or_else(|| build_backend(&config.backend));
        // A freshly built backend has no structure yet; rebuilding from the
        // matrix covers both the fresh and the stale-index case.
        backend.rebuild(&data);

        let row_to_id = records.iter().map(|r| (r.row, r.id.clone())).collect();
        let records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        let last_rebuild_ms = Utc::now().timestamp_millis();

        tracing::info!(
            vectors = data.live_count(),
            backend = kind_of(&config.backend).name(),
            "vector store loaded from disk"
        );

        Ok(StoreInner {
            data,
            backend,
            records,
            row_to_id,
            files: Some(files),
            last_rebuild_ms,
        })
    }

    /// Insert one record
    pub fn add(&self, record: NewRecord) -> VectorStoreResult<()> {
        self.batch_add(vec![record])
    }

    /// Insert a batch atomically: either every record lands or none do
    pub fn batch_add(&self, records: Vec<NewRecord>) -> VectorStoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();

        // Validate everything before touching any state.
        let mut seen = std::collections::HashSet::new();
        for record in &records {
            if record.embedding.len() != self.config.dimension {
                return Err(VectorStoreError::DimensionMismatch {
                    expected: self.config.dimension,
                    got: record.embedding.len(),
                });
            }
            if inner.records.contains_key(&record.id) || !seen.insert(record.id.clone()) {
                return Err(VectorStoreError::DuplicateId(record.id.clone()));
            }
        }

        for record in records {
            // Split borrows: the backend indexes against the matrix.
            let StoreInner { backend, data, .. } = &mut *inner;
            let row = data.push(&record.embedding);
            backend.insert(row, data);
            let stored = StoredRecord {
                content_hash: blake3::hash(record.content.as_bytes()).to_hex().to_string(),
                id: record.id,
                content: record.content,
                metadata: record.metadata,
                row,
                document_id: record.document_id,
                chunk_index: record.chunk_index,
                created_at: Utc::now(),
            };
            if let Some(files) = &inner.files {
                files.put_record(&stored)?;
            }
            inner.row_to_id.insert(row, stored.id.clone());
            inner.records.insert(stored.id.clone(), stored);
        }

        self.persist(&mut inner)?;
        self.search_cache.lock().clear();
        Ok(())
    }

    /// Remove records by id; unknown ids are skipped. Returns removed count.
    pub fn delete(&self, ids: &[String]) -> VectorStoreResult<usize> {
        let mut inner = self.inner.write();
        let mut removed = 0;
        for id in ids {
            let stored = match inner.records.remove(id) {
                Some(stored) => stored,
                None => continue,
            };
            inner.row_to_id.remove(&stored.row);
            let row = stored.row;
            inner.data.remove(row);
            // Split borrows: the backend may rebuild against the matrix.
            let StoreInner { backend, data, .. } = &mut *inner;
            backend.remove(row, data);
            if let Some(files) = &inner.files {
                files.delete_record(&stored)?;
            }
            removed += 1;
        }
        if removed > 0 {
            self.persist(&mut inner)?;
            self.search_cache.lock().clear();
        }
        Ok(removed)
    }

    /// Fetch a record with its embedding
    pub fn get(&self, id: &str) -> Option<VectorRecord> {
        let inner = self.inner.read();
        let stored = inner.records.get(id)?;
        Some(VectorRecord {
            id: stored.id.clone(),
            content: stored.content.clone(),
            metadata: stored.metadata.clone(),
            embedding: inner.data.row(stored.row).to_vec(),
            document_id: stored.document_id.clone(),
            chunk_index: stored.chunk_index,
            content_hash: stored.content_hash.clone(),
            created_at: stored.created_at,
        })
    }

    /// Ids of records whose content hashes to the same digest
    pub fn find_duplicates(&self, content: &str) -> Vec<String> {
        let hash = blake3::hash(content.as_bytes()).to_hex().to_string();
        let inner = self.inner.read();
        inner
            .records
            .values()
            .filter(|r| r.content_hash == hash)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Top-`k` records by similarity, best first
    ///
    /// Every returned hit scores at least `min_score` and matches every
    /// `filter` pair exactly.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        filter: &Metadata,
    ) -> VectorStoreResult<Vec<SearchHit>> {
        self.search_inner(query, k, min_score, filter, None)
    }

    /// Search with the original query text available for lexical re-ranking
    pub fn search_with_text(
        &self,
        query: &[f32],
        query_text: &str,
        k: usize,
        min_score: f32,
        filter: &Metadata,
    ) -> VectorStoreResult<Vec<SearchHit>> {
        self.search_inner(query, k, min_score, filter, Some(query_text))
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        filter: &Metadata,
        query_text: Option<&str>,
    ) -> VectorStoreResult<Vec<SearchHit>> {
        if query.len() != self.config.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.config.dimension,
                got: query.len(),
            });
        }
        let started = Instant::now();

        let cache_key = if self.config.enable_search_cache {
            let key = Self::cache_key(query, k, min_score, filter, query_text);
            if let Some(hits) = self.search_cache.lock().get(&key) {
                return Ok(hits.clone());
            }
            Some(key)
        } else {
            None
        };

        let inner = self.inner.read();
        // Over-fetch so post-filtering still fills k results.
        let fetch = if filter.is_empty() && min_score <= 0.0 {
            k
        } else {
            (k * 4 + 16).min(inner.data.live_count().max(k))
        };

        let raw = inner.backend.search(query, fetch, &inner.data);
        let mut hits: Vec<SearchHit> = raw
            .into_iter()
            .filter(|&(_, score)| score >= min_score)
            .filter_map(|(row, score)| {
                let id = inner.row_to_id.get(&row)?;
                let stored = inner.records.get(id)?;
                if !matches_filter(&stored.metadata, filter) {
                    return None;
                }
                Some(SearchHit {
                    id: stored.id.clone(),
                    content: stored.content.clone(),
                    metadata: stored.metadata.clone(),
                    score,
                    embedding: None,
                })
            })
            .collect();

        if self.config.lexical_rerank {
            if let Some(text) = query_text {
                rerank_by_terms(&mut hits, text);
            }
        }
        hits.truncate(k);
        drop(inner);

        self.record_latency(started.elapsed());
        if let Some(key) = cache_key {
            self.search_cache.lock().put(key, hits.clone());
        }
        Ok(hits)
    }

    fn cache_key(
        query: &[f32],
        k: usize,
        min_score: f32,
        filter: &Metadata,
        query_text: Option<&str>,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        for value in query {
            hasher.update(&value.to_le_bytes());
        }
        hasher.update(&(k as u64).to_le_bytes());
        hasher.update(&min_score.to_le_bytes());
        if let Ok(encoded) = serde_json::to_vec(filter) {
            hasher.update(&encoded);
        }
        if let Some(text) = query_text {
            hasher.update(text.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut window = self.latencies.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed);
    }

    /// Mean search latency over the rolling window, in milliseconds
    pub fn average_search_latency_ms(&self) -> f64 {
        let window = self.latencies.lock();
        if window.is_empty() {
            return 0.0;
        }
        let total: Duration = window.iter().sum();
        total.as_secs_f64() * 1000.0 / window.len() as f64
    }

    /// Live record count
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, inner: &mut StoreInner) -> VectorStoreResult<()> {
        let Some(files) = &inner.files else {
            return Ok(());
        };
        files.write_embeddings(inner.data.raw())?;
        if let Some(bytes) = inner.backend.serialize_index() {
            files.write_index(inner.backend.kind(), &bytes)?;
        }
        inner.last_rebuild_ms = Utc::now().timestamp_millis();
        files.write_metadata(&IndexMetadata {
            version: FORMAT_VERSION,
            index_type: inner.backend.kind().name().to_string(),
            total_vectors: inner.records.len(),
            last_rebuild_ms: inner.last_rebuild_ms,
            dimension: self.config.dimension,
        })?;
        Ok(())
    }
}

fn kind_of(config: &BackendConfig) -> IndexKind {
    match config {
        BackendConfig::Flat => IndexKind::Flat,
        BackendConfig::Hnsw { .. } => IndexKind::Hnsw,
        BackendConfig::Ivf { .. } => IndexKind::Ivf,
    }
}

/// Blend term overlap with the vector score and re-sort
fn rerank_by_terms(hits: &mut [SearchHit], query_text: &str) {
    let query_terms: std::collections::HashSet<String> = query_text
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if query_terms.is_empty() {
        return;
    }
    for hit in hits.iter_mut() {
        let content_terms: std::collections::HashSet<String> = hit
            .content
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let overlap = query_terms.intersection(&content_terms).count() as f32
            / query_terms.len() as f32;
        hit.score = RERANK_VECTOR_WEIGHT * hit.score + RERANK_LEXICAL_WEIGHT * overlap;
    }
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
}
