//! Index backend contract and the shared embedding matrix

use serde::{Deserialize, Serialize};

/// Distance metric for similarity scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Cosine similarity, normalized to [0, 1]
    Cosine,
    /// Euclidean distance, mapped to (0, 1] via 1 / (1 + d)
    L2,
}

/// Backend selection with construction parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendConfig {
    /// Exact linear scan; the required baseline
    Flat,
    /// Navigable small-world graph; `ef_search` trades recall for latency
    Hnsw { m: usize, ef_search: usize },
    /// Trained partitions; `nprobe` of `nlist` lists probed per query
    Ivf { nlist: usize, nprobe: usize },
}

/// Which backend family an index belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Flat,
    Hnsw,
    Ivf,
}

impl IndexKind {
    /// Stable name used in file names and the metadata sidecar
    pub fn name(&self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Hnsw => "hnsw",
            Self::Ivf => "ivf",
        }
    }
}

/// Row-major embedding matrix shared by the store and its backend
///
/// Rows are stable for the lifetime of a record; deleted rows are zeroed and
/// recycled for later inserts so the on-disk layout never needs compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorData {
    dim: usize,
    metric: Metric,
    data: Vec<f32>,
    live: Vec<bool>,
    free: Vec<usize>,
}

impl VectorData {
    /// Empty matrix for `dim`-dimensional vectors
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            data: Vec::new(),
            live: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Rebuild from a raw row-major buffer, marking the given rows live
    pub fn from_raw(dim: usize, metric: Metric, data: Vec<f32>, live_rows: &[usize]) -> Self {
        let rows = if dim == 0 { 0 } else { data.len() / dim };
        let mut live = vec![false; rows];
        for &row in live_rows {
            if row < rows {
                live[row] = true;
            }
        }
        let free = (0..rows).filter(|&r| !live[r]).collect();
        Self {
            dim,
            metric,
            data,
            live,
            free,
        }
    }

    /// Embedding dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Metric in use
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Total rows, live or not
    pub fn rows(&self) -> usize {
        self.live.len()
    }

    /// Count of live rows
    pub fn live_count(&self) -> usize {
        self.live.iter().filter(|&&l| l).count()
    }

    /// Whether `row` currently holds a record
    pub fn is_live(&self, row: usize) -> bool {
        self.live.get(row).copied().unwrap_or(false)
    }

    /// The vector at `row`
    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }

    /// Raw row-major buffer, for persistence
    pub fn raw(&self) -> &[f32] {
        &self.data
    }

    /// Store `vector`, reusing a freed row when one exists
    pub fn push(&mut self, vector: &[f32]) -> usize {
        debug_assert_eq!(vector.len(), self.dim);
        if let Some(row) = self.free.pop() {
            self.data[row * self.dim..(row + 1) * self.dim].copy_from_slice(vector);
            self.live[row] = true;
            row
        } else {
            let row = self.live.len();
            self.data.extend_from_slice(vector);
            self.live.push(true);
            row
        }
    }

    /// Zero and recycle `row`
    pub fn remove(&mut self, row: usize) {
        if self.is_live(row) {
            self.data[row * self.dim..(row + 1) * self.dim].fill(0.0);
            self.live[row] = false;
            self.free.push(row);
        }
    }

    /// Iterator over live row indices
    pub fn live_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.live
            .iter()
            .enumerate()
            .filter(|(_, &l)| l)
            .map(|(r, _)| r)
    }

    /// Normalized similarity between `query` and the vector at `row`
    pub fn score(&self, query: &[f32], row: usize) -> f32 {
        score_vectors(self.metric, query, self.row(row))
    }

    /// Normalized similarity between two stored rows
    pub fn score_rows(&self, a: usize, b: usize) -> f32 {
        score_vectors(self.metric, self.row(a), self.row(b))
    }
}

/// Score two vectors under `metric`, normalized into [0, 1]
pub fn score_vectors(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => {
            let mut dot = 0.0f32;
            let mut norm_a = 0.0f32;
            let mut norm_b = 0.0f32;
            for (x, y) in a.iter().zip(b.iter()) {
                dot += x * y;
                norm_a += x * x;
                norm_b += y * y;
            }
            if norm_a == 0.0 || norm_b == 0.0 {
                return 0.0;
            }
            let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
            ((1.0 + cosine) / 2.0).clamp(0.0, 1.0)
        }
        Metric::L2 => {
            let dist: f32 = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            1.0 / (1.0 + dist)
        }
    }
}

/// Uniform contract all index backends implement
///
/// Backends hold only index structure over row ids; vector data stays in the
/// shared [`VectorData`] matrix passed into every call.
pub trait IndexBackend: Send + Sync + std::fmt::Debug {
    /// Backend family
    fn kind(&self) -> IndexKind;

    /// Index a newly stored row
    fn insert(&mut self, row: usize, data: &VectorData);

    /// Drop a row from the index; may trigger an internal rebuild
    fn remove(&mut self, row: usize, data: &VectorData);

    /// Top-`k` live rows by similarity to `query`, best first
    fn search(&self, query: &[f32], k: usize, data: &VectorData) -> Vec<(usize, f32)>;

    /// Reconstruct the index from scratch over all live rows
    fn rebuild(&mut self, data: &VectorData);

    /// Serialized form for the on-disk index file; `None` when the backend
    /// has nothing worth persisting (flat scan)
    fn serialize_index(&self) -> Option<Vec<u8>>;
}
