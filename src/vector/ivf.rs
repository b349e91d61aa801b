//! Partitioned approximate index with a trained quantizer

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::vector::backend::{score_vectors, IndexBackend, IndexKind, Metric, VectorData};

/// Training vectors required per partition before the quantizer is fit
pub const TRAINING_FACTOR: usize = 39;
/// K-means refinement passes
const KMEANS_ITERATIONS: usize = 10;

/// Inverted-file index: vectors are bucketed under their nearest trained
/// centroid and queries probe only `nprobe` of the `nlist` buckets.
///
/// Until the store holds `nlist * 39` vectors the quantizer cannot be fit,
/// and the index transparently degrades to an exact scan.
#[derive(Debug, Serialize, Deserialize)]
pub struct IvfBackend {
    nlist: usize,
    nprobe: usize,
    /// Empty until trained
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
    assignments: HashMap<usize, usize>,
}

impl IvfBackend {
    /// Create an untrained index
    pub fn new(nlist: usize, nprobe: usize) -> Self {
        Self {
            nlist: nlist.max(1),
            nprobe: nprobe.max(1),
            centroids: Vec::new(),
            lists: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    /// Restore a previously serialized index
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    /// Whether the quantizer has been fit
    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn training_threshold(&self) -> usize {
        self.nlist * TRAINING_FACTOR
    }

    fn nearest_centroid(&self, vector: &[f32], metric: Metric) -> usize {
        let mut best = 0;
        let mut best_score = f32::MIN;
        for (i, centroid) in self.centroids.iter().enumerate() {
            let score = score_vectors(metric, vector, centroid);
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        best
    }

    /// Fit centroids by k-means over all live rows, then bucket everything
    fn train(&mut self, data: &VectorData) {
        let rows: Vec<usize> = data.live_rows().collect();
        if rows.len() < self.training_threshold() {
            return;
        }

        let mut rng = rand::thread_rng();
        let mut seeds = rows.clone();
        seeds.shuffle(&mut rng);
        seeds.truncate(self.nlist);
        self.centroids = seeds.iter().map(|&r| data.row(r).to_vec()).collect();

        let dim = data.dim();
        for _ in 0..KMEANS_ITERATIONS {
            let mut sums = vec![vec![0.0f64; dim]; self.nlist];
            let mut counts = vec![0usize; self.nlist];
            for &row in &rows {
                let c = self.nearest_centroid(data.row(row), data.metric());
                counts[c] += 1;
                for (s, v) in sums[c].iter_mut().zip(data.row(row)) {
                    *s += *v as f64;
                }
            }
            for (c, centroid) in self.centroids.iter_mut().enumerate() {
                if counts[c] > 0 {
                    for (target, sum) in centroid.iter_mut().zip(&sums[c]) {
                        *target = (sum / counts[c] as f64) as f32;
                    }
                }
            }
        }

        self.lists = vec![Vec::new(); self.nlist];
        self.assignments.clear();
        for &row in &rows {
            let c = self.nearest_centroid(data.row(row), data.metric());
            self.lists[c].push(row);
            self.assignments.insert(row, c);
        }
        tracing::debug!(nlist = self.nlist, vectors = rows.len(), "quantizer trained");
    }

    fn exact_scan(&self, query: &[f32], k: usize, data: &VectorData) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = data
            .live_rows()
            .map(|row| (row, data.score(query, row)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }
}

impl IndexBackend for IvfBackend {
    fn kind(&self) -> IndexKind {
        IndexKind::Ivf
    }

    fn insert(&mut self, row: usize, data: &VectorData) {
        if self.is_trained() {
            let c = self.nearest_centroid(data.row(row), data.metric());
            self.lists[c].push(row);
            self.assignments.insert(row, c);
            return;
        }
        // Crossing the threshold fits the quantizer over everything seen.
        if data.live_count() >= self.training_threshold() {
            self.train(data);
        }
    }

    fn remove(&mut self, row: usize, _data: &VectorData) {
        if let Some(c) = self.assignments.remove(&row) {
            self.lists[c].retain(|&r| r != row);
        }
    }

    fn search(&self, query: &[f32], k: usize, data: &VectorData) -> Vec<(usize, f32)> {
        if !self.is_trained() {
            return self.exact_scan(query, k, data);
        }

        let mut by_centroid: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, score_vectors(data.metric(), query, c)))
            .collect();
        by_centroid.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut scored: Vec<(usize, f32)> = Vec::new();
        for &(list, _) in by_centroid.iter().take(self.nprobe) {
            for &row in &self.lists[list] {
                if data.is_live(row) {
                    scored.push((row, data.score(query, row)));
                }
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }

    fn rebuild(&mut self, data: &VectorData) {
        self.centroids.clear();
        self.lists.clear();
        self.assignments.clear();
        self.train(data);
    }

    fn serialize_index(&self) -> Option<Vec<u8>> {
        bincode::serialize(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::backend::Metric;

    fn populated(n: usize) -> (VectorData, IvfBackend) {
        let mut data = VectorData::new(4, Metric::Cosine);
        let mut backend = IvfBackend::new(2, 1);
        for i in 0..n {
            let v = match i % 2 {
                0 => [1.0, 0.1 * (i % 5) as f32, 0.0, i as f32 / 1000.0],
                _ => [0.0, i as f32 / 1000.0, 1.0, 0.1 * (i % 5) as f32],
            };
            let row = data.push(&v);
            backend.insert(row, &data);
        }
        (data, backend)
    }

    #[test]
    fn test_untrained_falls_back_to_exact_scan() {
        let (data, backend) = populated(10);
        assert!(!backend.is_trained());
        let hits = backend.search(&[1.0, 0.0, 0.0, 0.0], 3, &data);
        assert_eq!(hits.len(), 3);
        // Exact scan: the best hit is a cluster-0 vector.
        assert!(data.row(hits[0].0)[0] > 0.9);
    }

    #[test]
    fn test_trains_at_threshold() {
        // nlist=2 requires 78 vectors.
        let (_, backend) = populated(2 * TRAINING_FACTOR);
        assert!(backend.is_trained());
    }

    #[test]
    fn test_probed_search_finds_cluster() {
        let (data, backend) = populated(120);
        assert!(backend.is_trained());
        let hits = backend.search(&[1.0, 0.2, 0.0, 0.0], 5, &data);
        assert_eq!(hits.len(), 5);
        for &(row, _) in &hits {
            assert!(data.row(row)[0] > 0.9, "probe pulled from the wrong cluster");
        }
    }

    #[test]
    fn test_remove_unassigns() {
        let (mut data, mut backend) = populated(120);
        let victim = backend.search(&[1.0, 0.2, 0.0, 0.0], 1, &data)[0].0;
        backend.remove(victim, &data);
        data.remove(victim);
        let hits = backend.search(&[1.0, 0.2, 0.0, 0.0], 120, &data);
        assert!(hits.iter().all(|&(row, _)| row != victim));
    }

    #[test]
    fn test_serialization_round_trip() {
        let (data, backend) = populated(120);
        let bytes = backend.serialize_index().unwrap();
        let restored = IvfBackend::from_bytes(&bytes).unwrap();
        assert!(restored.is_trained());
        let hits = restored.search(&[0.0, 0.05, 1.0, 0.2], 3, &data);
        assert_eq!(hits.len(), 3);
        assert!(data.row(hits[0].0)[2] > 0.9);
    }
}
