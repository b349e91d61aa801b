//! Exact linear-scan backend

use rayon::prelude::*;

use crate::vector::backend::{IndexBackend, IndexKind, VectorData};

/// Row count below which a sequential scan beats the fork/join overhead
const PARALLEL_THRESHOLD: usize = 2048;

/// Brute-force scan over every live vector: exact results, O(N * D) per
/// query. Holds no structure of its own, so inserts and removals are free.
#[derive(Debug, Default)]
pub struct FlatBackend;

impl FlatBackend {
    pub fn new() -> Self {
        Self
    }
}

impl IndexBackend for FlatBackend {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn insert(&mut self, _row: usize, _data: &VectorData) {}

    fn remove(&mut self, _row: usize, _data: &VectorData) {}

    fn search(&self, query: &[f32], k: usize, data: &VectorData) -> Vec<(usize, f32)> {
        let rows: Vec<usize> = data.live_rows().collect();
        let mut scored: Vec<(usize, f32)> = if rows.len() >= PARALLEL_THRESHOLD {
            rows.par_iter()
                .map(|&row| (row, data.score(query, row)))
                .collect()
        } else {
            rows.iter()
                .map(|&row| (row, data.score(query, row)))
                .collect()
        };

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    fn rebuild(&mut self, _data: &VectorData) {}

    fn serialize_index(&self) -> Option<Vec<u8>> {
        None
    }
}
