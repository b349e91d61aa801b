//! Graph-based approximate index over navigable small-world layers

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::vector::backend::{IndexBackend, IndexKind, VectorData};

/// Tombstone fraction that triggers a full rebuild
const REBUILD_TOMBSTONE_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    score: f32,
    node: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    row: usize,
    level: usize,
    /// Adjacency per layer, `neighbors[l]` valid for `l <= level`
    neighbors: Vec<Vec<usize>>,
    deleted: bool,
}

/// Approximate graph index: `m` bounds per-node edges, `ef_search` sizes the
/// candidate frontier at query time (larger = better recall, slower).
///
/// Removals tombstone the node so the graph stays routable; the index
/// rebuilds itself once half the nodes are tombstones.
#[derive(Debug, Serialize, Deserialize)]
pub struct HnswBackend {
    m: usize,
    ef_search: usize,
    level_norm: f64,
    entry: Option<usize>,
    nodes: Vec<Node>,
    row_to_node: HashMap<usize, usize>,
    tombstones: usize,
}

impl HnswBackend {
    /// Create an empty graph
    pub fn new(m: usize, ef_search: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            ef_search: ef_search.max(1),
            level_norm: 1.0 / (m as f64).ln(),
            entry: None,
            nodes: Vec::new(),
            row_to_node: HashMap::new(),
            tombstones: 0,
        }
    }

    /// Restore a previously serialized graph
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    fn draw_level(&self) -> usize {
        let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        (-u.ln() * self.level_norm) as usize
    }

    /// Best-first expansion of `entries` at `layer`, keeping the `ef`
    /// closest nodes seen
    fn search_layer(
        &self,
        query: &[f32],
        entries: &[usize],
        ef: usize,
        layer: usize,
        data: &VectorData,
    ) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = entries.iter().copied().collect();
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut results: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();

        for &node in entries {
            let score = data.score(query, self.nodes[node].row);
            let candidate = Candidate { score, node };
            frontier.push(candidate);
            results.push(std::cmp::Reverse(candidate));
        }

        while let Some(current) = frontier.pop() {
            let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::MIN);
            if current.score < worst && results.len() >= ef {
                break;
            }
            let neighbors = match self.nodes[current.node].neighbors.get(layer) {
                Some(list) => list.clone(),
                None => continue,
            };
            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let score = data.score(query, self.nodes[neighbor].row);
                let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::MIN);
                if results.len() < ef || score > worst {
                    let candidate = Candidate {
                        score,
                        node: neighbor,
                    };
                    frontier.push(candidate);
                    results.push(std::cmp::Reverse(candidate));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Greedy single-step descent through layers above `target_layer`
    fn descend(&self, query: &[f32], mut current: usize, from: usize, to: usize, data: &VectorData) -> usize {
        for layer in (to..=from).rev() {
            loop {
                let mut best = current;
                let mut best_score = data.score(query, self.nodes[current].row);
                if let Some(neighbors) = self.nodes[current].neighbors.get(layer) {
                    for &n in neighbors {
                        let score = data.score(query, self.nodes[n].row);
                        if score > best_score {
                            best = n;
                            best_score = score;
                        }
                    }
                }
                if best == current {
                    break;
                }
                current = best;
            }
        }
        current
    }

    fn prune_neighbors(&mut self, node: usize, layer: usize, data: &VectorData) {
        let row = self.nodes[node].row;
        let list = &self.nodes[node].neighbors[layer];
        if list.len() <= self.m {
            return;
        }
        let mut scored: Vec<(usize, f32)> = list
            .iter()
            .map(|&n| (n, data.score_rows(row, self.nodes[n].row)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(self.m);
        self.nodes[node].neighbors[layer] = scored.into_iter().map(|(n, _)| n).collect();
    }
}

impl IndexBackend for HnswBackend {
    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
    }

    fn insert(&mut self, row: usize, data: &VectorData) {
        if self.row_to_node.contains_key(&row) {
            return;
        }
        let level = self.draw_level();
        let node_idx = self.nodes.len();
        self.nodes.push(Node {
            row,
            level,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.row_to_node.insert(row, node_idx);

        let entry = match self.entry {
            Some(entry) => entry,
            None => {
                self.entry = Some(node_idx);
                return;
            }
        };

        let query = data.row(row).to_vec();
        let entry_level = self.nodes[entry].level;
        let mut current = entry;

        if entry_level > level {
            current = self.descend(&query, current, entry_level, level + 1, data);
        }

        let ef_construction = (self.m * 2).max(self.ef_search);
        for layer in (0..=level.min(entry_level)).rev() {
            let found = self.search_layer(&query, &[current], ef_construction, layer, data);
            let chosen: Vec<usize> = found.iter().take(self.m).map(|c| c.node).collect();
            for &neighbor in &chosen {
                self.nodes[node_idx].neighbors[layer].push(neighbor);
                if self.nodes[neighbor].neighbors.len() > layer {
                    self.nodes[neighbor].neighbors[layer].push(node_idx);
                    self.prune_neighbors(neighbor, layer, data);
                }
            }
            if let Some(best) = found.first() {
                current = best.node;
            }
        }

        if level > entry_level {
            self.entry = Some(node_idx);
        }
    }

    fn remove(&mut self, row: usize, data: &VectorData) {
        if let Some(&node) = self.row_to_node.get(&row) {
            if !self.nodes[node].deleted {
                self.nodes[node].deleted = true;
                self.tombstones += 1;
            }
            self.row_to_node.remove(&row);
        }
        if !self.nodes.is_empty()
            && self.tombstones as f64 / self.nodes.len() as f64 >= REBUILD_TOMBSTONE_FRACTION
        {
            tracing::debug!(
                tombstones = self.tombstones,
                nodes = self.nodes.len(),
                "rebuilding graph index"
            );
            self.rebuild(data);
        }
    }

    fn search(&self, query: &[f32], k: usize, data: &VectorData) -> Vec<(usize, f32)> {
        let entry = match self.entry {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let entry_level = self.nodes[entry].level;
        let current = self.descend(query, entry, entry_level, 1, data);

        let ef = self.ef_search.max(k);
        let found = self.search_layer(query, &[current], ef, 0, data);
        found
            .into_iter()
            .filter(|c| !self.nodes[c.node].deleted && data.is_live(self.nodes[c.node].row))
            .take(k)
            .map(|c| (self.nodes[c.node].row, c.score))
            .collect()
    }

    fn rebuild(&mut self, data: &VectorData) {
        self.entry = None;
        self.nodes.clear();
        self.row_to_node.clear();
        self.tombstones = 0;
        for row in data.live_rows().collect::<Vec<_>>() {
            self.insert(row, data);
        }
    }

    fn serialize_index(&self) -> Option<Vec<u8>> {
        bincode::serialize(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::backend::Metric;
    use crate::vector::flat::FlatBackend;

    fn clustered_data(n: usize, dim: usize) -> VectorData {
        let mut data = VectorData::new(dim, Metric::Cosine);
        for i in 0..n {
            let mut v = vec![0.0f32; dim];
            v[i % dim] = 1.0;
            v[(i + 1) % dim] = 0.3 + (i as f32 % 7.0) / 10.0;
            // Small per-index perturbation keeps every vector distinct.
            v[(i + 2) % dim] = i as f32 / 1000.0;
            data.push(&v);
        }
        data
    }

    #[test]
    fn test_empty_graph_returns_nothing() {
        let backend = HnswBackend::new(8, 32);
        let data = VectorData::new(4, Metric::Cosine);
        assert!(backend.search(&[1.0, 0.0, 0.0, 0.0], 5, &data).is_empty());
    }

    #[test]
    fn test_single_node() {
        let mut data = VectorData::new(2, Metric::Cosine);
        let row = data.push(&[1.0, 0.0]);
        let mut backend = HnswBackend::new(4, 16);
        backend.insert(row, &data);

        let hits = backend.search(&[1.0, 0.0], 3, &data);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, row);
    }

    #[test]
    fn test_recall_against_flat_scan() {
        let data = clustered_data(200, 8);
        let mut backend = HnswBackend::new(12, 64);
        for row in data.live_rows().collect::<Vec<_>>() {
            backend.insert(row, &data);
        }

        let flat = FlatBackend::new();
        let query = {
            let mut v = vec![0.0f32; 8];
            v[0] = 1.0;
            v[1] = 0.4;
            v
        };
        let exact: Vec<usize> = flat.search(&query, 10, &data).into_iter().map(|h| h.0).collect();
        let approx: Vec<usize> = backend
            .search(&query, 10, &data)
            .into_iter()
            .map(|h| h.0)
            .collect();

        let overlap = approx.iter().filter(|r| exact.contains(r)).count();
        assert!(
            overlap >= 7,
            "recall too low: {} of 10 (approx {:?} exact {:?})",
            overlap,
            approx,
            exact
        );
    }

    #[test]
    fn test_scores_descend() {
        let data = clustered_data(50, 4);
        let mut backend = HnswBackend::new(8, 32);
        for row in data.live_rows().collect::<Vec<_>>() {
            backend.insert(row, &data);
        }
        let hits = backend.search(&[1.0, 0.2, 0.0, 0.0], 10, &data);
        for pair in hits.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_removed_rows_not_returned() {
        let mut data = clustered_data(30, 4);
        let mut backend = HnswBackend::new(8, 32);
        for row in data.live_rows().collect::<Vec<_>>() {
            backend.insert(row, &data);
        }
        backend.remove(0, &data);
        data.remove(0);

        let hits = backend.search(&[1.0, 0.3, 0.0, 0.0], 30, &data);
        assert!(hits.iter().all(|&(row, _)| row != 0));
    }

    #[test]
    fn test_serialization_round_trip() {
        let data = clustered_data(20, 4);
        let mut backend = HnswBackend::new(8, 32);
        for row in data.live_rows().collect::<Vec<_>>() {
            backend.insert(row, &data);
        }
        let bytes = backend.serialize_index().unwrap();
        let restored = HnswBackend::from_bytes(&bytes).unwrap();
        let before: Vec<usize> = backend
            .search(&[1.0, 0.3, 0.0, 0.0], 5, &data)
            .into_iter()
            .map(|h| h.0)
            .collect();
        let after: Vec<usize> = restored
            .search(&[1.0, 0.3, 0.0, 0.0], 5, &data)
            .into_iter()
            .map(|h| h.0)
            .collect();
        assert_eq!(before, after);
    }
}
