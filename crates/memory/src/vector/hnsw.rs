//! Layered-proximity-graph approximate nearest-neighbor index (§4.3).
//!
//! Graph-only: embeddings live in `VectorIndex`'s table, this just holds
//! per-layer neighbor sets. Layer assignment follows the standard HNSW
//! geometric distribution with parameter `1/ln(m)`; search is a bounded
//! best-first walk (`ef_search` candidates kept) greedily descending from
//! the entry point's top layer, same shape as the teacher pack's other
//! vector-index implementation but without its deterministic-RNG
//! machinery — nothing here needs to replay identically across runs.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use uuid::Uuid;

use super::cosine_similarity;

struct Node {
    neighbors: Vec<HashSet<Uuid>>,
    max_layer: usize,
}

pub struct HnswGraph {
    m: usize,
    ef_construction: usize,
    nodes: HashMap<Uuid, Node>,
    entry_point: Option<Uuid>,
    max_level: usize,
    level_multiplier: f64,
}

impl HnswGraph {
    pub fn new(m: usize, ef_construction: usize) -> Self {
        Self {
            m: m.max(1),
            ef_construction: ef_construction.max(1),
            nodes: HashMap::new(),
            entry_point: None,
            max_level: 0,
            level_multiplier: 1.0 / (m.max(2) as f64).ln(),
        }
    }

    fn assign_level(&self) -> usize {
        let uniform: f64 = rand::thread_rng().gen_range(1e-12..1.0);
        (-uniform.ln() * self.level_multiplier) as usize
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 { self.m * 2 } else { self.m }
    }

    pub fn insert(&mut self, id: Uuid, vector: &[f32], embeddings: &HashMap<Uuid, Vec<f32>>) {
        let level = self.assign_level();
        self.nodes.insert(
            id,
            Node {
                neighbors: (0..=level).map(|_| HashSet::new()).collect(),
                max_layer: level,
            },
        );

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level;
            return;
        };

        // Greedy descent from the current top layer down to `level + 1`.
        for layer in (level + 1..=self.max_level).rev() {
            entry = self.greedy_step(vector, entry, layer, embeddings);
        }

        // At each layer from min(level, max_level) down to 0, find
        // ef_construction candidates and connect the best `m`.
        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(vector, entry, self.ef_construction, layer, embeddings);
            let max_conn = self.max_connections(layer);
            for &(neighbor, _) in candidates.iter().take(max_conn) {
                self.connect(id, neighbor, layer);
                self.prune(neighbor, layer, embeddings);
            }
            if let Some(&(best, _)) = candidates.first() {
                entry = best;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
    }

    fn connect(&mut self, a: Uuid, b: Uuid, layer: usize) {
        if let Some(node) = self.nodes.get_mut(&a) {
            if layer < node.neighbors.len() {
                node.neighbors[layer].insert(b);
            }
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            if layer < node.neighbors.len() {
                node.neighbors[layer].insert(a);
            }
        }
    }

    /// Reciprocal edge pruning: if a node's edge set at `layer` exceeds its
    /// cap, keep only the `max_connections` closest to the node itself.
    fn prune(&mut self, id: Uuid, layer: usize, embeddings: &HashMap<Uuid, Vec<f32>>) {
        let max_conn = self.max_connections(layer);
        let Some(center) = embeddings.get(&id) else { return };
        let Some(node) = self.nodes.get(&id) else { return };
        if layer >= node.neighbors.len() || node.neighbors[layer].len() <= max_conn {
            return;
        }
        let mut scored: Vec<(Uuid, f32)> = node.neighbors[layer]
            .iter()
            .filter_map(|nid| embeddings.get(nid).map(|v| (*nid, cosine_similarity(center, v))))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let keep: HashSet<Uuid> = scored.into_iter().take(max_conn).map(|(id, _)| id).collect();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[layer] = keep;
        }
    }

    fn greedy_step(&self, query: &[f32], from: Uuid, layer: usize, embeddings: &HashMap<Uuid, Vec<f32>>) -> Uuid {
        let mut current = from;
        loop {
            let Some(current_vec) = embeddings.get(&current) else { break };
            let current_score = cosine_similarity(query, current_vec);
            let mut best = current;
            let mut best_score = current_score;
            if let Some(node) = self.nodes.get(&current) {
                if layer < node.neighbors.len() {
                    for &neighbor in &node.neighbors[layer] {
                        if let Some(v) = embeddings.get(&neighbor) {
                            let score = cosine_similarity(query, v);
                            if score > best_score {
                                best_score = score;
                                best = neighbor;
                            }
                        }
                    }
                }
            }
            if best == current {
                break;
            }
            current = best;
        }
        current
    }

    /// Bounded best-first search at a single layer, keeping at most `ef`
    /// candidates, sorted best-first.
    fn search_layer(
        &self,
        query: &[f32],
        entry: Uuid,
        ef: usize,
        layer: usize,
        embeddings: &HashMap<Uuid, Vec<f32>>,
    ) -> Vec<(Uuid, f32)> {
        let mut visited = HashSet::new();
        visited.insert(entry);
        let mut frontier = vec![entry];
        let Some(entry_vec) = embeddings.get(&entry) else { return Vec::new() };
        let mut results = vec![(entry, cosine_similarity(query, entry_vec))];

        while let Some(current) = frontier.pop() {
            let Some(node) = self.nodes.get(&current) else { continue };
            if layer >= node.neighbors.len() {
                continue;
            }
            for &neighbor in &node.neighbors[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                if let Some(v) = embeddings.get(&neighbor) {
                    results.push((neighbor, cosine_similarity(query, v)));
                    frontier.push(neighbor);
                }
            }
        }

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(ef);
        results
    }

    pub fn remove(&mut self, id: &Uuid) {
        let Some(node) = self.nodes.remove(id) else { return };
        for layer in 0..node.neighbors.len() {
            for neighbor in &node.neighbors[layer] {
                if let Some(n) = self.nodes.get_mut(neighbor) {
                    if layer < n.neighbors.len() {
                        n.neighbors[layer].remove(id);
                    }
                }
            }
        }
        if self.entry_point.as_ref() == Some(id) {
            self.entry_point = self.nodes.keys().next().copied();
        }
    }

    /// `(max_layer, edge_count)` — node count is the embedding table's size,
    /// tracked by the caller (§4.3 `stats(nodes, max_layer, edges)`).
    pub fn stats(&self) -> (usize, usize) {
        let entries: usize = self.nodes.values().map(|n| n.neighbors.iter().map(|layer| layer.len()).sum::<usize>()).sum();
        (self.max_level, entries / 2)
    }

    pub fn search(&self, query: &[f32], k: usize, ef_search: usize, embeddings: &HashMap<Uuid, Vec<f32>>) -> Vec<(Uuid, f32)> {
        let Some(mut entry) = self.entry_point else { return Vec::new() };
        for layer in (1..=self.max_level).rev() {
            entry = self.greedy_step(query, entry, layer, embeddings);
        }
        let mut results = self.search_layer(query, entry, ef_search.max(k), 0, embeddings);
        results.truncate(k);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_finds_nearest_after_several_inserts() {
        let mut graph = HnswGraph::new(4, 16);
        let mut embeddings = HashMap::new();
        let target = Uuid::new_v4();
        embeddings.insert(target, vec![1.0, 0.0, 0.0]);
        graph.insert(target, &[1.0, 0.0, 0.0], &embeddings);
        for i in 0..20 {
            let id = Uuid::new_v4();
            let v = vec![0.0, (i as f32) / 20.0, 1.0];
            embeddings.insert(id, v.clone());
            graph.insert(id, &v, &embeddings);
        }
        let results = graph.search(&[0.95, 0.05, 0.0], 3, 32, &embeddings);
        assert!(results.iter().any(|(id, _)| *id == target));
    }

    #[test]
    fn remove_drops_reciprocal_edges() {
        let mut graph = HnswGraph::new(4, 16);
        let mut embeddings = HashMap::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        embeddings.insert(a, vec![1.0, 0.0]);
        embeddings.insert(b, vec![0.9, 0.1]);
        graph.insert(a, &[1.0, 0.0], &embeddings);
        graph.insert(b, &[0.9, 0.1], &embeddings);
        graph.remove(&a);
        assert!(!graph.nodes.contains_key(&a));
        if let Some(node) = graph.nodes.get(&b) {
            for layer in &node.neighbors {
                assert!(!layer.contains(&a));
            }
        }
    }
}
