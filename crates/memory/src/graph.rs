//! Association Graph (Component D, §4.4) — typed, directed, weighted edges
//! between records, with traversal and centrality.
//!
//! No precedent in the teacher pack for this shape; built from scratch in
//! the teacher's general id-indexed-arena idiom (ids as map keys, edges
//! store ids rather than direct references, so nodes can be removed without
//! invalidating borrows elsewhere) rather than forced into
//! `flyingrobots-echo`'s scene graph, which models renderable 3D hierarchy
//! and shares no real structure with an association graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SubstrateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    Sequential,
    Causal,
    Similar,
    Contrasts,
    Elaborates,
    References,
    Resolves,
    Custom,
}

impl RelationType {
    fn default_label(&self) -> &'static str {
        match self {
            RelationType::Sequential => "sequential",
            RelationType::Causal => "causal",
            RelationType::Similar => "similar",
            RelationType::Contrasts => "contrasts",
            RelationType::Elaborates => "elaborates",
            RelationType::References => "references",
            RelationType::Resolves => "resolves",
            RelationType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub to: Uuid,
    pub relation: RelationType,
    pub label: String,
    pub strength: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Node {
    out_edges: Vec<Edge>,
    in_edges: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct TraversalHit {
    pub record_id: Uuid,
    pub depth: usize,
    pub strength: f32,
    pub via: RelationType,
}

struct Inner {
    nodes: HashMap<Uuid, Node>,
}

pub struct AssociationGraph {
    inner: Mutex<Inner>,
}

impl Default for AssociationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AssociationGraph {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { nodes: HashMap::new() }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| SubstrateError::StorageFailure("association graph lock poisoned".to_string()))
    }

    pub fn get_or_create_node(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock()?;
        inner.nodes.entry(id).or_default();
        Ok(())
    }

    /// `add_edge(from, to, relation, label, strength)` — `label` defaults to
    /// the relation's type name when `None`; strength is clamped to `[0,1]`.
    /// Creates both endpoints if absent.
    pub fn add_edge(&self, from: Uuid, to: Uuid, relation: RelationType, label: Option<String>, strength: f32) -> Result<()> {
        if from == to {
            return Err(SubstrateError::bad_input("an edge cannot connect a record to itself"));
        }
        let strength = strength.clamp(0.0, 1.0);
        let label = label.unwrap_or_else(|| relation.default_label().to_string());
        let mut inner = self.lock()?;
        inner.nodes.entry(from).or_default();
        inner.nodes.entry(to).or_default();
        inner.nodes.get_mut(&from).unwrap().out_edges.push(Edge { to, relation, label, strength, created_at: Utc::now() });
        inner.nodes.get_mut(&to).unwrap().in_edges.push(from);
        Ok(())
    }

    /// `related(record_id)` — the node's outgoing edges.
    pub fn related(&self, record_id: &Uuid) -> Result<Vec<Edge>> {
        let inner = self.lock()?;
        Ok(inner.nodes.get(record_id).map(|n| n.out_edges.clone()).unwrap_or_default())
    }

    /// `traverse(record_id, max_depth)` — breadth-first; first discovery of
    /// a node wins its recorded depth and strength (no re-visiting via a
    /// longer path).
    pub fn traverse(&self, record_id: Uuid, max_depth: usize) -> Result<Vec<TraversalHit>> {
        let inner = self.lock()?;
        let mut visited = HashSet::new();
        visited.insert(record_id);
        let mut queue = VecDeque::new();
        queue.push_back((record_id, 0usize, 1.0f32, RelationType::References));
        let mut out = Vec::new();

        while let Some((current, depth, strength, via)) = queue.pop_front() {
            if current != record_id {
                out.push(TraversalHit { record_id: current, depth, strength, via });
            }
            if depth >= max_depth {
                continue;
            }
            let Some(node) = inner.nodes.get(&current) else { continue };
            for edge in &node.out_edges {
                if visited.insert(edge.to) {
                    queue.push_back((edge.to, depth + 1, strength * edge.strength, edge.relation));
                }
            }
        }
        Ok(out)
    }

    /// `strongly_connected(record_id)` — record_ids with both an outgoing
    /// edge to, and an incoming edge from, `record_id` (§4.4).
    pub fn strongly_connected(&self, record_id: &Uuid) -> Result<Vec<Uuid>> {
        let inner = self.lock()?;
        let Some(node) = inner.nodes.get(record_id) else { return Ok(Vec::new()) };
        let out_targets: HashSet<Uuid> = node.out_edges.iter().map(|e| e.to).collect();
        let in_sources: HashSet<Uuid> = node.in_edges.iter().copied().collect();
        Ok(out_targets.intersection(&in_sources).copied().collect())
    }

    /// `delete_edge(from, to)` — removes the first matching edge pair; fails
    /// `NotFound` if none exists (§4.4).
    pub fn delete_edge(&self, from: Uuid, to: Uuid) -> Result<()> {
        let mut inner = self.lock()?;
        let removed = inner
            .nodes
            .get_mut(&from)
            .and_then(|node| node.out_edges.iter().position(|e| e.to == to).map(|pos| node.out_edges.remove(pos)))
            .is_some();
        if !removed {
            return Err(SubstrateError::NotFound(format!("no edge from {from} to {to}")));
        }
        if let Some(node) = inner.nodes.get_mut(&to) {
            if let Some(pos) = node.in_edges.iter().position(|&id| id == from) {
                node.in_edges.remove(pos);
            }
        }
        Ok(())
    }

    pub fn delete_node(&self, id: &Uuid) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(node) = inner.nodes.remove(id) else { return Ok(()) };
        for in_id in &node.in_edges {
            if let Some(n) = inner.nodes.get_mut(in_id) {
                n.out_edges.retain(|e| e.to != *id);
            }
        }
        for edge in &node.out_edges {
            if let Some(n) = inner.nodes.get_mut(&edge.to) {
                n.in_edges.retain(|&from| from != *id);
            }
        }
        Ok(())
    }

    /// Damped random-walk centrality (d=0.85, 20 iterations), normalized so
    /// the highest-scoring node is 1.0 (§4.4).
    pub fn centrality(&self) -> Result<HashMap<Uuid, f32>> {
        const DAMPING: f32 = 0.85;
        const ITERATIONS: usize = 20;

        let inner = self.lock()?;
        let ids: Vec<Uuid> = inner.nodes.keys().copied().collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let n = ids.len() as f32;
        let mut scores: HashMap<Uuid, f32> = ids.iter().map(|id| (*id, 1.0 / n)).collect();

        for _ in 0..ITERATIONS {
            let mut next: HashMap<Uuid, f32> = ids.iter().map(|id| (*id, (1.0 - DAMPING) / n)).collect();
            for id in &ids {
                let node = &inner.nodes[id];
                let out_degree = node.out_edges.len() as f32;
                if out_degree == 0.0 {
                    continue;
                }
                let share = scores[id] / out_degree;
                for edge in &node.out_edges {
                    *next.entry(edge.to).or_insert(0.0) += DAMPING * share * edge.strength;
                }
            }
            scores = next;
        }

        let max = scores.values().cloned().fold(0f32, f32::max);
        if max > 0.0 {
            for v in scores.values_mut() {
                *v /= max;
            }
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_reflects_added_edges() {
        let graph = AssociationGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph.add_edge(a, b, RelationType::Elaborates, None, 0.7).unwrap();
        let related = graph.related(&a).unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].to, b);
        assert_eq!(related[0].label, "elaborates");
    }

    #[test]
    fn add_edge_custom_label_overrides_default() {
        let graph = AssociationGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph.add_edge(a, b, RelationType::Custom, Some("mentions".to_string()), 0.5).unwrap();
        let related = graph.related(&a).unwrap();
        assert_eq!(related[0].label, "mentions");
    }

    #[test]
    fn traverse_respects_max_depth() {
        let graph = AssociationGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        graph.add_edge(a, b, RelationType::Sequential, None, 1.0).unwrap();
        graph.add_edge(b, c, RelationType::Sequential, None, 1.0).unwrap();
        let hits = graph.traverse(a, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, b);

        let hits2 = graph.traverse(a, 2).unwrap();
        assert_eq!(hits2.len(), 2);
    }

    #[test]
    fn self_loop_rejected() {
        let graph = AssociationGraph::new();
        let a = Uuid::new_v4();
        let err = graph.add_edge(a, a, RelationType::References, None, 0.5).unwrap_err();
        assert_eq!(err.code(), "BadInput");
    }

    #[test]
    fn centrality_favors_highly_referenced_node() {
        let graph = AssociationGraph::new();
        let hub = Uuid::new_v4();
        for _ in 0..5 {
            let leaf = Uuid::new_v4();
            graph.add_edge(leaf, hub, RelationType::References, None, 1.0).unwrap();
        }
        let scores = graph.centrality().unwrap();
        let hub_score = scores[&hub];
        assert!(scores.values().all(|&s| s <= hub_score + 1e-6));
    }

    #[test]
    fn delete_node_removes_dangling_edges() {
        let graph = AssociationGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph.add_edge(a, b, RelationType::References, None, 0.5).unwrap();
        graph.delete_node(&b).unwrap();
        assert!(graph.related(&a).unwrap().is_empty());
    }

    #[test]
    fn strongly_connected_requires_both_directions() {
        let graph = AssociationGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        graph.add_edge(a, b, RelationType::References, None, 0.5).unwrap();
        graph.add_edge(b, a, RelationType::References, None, 0.5).unwrap();
        graph.add_edge(a, c, RelationType::References, None, 0.5).unwrap();
        let mutual = graph.strongly_connected(&a).unwrap();
        assert_eq!(mutual, vec![b]);
    }

    #[test]
    fn delete_edge_removes_only_first_match_and_fails_when_absent() {
        let graph = AssociationGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph.add_edge(a, b, RelationType::Causal, None, 0.4).unwrap();
        graph.add_edge(a, b, RelationType::Similar, None, 0.9).unwrap();
        graph.delete_edge(a, b).unwrap();
        let remaining = graph.related(&a).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].relation, RelationType::Similar);

        graph.delete_edge(a, b).unwrap();
        let err = graph.delete_edge(a, b).unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }
}
