//! Vector Index (Component C, §4.3) — embeddings plus nearest-neighbor
//! search over them.
//!
//! Two search paths share one embedding table: brute-force (exact, O(n)) and
//! an approximate layered-proximity-graph index (`hnsw.rs`), grounded on the
//! graph-building approach in `stratadb-labs-strata-core`'s vector primitive
//! (beam search over per-layer neighbor sets, greedy descent from the top
//! layer) but reworked around `rand`'s geometric distribution for layer
//! assignment instead of a hand-rolled deterministic PRNG, since this
//! substrate has no determinism requirement to preserve.

mod hnsw;

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, SubstrateError};
use crate::schema::Record;
use hnsw::HnswGraph;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

/// Deterministic local fallback embedder: hashes overlapping word shingles
/// into a fixed-width bag, then L2-normalizes. No external calls, no API
/// key — used when `VectorConfig::api_key_env` resolves to nothing (§4.3
/// "Non-goals" excludes training a real embedding model, not having one).
pub struct LocalHeuristicEmbedder {
    dimension: usize,
}

impl LocalHeuristicEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for LocalHeuristicEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut bucket = vec![0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let h = fnv1a(token.as_bytes());
            let idx = (h as usize) % self.dimension;
            bucket[idx] += 1.0;
        }
        let norm = bucket.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut bucket {
                *v /= norm;
            }
        }
        Ok(bucket)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// External HTTP embedder (§4.3: "variants include... an external HTTP
/// embedder"). Reads its API key lazily, from the environment variable named
/// by `VectorConfig::api_key_env`, at construction rather than at the point
/// `substrate-config` itself loads — the config only carries the variable's
/// *name*, per SPEC_FULL.md's rule that secrets are resolved "at the point
/// the corresponding resource opens, not globally".
#[cfg(feature = "http-embedder")]
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    dimension: usize,
}

#[cfg(feature = "http-embedder")]
impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, api_key_env: &str, dimension: usize, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: std::env::var(api_key_env).ok(),
            dimension,
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

#[cfg(feature = "http-embedder")]
#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
}

#[cfg(feature = "http-embedder")]
#[derive(serde::Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[cfg(feature = "http-embedder")]
#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self.client.post(&self.endpoint).json(&EmbedRequest { input: text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SubstrateError::StorageFailure(format!("embedding request failed: {e}")))?;
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| SubstrateError::StorageFailure(format!("embedding response malformed: {e}")))?;
        if body.embedding.len() != self.dimension {
            return Err(SubstrateError::StorageFailure(format!(
                "embedding provider returned dimension {}, expected {}",
                body.embedding.len(),
                self.dimension
            )));
        }
        Ok(body.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)).clamp(-1.0, 1.0)
    }
}

/// Switches to the approximate index once the brute-force path would scan
/// more vectors than this.
const ANN_THRESHOLD: usize = 2_000;

/// Snapshot of the vector index's size (§4.3 `stats(nodes, max_layer, edges)`).
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorStats {
    pub nodes: usize,
    pub max_layer: usize,
    pub edges: usize,
}

pub struct VectorIndex {
    dimension: usize,
    m: usize,
    ef_construction: usize,
    embeddings: RwLock<HashMap<Uuid, Vec<f32>>>,
    /// Single insert mutex (§5) — inserts into the layered graph mutate
    /// shared neighbor lists and must be serialized. Reads (`search`) only
    /// take the `embeddings` read lock.
    graph: Mutex<HnswGraph>,
}

impl VectorIndex {
    pub fn new(dimension: usize, m: usize, ef_construction: usize) -> Self {
        Self {
            dimension,
            m,
            ef_construction,
            embeddings: RwLock::new(HashMap::new()),
            graph: Mutex::new(HnswGraph::new(m, ef_construction)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn insert(&self, id: Uuid, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(SubstrateError::bad_input(format!(
                "embedding has dimension {}, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        {
            let mut embeddings = self.embeddings.write().map_err(|_| lock_poisoned())?;
            embeddings.insert(id, vector.clone());
        }
        let embeddings = self.embeddings.read().map_err(|_| lock_poisoned())?;
        let mut graph = self.graph.lock().map_err(|_| lock_poisoned())?;
        graph.insert(id, &vector, &embeddings);
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) -> Result<()> {
        let mut embeddings = self.embeddings.write().map_err(|_| lock_poisoned())?;
        embeddings.remove(id);
        drop(embeddings);
        let mut graph = self.graph.lock().map_err(|_| lock_poisoned())?;
        graph.remove(id);
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.embeddings.read().map_err(|_| lock_poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// `stats()` — node/layer/edge counts for the ANN overlay (§4.3).
    pub fn stats(&self) -> Result<VectorStats> {
        let embeddings = self.embeddings.read().map_err(|_| lock_poisoned())?;
        let graph = self.graph.lock().map_err(|_| lock_poisoned())?;
        let (max_layer, edges) = graph.stats();
        Ok(VectorStats { nodes: embeddings.len(), max_layer, edges })
    }

    /// Drops every embedding and the ANN graph built over them, leaving an
    /// empty index ready for `build_from_store`.
    pub fn clear(&self) -> Result<()> {
        let mut embeddings = self.embeddings.write().map_err(|_| lock_poisoned())?;
        embeddings.clear();
        drop(embeddings);
        let mut graph = self.graph.lock().map_err(|_| lock_poisoned())?;
        *graph = HnswGraph::new(self.m, self.ef_construction);
        Ok(())
    }

    /// `build-from-store` (§4.3) — recovery path: re-embed and re-insert
    /// every record the primary store still holds. Records that fail to
    /// embed are skipped (embedding failure is recoverable, §4.3), not
    /// fatal to the rebuild.
    pub async fn build_from_store(&self, records: &[Record], embedder: &dyn Embedder) -> Result<usize> {
        self.clear()?;
        let mut rebuilt = 0;
        for record in records {
            if let Ok(vector) = embedder.embed(&record.content).await {
                self.insert(record.record_id, vector)?;
                rebuilt += 1;
            }
        }
        Ok(rebuilt)
    }

    /// Exact search, scanning every stored embedding, keeping only matches
    /// at or above `threshold` (§4.3: "return top k above a caller-supplied
    /// similarity threshold").
    pub fn brute_force_search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(Uuid, f32)>> {
        let embeddings = self.embeddings.read().map_err(|_| lock_poisoned())?;
        let mut scored: Vec<(Uuid, f32)> = embeddings
            .iter()
            .map(|(id, vec)| (*id, cosine_similarity(query, vec)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// `search(query, k, threshold)` — dispatches to the approximate
    /// layered-graph search once the corpus is large enough that brute force
    /// would be costly (§4.3), falling back to brute force for small corpora
    /// since ANN has no accuracy advantage there.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize, threshold: f32) -> Result<Vec<(Uuid, f32)>> {
        let embeddings = self.embeddings.read().map_err(|_| lock_poisoned())?;
        if embeddings.len() < ANN_THRESHOLD {
            drop(embeddings);
            return self.brute_force_search(query, k, threshold);
        }
        let graph = self.graph.lock().map_err(|_| lock_poisoned())?;
        let mut results = graph.search(query, k, ef_search, &embeddings);
        results.retain(|(_, score)| *score >= threshold);
        Ok(results)
    }
}

fn lock_poisoned() -> SubstrateError {
    SubstrateError::StorageFailure("vector index lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_embedder_produces_unit_vectors() {
        let embedder = LocalHeuristicEmbedder::new(64);
        let v = embedder.embed("hello world").await.unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn brute_force_search_ranks_nearest_first() {
        let index = VectorIndex::new(3, 16, 64);
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        index.insert(near, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(far, vec![0.0, 1.0, 0.0]).unwrap();
        let results = index.brute_force_search(&[0.9, 0.1, 0.0], 2, -1.0).unwrap();
        assert_eq!(results[0].0, near);
    }

    #[test]
    fn search_drops_matches_below_threshold() {
        let index = VectorIndex::new(3, 16, 64);
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        index.insert(near, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(far, vec![0.0, 1.0, 0.0]).unwrap();
        let results = index.search(&[1.0, 0.0, 0.0], 10, 32, 0.5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, near);
    }

    #[test]
    fn rejects_mismatched_dimension() {
        let index = VectorIndex::new(3, 16, 64);
        let err = index.insert(Uuid::new_v4(), vec![1.0, 0.0]).unwrap_err();
        assert_eq!(err.code(), "BadInput");
    }

    #[test]
    fn stats_reports_node_count() {
        let index = VectorIndex::new(3, 16, 64);
        index.insert(Uuid::new_v4(), vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(Uuid::new_v4(), vec![0.0, 1.0, 0.0]).unwrap();
        let stats = index.stats().unwrap();
        assert_eq!(stats.nodes, 2);
    }

    #[tokio::test]
    async fn build_from_store_repopulates_from_records() {
        let index = VectorIndex::new(64, 16, 64);
        index.insert(Uuid::new_v4(), vec![1.0; 64]).unwrap();
        assert_eq!(index.len().unwrap(), 1);

        let embedder = LocalHeuristicEmbedder::new(64);
        let records = vec![
            crate::schema::Record::create("alice", crate::schema::RecordType::Observation, "one", 0.5, None, None, crate::schema::Isolation::Private, None).unwrap(),
            crate::schema::Record::create("alice", crate::schema::RecordType::Observation, "two", 0.5, None, None, crate::schema::Isolation::Private, None).unwrap(),
        ];
        let rebuilt = index.build_from_store(&records, &embedder).await.unwrap();
        assert_eq!(rebuilt, 2);
        assert_eq!(index.len().unwrap(), 2);
    }

    #[cfg(feature = "http-embedder")]
    #[test]
    fn http_embedder_resolves_api_key_from_its_named_env_var() {
        let key = "SUBSTRATE_TEST_EMBEDDER_KEY";
        std::env::set_var(key, "secret-token");
        let embedder = HttpEmbedder::new("https://embeddings.example/v1/embed", key, 256, 30);
        assert_eq!(embedder.api_key(), Some("secret-token"));
        assert_eq!(embedder.dimension(), 256);
        std::env::remove_var(key);
    }

    #[cfg(feature = "http-embedder")]
    #[test]
    fn http_embedder_has_no_key_when_env_var_unset() {
        let embedder = HttpEmbedder::new("https://embeddings.example/v1/embed", "SUBSTRATE_TEST_EMBEDDER_KEY_UNSET", 256, 30);
        assert_eq!(embedder.api_key(), None);
    }
}
