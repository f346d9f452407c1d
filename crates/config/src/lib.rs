use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Per-owner filesystem layout under the data root.
///
/// `data_root` defaults to `./substrate-data` and is overridden at runtime by
/// the `SUBSTRATE_DATA_ROOT` environment variable when set (see
/// [`StorageConfig::resolved_root`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_root: String,
    /// Maximum bytes for a single content segment file before a new segment
    /// is started.
    pub segment_max_bytes: u64,
    /// Maximum `content` length accepted by `create_record` (bytes).
    pub max_content_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: "./substrate-data".to_string(),
            segment_max_bytes: 64 * 1024 * 1024,
            max_content_bytes: 16 * 1024,
        }
    }
}

impl StorageConfig {
    /// Resolve the effective data root: `SUBSTRATE_DATA_ROOT` wins over the
    /// configured value when set and non-empty.
    pub fn resolved_root(&self) -> PathBuf {
        match env::var("SUBSTRATE_DATA_ROOT") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => PathBuf::from(&self.data_root),
        }
    }
}

/// Tunables for the vector index / ANN layered-proximity-graph (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub dimension: usize,
    /// Target out-degree `M` per layer.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Embedding-provider API key env var name; the value itself is never
    /// stored in config.
    pub api_key_env: String,
    /// HTTP embedding provider endpoint, used only by the `http-embedder`
    /// feature's `HttpEmbedder`. Ignored by the default local heuristic
    /// encoder.
    pub embedding_endpoint: String,
    /// Hard timeout in seconds on an embedding HTTP call (§5: "embedding
    /// calls carry a 30-second hard timeout and return a recoverable
    /// failure on expiration").
    pub embedding_timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 256,
            m: 16,
            ef_construction: 64,
            ef_search: 32,
            api_key_env: "SUBSTRATE_EMBEDDING_API_KEY".to_string(),
            embedding_endpoint: String::new(),
            embedding_timeout_secs: 30,
        }
    }
}

/// Default fusion weights and thresholds for the synthesis layer (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub w_fts: f32,
    pub w_vector: f32,
    pub w_graph: f32,
    pub w_working: f32,
    /// Weight for Compressed Tier summary hits — lower than the live
    /// sources by default (§4.6: "automatically include G at lower
    /// weight, unless the caller opts out").
    pub w_compressed: f32,
    pub similarity_threshold: f32,
    pub max_results: usize,
    /// `weighted` or `rank-fusion`.
    pub algorithm: String,
    /// Approximate token budget for a per-turn context (§4.5).
    pub turn_token_budget: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            w_fts: 0.2,
            w_vector: 0.4,
            w_graph: 0.3,
            w_working: 0.1,
            w_compressed: 0.1,
            similarity_threshold: 0.3,
            max_results: 6,
            algorithm: "weighted".to_string(),
            turn_token_budget: 1500,
        }
    }
}

/// Consolidation engine policy (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub max_age_days: i64,
    /// Jaccard similarity threshold above which two records "cluster".
    pub similarity_threshold: f32,
    pub min_pattern_size: usize,
    /// Temporal window (days) for clusters whose newest member is younger
    /// than 30 days.
    pub recent_cluster_window_days: i64,
    /// Temporal window (days) for older clusters.
    pub aged_cluster_window_days: i64,
    /// Minimum distance from the cluster's mean emotion intensity for a
    /// member to qualify as the emotional outlier.
    pub emotion_outlier_min_distance: f32,
    /// Importance threshold `tau` for low-importance archival.
    pub low_importance_threshold: f32,
    pub low_importance_access_count_cutoff: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            similarity_threshold: 0.4,
            min_pattern_size: 3,
            recent_cluster_window_days: 7,
            aged_cluster_window_days: 30,
            emotion_outlier_min_distance: 0.2,
            low_importance_threshold: 0.3,
            low_importance_access_count_cutoff: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubstrateConfig {
    pub storage: StorageConfig,
    pub vector: VectorConfig,
    pub synthesis: SynthesisConfig,
    pub consolidation: ConsolidationConfig,
}

impl SubstrateConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("substrate.toml");

        let config = SubstrateConfig::default();
        config.save_to(&path)?;
        let loaded = SubstrateConfig::load_from(&path)?;

        assert_eq!(loaded.vector.dimension, config.vector.dimension);
        assert_eq!(loaded.synthesis.max_results, config.synthesis.max_results);
        Ok(())
    }

    #[test]
    fn missing_file_falls_back_to_defaults() -> Result<()> {
        let config = SubstrateConfig::load_from("/nonexistent/substrate.toml")?;
        assert_eq!(config.consolidation.min_pattern_size, 3);
        Ok(())
    }

    #[test]
    fn data_root_env_override_wins() {
        // SAFETY: test runs single-threaded w.r.t. this var within the process;
        // restored immediately after the assertion.
        unsafe {
            env::set_var("SUBSTRATE_DATA_ROOT", "/tmp/substrate-override");
        }
        let config = StorageConfig::default();
        assert_eq!(config.resolved_root(), PathBuf::from("/tmp/substrate-override"));
        unsafe {
            env::remove_var("SUBSTRATE_DATA_ROOT");
        }
    }
}
