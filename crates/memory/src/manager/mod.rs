//! `SubstrateManager` — the central orchestrator tying every component to
//! the external operation surface (§6).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SubstrateManager                                            │
//! │                                                               │
//! │  PrimaryStore   (content files + structured index + FTS)      │
//! │  VectorIndex    (embeddings + ANN overlay)                    │
//! │  AssociationGraph (typed edges, centrality)                   │
//! │  CompressedTier (tier2 summaries)                             │
//! │  TeamRegistry   (teams.db)                                    │
//! │  AuditLog       (policy decisions, overlay failures)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod write_path;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::access::check_read;
use crate::audit::AuditLog;
use crate::compressed::{CompressedTier, LeadSentenceSummarizer, Summarizer};
use crate::consolidation::{self, ConsolidationReport};
use crate::content_store::ContentStore;
use crate::error::Result;
use crate::graph::{AssociationGraph, Edge, RelationType, TraversalHit};
use crate::index::StructuredIndex;
use crate::schema::{Emotion, FormationContext, Isolation, Record, RecordType, Tier};
use crate::store::PrimaryStore;
use crate::synthesis::{self, Algorithm, RecallInputs, RecallOptions, SynthesisResult, TurnContext};
use crate::teams::TeamRegistry;
use crate::vector::{Embedder, LocalHeuristicEmbedder, VectorIndex};

pub use write_path::WriteOutcome;

use substrate_config::SubstrateConfig;

/// Record counts broken out by tier and type (`record_stats`, §6).
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub total: usize,
    pub primary: usize,
    pub compressed: usize,
    pub observation: usize,
    pub decision: usize,
    pub question: usize,
    pub insight: usize,
    pub routine: usize,
    pub significant: usize,
    pub interesting: usize,
}

pub struct SubstrateManager {
    store: PrimaryStore,
    vector: VectorIndex,
    graph: AssociationGraph,
    compressed: CompressedTier,
    teams: TeamRegistry,
    audit: AuditLog,
    embedder: Arc<dyn Embedder>,
    config: SubstrateConfig,
}

impl SubstrateManager {
    /// Open a substrate rooted at `data_root`, laying out the per-owner
    /// directory structure from §6 ("Persisted layout"):
    /// `memory/tier1/content`, `memory/tier1/index/memories.db`,
    /// `memory/tier2`, `vectors/`, `teams.db`.
    pub async fn open(data_root: impl AsRef<Path>, config: SubstrateConfig) -> Result<Self> {
        let root = data_root.as_ref().to_path_buf();
        info!(root = %root.display(), "opening substrate");

        let content = ContentStore::open(tier1_content(&root), config.storage.segment_max_bytes).await?;
        let index = StructuredIndex::open(tier1_index(&root))?;
        let store = PrimaryStore::new(content, index);

        let vector = VectorIndex::new(config.vector.dimension, config.vector.m, config.vector.ef_construction);
        let graph = AssociationGraph::new();
        let compressed = CompressedTier::open(tier2_dir(&root).join("summaries.jsonl"));
        let teams = TeamRegistry::open(root.join("teams.db"))?;
        let audit = AuditLog::open(root.join("audit.jsonl"));
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHeuristicEmbedder::new(config.vector.dimension));

        Ok(Self { store, vector, graph, compressed, teams, audit, embedder, config })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn recall_inputs(&self) -> RecallInputs<'_> {
        RecallInputs { store: &self.store, vector: &self.vector, graph: &self.graph, teams: &self.teams, audit: &self.audit, compressed: &self.compressed }
    }

    // ── §4.1 Record & write path ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_record(
        &self,
        owner: &str,
        record_type: RecordType,
        content: &str,
        importance: f32,
        emotion: Option<Emotion>,
        formation_context: Option<FormationContext>,
        isolation: Isolation,
        team: Option<String>,
    ) -> Result<Record> {
        if isolation == Isolation::Team {
            if let Some(team_name) = &team {
                if !self.teams.is_member(team_name, owner) {
                    return Err(crate::error::SubstrateError::AccessDenied(format!(
                        "{owner} is not a member of team '{team_name}'"
                    )));
                }
            }
        }
        Record::create(owner, record_type, content, importance, emotion, formation_context, isolation, team)
    }

    pub async fn get_record(&self, requester: &str, record_id: &Uuid) -> Result<Record> {
        self.store.get_checked(requester, record_id, &self.teams, &self.audit).await
    }

    /// `query_records(requester, owner, predicate)` — hydrate matching rows
    /// and filter by `check_read` so a requester never sees a record they
    /// are not entitled to, even when querying someone else's owner scope.
    pub async fn query_records(
        &self,
        requester: &str,
        owner: &str,
        predicate: impl Fn(&crate::index::IndexRow) -> bool,
    ) -> Result<Vec<Record>> {
        let records = self.store.query(owner, |row| row.tier == Tier::Primary && predicate(row)).await?;
        Ok(records.into_iter().filter(|r| check_read(requester, r, &self.teams, &self.audit)).collect())
    }

    pub fn record_stats(&self, owner: &str) -> Result<MemoryStats> {
        let rows = self.store.rows_for_owner(owner)?;
        let mut stats = MemoryStats { total: rows.len(), ..Default::default() };
        for row in &rows {
            match row.tier {
                Tier::Primary => stats.primary += 1,
                Tier::Compressed => stats.compressed += 1,
            }
            match row.record_type {
                RecordType::Observation => stats.observation += 1,
                RecordType::Decision => stats.decision += 1,
                RecordType::Question => stats.question += 1,
                RecordType::Insight => stats.insight += 1,
                RecordType::Routine => stats.routine += 1,
                RecordType::Significant => stats.significant += 1,
                RecordType::Interesting => stats.interesting += 1,
            }
        }
        Ok(stats)
    }

    pub async fn rebuild_overlays(&self) -> Result<usize> {
        self.store.rebuild_overlays().await
    }

    // ── §4.6 Consolidation ───────────────────────────────────────────────

    pub async fn archive_old(&self, owner: &str, max_age_days: i64) -> Result<ConsolidationReport> {
        self.archive_old_with(owner, max_age_days, &LeadSentenceSummarizer).await
    }

    pub async fn archive_old_with(&self, owner: &str, max_age_days: i64, summarizer: &dyn Summarizer) -> Result<ConsolidationReport> {
        consolidation::consolidate(owner, max_age_days, &self.store, &self.compressed, &self.config.consolidation, summarizer).await
    }

    pub async fn compressed_summaries(&self, owner: &str) -> Result<Vec<crate::compressed::CompressedSummary>> {
        self.compressed.load(owner).await
    }

    // ── §4.4 Association graph ───────────────────────────────────────────

    pub fn graph_add_edge(&self, from: Uuid, to: Uuid, relation: RelationType, label: Option<String>, strength: f32) -> Result<()> {
        self.graph.add_edge(from, to, relation, label, strength)
    }

    pub fn graph_related(&self, record_id: &Uuid) -> Result<Vec<Edge>> {
        self.graph.related(record_id)
    }

    pub fn graph_traverse(&self, record_id: Uuid, max_depth: usize) -> Result<Vec<TraversalHit>> {
        self.graph.traverse(record_id, max_depth)
    }

    pub fn graph_strongly_connected(&self, record_id: &Uuid) -> Result<Vec<Uuid>> {
        self.graph.strongly_connected(record_id)
    }

    pub fn graph_delete_edge(&self, from: Uuid, to: Uuid) -> Result<()> {
        self.graph.delete_edge(from, to)
    }

    pub fn graph_centrality(&self) -> Result<std::collections::HashMap<Uuid, f32>> {
        let scores = self.graph.centrality()?;
        for (record_id, score) in &scores {
            let _ = self.store.set_centrality(record_id, *score);
        }
        Ok(scores)
    }

    // ── §4.3 Vector index ────────────────────────────────────────────────

    pub async fn vector_search(&self, query_text: &str, k: usize, threshold: f32) -> Result<Vec<(Uuid, f32)>> {
        let embedding = self.embedder.embed(query_text).await?;
        self.vector.search(&embedding, k, self.config.vector.ef_search, threshold)
    }

    pub fn vector_stats(&self) -> Result<crate::vector::VectorStats> {
        self.vector.stats()
    }

    /// `build_from_store` (§4.3 recovery) — re-embeds and re-inserts every
    /// record currently held by the primary store, replacing the vector
    /// overlay's contents wholesale.
    pub async fn rebuild_vector_index(&self) -> Result<usize> {
        let records = self.store.scan_all().await?;
        self.vector.build_from_store(&records, self.embedder.as_ref()).await
    }

    // ── §4.5 Synthesis ───────────────────────────────────────────────────

    pub async fn synthesis_recall(
        &self,
        requester: &str,
        owner: &str,
        query: &str,
        seed_record: Option<Uuid>,
        options: Option<RecallOptions>,
    ) -> Result<Vec<SynthesisResult>> {
        let options = options.unwrap_or_else(|| self.default_recall_options());
        let embedding = if options.use_vector { Some(self.embedder.embed(query).await?) } else { None };
        synthesis::recall(requester, owner, query, embedding.as_deref(), seed_record, &options, &self.recall_inputs()).await
    }

    fn default_recall_options(&self) -> RecallOptions {
        let synth = &self.config.synthesis;
        RecallOptions {
            use_fts: true,
            use_vector: true,
            use_graph: true,
            use_working: true,
            use_compressed: true,
            w_fts: synth.w_fts,
            w_vector: synth.w_vector,
            w_graph: synth.w_graph,
            w_working: synth.w_working,
            w_compressed: synth.w_compressed,
            similarity_threshold: synth.similarity_threshold,
            max_results: synth.max_results,
            algorithm: if synth.algorithm == "rank-fusion" { Algorithm::RankFusion } else { Algorithm::Weighted },
        }
    }

    pub async fn turn_context(
        &self,
        requester: &str,
        owner: &str,
        turn_text: &str,
        turn_number: u64,
        seed_record: Option<Uuid>,
    ) -> Result<TurnContext> {
        let embedding = self.embedder.embed(turn_text).await?;
        synthesis::turn_context(
            requester,
            owner,
            turn_text,
            turn_number,
            Some(&embedding),
            seed_record,
            &self.recall_inputs(),
            self.config.synthesis.turn_token_budget,
        )
        .await
    }

    pub fn turn_reinforce(&self, accessed_ids: &[Uuid]) -> Result<usize> {
        synthesis::turn_reinforce(&self.store, accessed_ids)
    }

    // ── §6 Team operations ───────────────────────────────────────────────

    pub fn team_create(&self, team_name: &str, owner: &str) -> Result<()> {
        self.teams.create(team_name, owner)
    }

    /// `team_join(team_name, ci, requested_by)` — the substrate's one
    /// explicit-grant event (Component J: "tracks explicit grants"):
    /// `requested_by` is vouching that `ci_id` may see everyone's
    /// `Isolation::Team` records for `team_name`.
    pub fn team_join(&self, team_name: &str, ci_id: &str, requested_by: &str) -> Result<()> {
        self.teams.join(team_name, ci_id, requested_by)?;
        self.audit.log_consent(requested_by, ci_id, &format!("granted '{ci_id}' membership in team '{team_name}'"));
        Ok(())
    }

    pub fn team_leave(&self, team_name: &str, ci_id: &str) -> Result<()> {
        self.teams.leave(team_name, ci_id)
    }

    pub fn team_delete(&self, team_name: &str, requester: &str) -> Result<()> {
        self.teams.delete(team_name, requester)
    }

    pub fn team_list_members(&self, team_name: &str) -> Result<std::collections::BTreeSet<String>> {
        self.teams.list_members(team_name)
    }

    pub fn team_list_for_ci(&self, ci_id: &str) -> Result<Vec<String>> {
        self.teams.list_for_ci(ci_id)
    }
}

fn tier1_content(root: &Path) -> PathBuf {
    root.join("memory").join("tier1").join("content")
}

fn tier1_index(root: &Path) -> PathBuf {
    root.join("memory").join("tier1").join("index").join("memories.db")
}

fn tier2_dir(root: &Path) -> PathBuf {
    root.join("memory").join("tier2")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (SubstrateManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SubstrateManager::open(dir.path(), SubstrateConfig::default()).await.unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn create_and_store_round_trips() {
        let (manager, _dir) = fixture().await;
        let record = manager
            .create_record("alice", RecordType::Observation, "hello substrate", 0.5, None, None, Isolation::Private, None)
            .unwrap();
        let outcome = manager.store_record(&record, false).await.unwrap();
        assert!(outcome.primary_ok);

        let fetched = manager.get_record("alice", &record.record_id).await.unwrap();
        assert_eq!(fetched.content, "hello substrate");
    }

    #[tokio::test]
    async fn access_denied_on_private_record_for_other_ci() {
        let (manager, _dir) = fixture().await;
        let record = manager
            .create_record("alice", RecordType::Observation, "secret", 0.5, None, None, Isolation::Private, None)
            .unwrap();
        manager.store_record(&record, false).await.unwrap();

        let err = manager.get_record("bob", &record.record_id).await.unwrap_err();
        assert_eq!(err.code(), "AccessDenied");
    }

    #[tokio::test]
    async fn team_isolation_requires_membership_to_create() {
        let (manager, _dir) = fixture().await;
        manager.team_create("eng", "alice").unwrap();
        let err = manager
            .create_record("bob", RecordType::Observation, "note", 0.5, None, None, Isolation::Team, Some("eng".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "AccessDenied");

        manager.team_join("eng", "bob", "alice").unwrap();
        let record = manager
            .create_record("bob", RecordType::Observation, "note", 0.5, None, None, Isolation::Team, Some("eng".to_string()))
            .unwrap();
        manager.store_record(&record, false).await.unwrap();

        let entries = manager.audit().load();
        assert!(entries.iter().any(|e| e.kind == crate::audit::AuditKind::Consent));
    }

    #[tokio::test]
    async fn record_stats_counts_by_type() {
        let (manager, _dir) = fixture().await;
        let a = manager.create_record("alice", RecordType::Decision, "a", 0.5, None, None, Isolation::Private, None).unwrap();
        let b = manager.create_record("alice", RecordType::Observation, "b", 0.5, None, None, Isolation::Private, None).unwrap();
        manager.store_record(&a, false).await.unwrap();
        manager.store_record(&b, false).await.unwrap();

        let stats = manager.record_stats("alice").unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.decision, 1);
        assert_eq!(stats.observation, 1);
    }

    #[tokio::test]
    async fn synthesis_recall_surfaces_stored_record() {
        let (manager, _dir) = fixture().await;
        let record = manager
            .create_record("alice", RecordType::Observation, "deployed the storage substrate", 0.6, None, None, Isolation::Private, None)
            .unwrap();
        manager.store_record(&record, false).await.unwrap();

        let results = manager.synthesis_recall("alice", "alice", "storage substrate", None, None).await.unwrap();
        assert!(results.iter().any(|r| r.record.record_id == record.record_id));
    }

    #[tokio::test]
    async fn graph_centrality_persists_into_index() {
        let (manager, _dir) = fixture().await;
        let a = manager.create_record("alice", RecordType::Observation, "a", 0.5, None, None, Isolation::Private, None).unwrap();
        let b = manager.create_record("alice", RecordType::Observation, "b", 0.5, None, None, Isolation::Private, None).unwrap();
        manager.store_record(&a, false).await.unwrap();
        manager.store_record(&b, false).await.unwrap();
        manager.graph_add_edge(a.record_id, b.record_id, RelationType::Elaborates, None, 0.9).unwrap();

        let scores = manager.graph_centrality().unwrap();
        assert!(scores.contains_key(&b.record_id));
    }
}
