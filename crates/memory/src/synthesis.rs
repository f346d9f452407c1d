//! Synthesis layer (Component E, §4.5) — fuses keyword, vector, and graph
//! signals into one ranked result set, and drives per-turn context
//! assembly.
//!
//! Per-source scoring and the weighted-sum combination follow the teacher's
//! `score_entry_ref` shape (normalize each signal to `[0,1]`, weight, sum,
//! rank); reciprocal-rank fusion is the alternative algorithm borrowed from
//! `stratadb-labs-strata-core`'s `Fuser` trait split (`SimpleFuser` vs an
//! RRF fuser) — offered here as an `Algorithm` enum rather than a trait
//! object since there are exactly two and neither substrate needs to add a
//! third at runtime.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::access::check_read;
use crate::audit::AuditLog;
use crate::compressed::CompressedTier;
use crate::error::Result;
use crate::graph::AssociationGraph;
use crate::index::IndexRow;
use crate::schema::{truncate_str, Isolation, Record};
use crate::store::PrimaryStore;
use crate::teams::TeamRegistry;
use crate::vector::VectorIndex;

const RRF_K: f32 = 60.0;
/// `max_results × k` candidates are pulled per source before fusion (§4.5).
const CANDIDATE_FANOUT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Weighted,
    RankFusion,
}

#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub use_fts: bool,
    pub use_vector: bool,
    pub use_graph: bool,
    pub use_working: bool,
    /// Whether Compressed Tier summaries are folded into candidates — on by
    /// default, opt out per §4.6 ("unless the caller opts out").
    pub use_compressed: bool,
    pub w_fts: f32,
    pub w_vector: f32,
    pub w_graph: f32,
    pub w_working: f32,
    /// Weight applied to Compressed Tier hits — lower than the live sources
    /// by default since a summary stands in for a whole archived cluster
    /// (§4.6: "at lower weight").
    pub w_compressed: f32,
    pub similarity_threshold: f32,
    pub max_results: usize,
    pub algorithm: Algorithm,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            use_fts: true,
            use_vector: true,
            use_graph: true,
            use_working: true,
            use_compressed: true,
            w_fts: 0.2,
            w_vector: 0.4,
            w_graph: 0.3,
            w_working: 0.1,
            w_compressed: 0.1,
            similarity_threshold: 0.3,
            max_results: 6,
            algorithm: Algorithm::Weighted,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SourceHits {
    fts: Option<f32>,
    vector: Option<f32>,
    graph: Option<f32>,
    working: Option<f32>,
    compressed: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub record: Record,
    pub combined_score: f32,
    pub from_fts: bool,
    pub from_vector: bool,
    pub from_graph: bool,
    pub from_working: bool,
    pub from_compressed: bool,
}

pub struct RecallInputs<'a> {
    pub store: &'a PrimaryStore,
    pub vector: &'a VectorIndex,
    pub graph: &'a AssociationGraph,
    pub teams: &'a TeamRegistry,
    pub audit: &'a AuditLog,
    pub compressed: &'a CompressedTier,
}

/// `synthesis_recall(requester, owner, query, query_embedding, seed_record, options)`.
#[allow(clippy::too_many_arguments)]
pub async fn recall(
    requester: &str,
    owner: &str,
    query: &str,
    query_embedding: Option<&[f32]>,
    seed_record: Option<Uuid>,
    options: &RecallOptions,
    inputs: &RecallInputs<'_>,
) -> Result<Vec<SynthesisResult>> {
    let fanout = options.max_results.max(1) * CANDIDATE_FANOUT;
    let mut candidates: HashMap<Uuid, SourceHits> = HashMap::new();
    // Compressed Tier hits don't have a record_id the store can hydrate —
    // each summary becomes a synthetic record keyed by its own summary_id.
    let mut synthetic: HashMap<Uuid, Record> = HashMap::new();

    if options.use_fts {
        let mut hits = inputs.store.search_fts_raw(owner, query, fanout)?;
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (rank, (id, _)) in hits.into_iter().enumerate() {
            candidates.entry(id).or_default().fts = Some(1.0 / (1.0 + rank as f32));
        }
    }

    if options.use_vector {
        if let Some(embedding) = query_embedding {
            // Candidate gathering stays unthresholded here; the combined
            // score is what gets compared against `similarity_threshold`
            // below (§4.5 step 5).
            for (id, cos) in inputs.vector.search(embedding, fanout, 32, -1.0)? {
                candidates.entry(id).or_default().vector = Some(cos.max(0.0));
            }
        }
    }

    if options.use_graph {
        if let Some(seed) = seed_record {
            for hit in inputs.graph.traverse(seed, 2)? {
                let entry = candidates.entry(hit.record_id).or_default();
                entry.graph = Some(entry.graph.unwrap_or(0.0).max(hit.strength));
            }
        }
    }

    let mut working_rows: Vec<IndexRow> = Vec::new();
    if options.use_working {
        working_rows = inputs.store.rows_for_owner(owner)?;
        working_rows.truncate(fanout);
        let now = Utc::now();
        for row in &working_rows {
            candidates.entry(row.record_id).or_default().working = Some(recency_score(now, row.created_at));
        }
    }

    if options.use_compressed {
        let query_terms: Vec<String> = query.split_whitespace().map(|w| w.to_lowercase()).collect();
        for summary in inputs.compressed.load(owner).await? {
            let score = term_overlap_score(&query_terms, &summary.summary_text);
            if score <= 0.0 {
                continue;
            }
            let record = Record::create(
                owner,
                summary.dominant_type,
                summary.summary_text.clone(),
                summary.aggregated_importance,
                None,
                None,
                Isolation::Private,
                None,
            )?;
            let id = summary.summary_id;
            candidates.entry(id).or_default().compressed = Some(score);
            synthetic.insert(id, record);
        }
    }

    let enabled_weight = [
        options.use_fts.then_some(options.w_fts),
        options.use_vector.then_some(options.w_vector),
        options.use_graph.then_some(options.w_graph),
        options.use_working.then_some(options.w_working),
        options.use_compressed.then_some(options.w_compressed),
    ]
    .into_iter()
    .flatten()
    .sum::<f32>();

    let mut scored: Vec<(Uuid, f32, SourceHits)> = match options.algorithm {
        Algorithm::Weighted => candidates
            .into_iter()
            .map(|(id, hits)| {
                let combined = hits.fts.unwrap_or(0.0) * options.w_fts
                    + hits.vector.unwrap_or(0.0) * options.w_vector
                    + hits.graph.unwrap_or(0.0) * options.w_graph
                    + hits.working.unwrap_or(0.0) * options.w_working
                    + hits.compressed.unwrap_or(0.0) * options.w_compressed;
                (id, combined, hits)
            })
            .filter(|(_, combined, _)| *combined >= options.similarity_threshold * enabled_weight)
            .collect(),
        Algorithm::RankFusion => {
            let ranks_of = |scores: &HashMap<Uuid, SourceHits>, pick: fn(&SourceHits) -> Option<f32>| -> HashMap<Uuid, usize> {
                let mut v: Vec<(Uuid, f32)> = scores.iter().filter_map(|(id, h)| pick(h).map(|s| (*id, s))).collect();
                v.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                v.into_iter().enumerate().map(|(rank, (id, _))| (id, rank)).collect()
            };
            let fts_ranks = ranks_of(&candidates, |h| h.fts);
            let vector_ranks = ranks_of(&candidates, |h| h.vector);
            let graph_ranks = ranks_of(&candidates, |h| h.graph);
            let working_ranks = ranks_of(&candidates, |h| h.working);
            let compressed_ranks = ranks_of(&candidates, |h| h.compressed);
            candidates
                .into_iter()
                .map(|(id, hits)| {
                    let mut combined = 0.0;
                    if let Some(r) = fts_ranks.get(&id) {
                        combined += 1.0 / (RRF_K + *r as f32 + 1.0);
                    }
                    if let Some(r) = vector_ranks.get(&id) {
                        combined += 1.0 / (RRF_K + *r as f32 + 1.0);
                    }
                    if let Some(r) = graph_ranks.get(&id) {
                        combined += 1.0 / (RRF_K + *r as f32 + 1.0);
                    }
                    if let Some(r) = working_ranks.get(&id) {
                        combined += 1.0 / (RRF_K + *r as f32 + 1.0);
                    }
                    if let Some(r) = compressed_ranks.get(&id) {
                        combined += (1.0 / (RRF_K + *r as f32 + 1.0)) * options.w_compressed;
                    }
                    (id, combined, hits)
                })
                .collect()
        }
    };

    let mut out = Vec::with_capacity(scored.len());
    for (id, combined, hits) in scored.drain(..) {
        let record = match synthetic.get(&id) {
            Some(r) => r.clone(),
            None => match inputs.store.get(&id).await? {
                Some(r) => r,
                None => continue,
            },
        };
        if !check_read(requester, &record, inputs.teams, inputs.audit) {
            continue;
        }
        out.push(SynthesisResult {
            combined_score: combined,
            from_fts: hits.fts.is_some(),
            from_vector: hits.vector.is_some(),
            from_graph: hits.graph.is_some(),
            from_working: hits.working.is_some(),
            from_compressed: hits.compressed.is_some(),
            record,
        });
    }

    out.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.importance.partial_cmp(&a.record.importance).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
    });
    out.truncate(options.max_results);
    Ok(out)
}

fn recency_score(now: chrono::DateTime<Utc>, created_at: chrono::DateTime<Utc>) -> f32 {
    let age_hours = (now - created_at).num_seconds().max(0) as f32 / 3600.0;
    1.0 / (1.0 + (age_hours / 48.0))
}

/// Fraction of `query_terms` that appear (case-insensitively) in `text` —
/// the Compressed Tier has no full-text index of its own, so this is a
/// cheap stand-in for an FTS score against summary text.
fn term_overlap_score(query_terms: &[String], text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let hits = query_terms.iter().filter(|term| lower.contains(term.as_str())).count();
    hits as f32 / query_terms.len() as f32
}

#[derive(Debug, Clone)]
pub struct SurfacedRecord {
    pub record_id: Uuid,
    pub preview: String,
    pub topic_hint: String,
    pub from_fts: bool,
    pub from_vector: bool,
    pub from_graph: bool,
    pub from_working: bool,
    pub from_compressed: bool,
}

#[derive(Debug, Clone)]
pub struct TurnContext {
    pub turn_text: String,
    pub turn_number: u64,
    pub surfaced: Vec<SurfacedRecord>,
    pub token_estimate: usize,
    pub fill_ratio: f32,
    pub summary: String,
}

const PREVIEW_CHARS: usize = 160;
const TOPIC_HINT_WORDS: usize = 8;

/// `turn_context(requester, owner, turn_text, turn_number)` — fixed-weight
/// recall tuned for per-turn injection (§4.5). Empty surfaced set is
/// success, not an error.
#[allow(clippy::too_many_arguments)]
pub async fn turn_context(
    requester: &str,
    owner: &str,
    turn_text: &str,
    turn_number: u64,
    query_embedding: Option<&[f32]>,
    seed_record: Option<Uuid>,
    inputs: &RecallInputs<'_>,
    token_budget: usize,
) -> Result<TurnContext> {
    let options = RecallOptions::default();
    let results = recall(requester, owner, turn_text, query_embedding, seed_record, &options, inputs).await?;

    let surfaced: Vec<SurfacedRecord> = results
        .iter()
        .map(|r| SurfacedRecord {
            record_id: r.record.record_id,
            preview: truncate_str(&r.record.content, PREVIEW_CHARS),
            topic_hint: r.record.content.split_whitespace().take(TOPIC_HINT_WORDS).collect::<Vec<_>>().join(" "),
            from_fts: r.from_fts,
            from_vector: r.from_vector,
            from_graph: r.from_graph,
            from_working: r.from_working,
            from_compressed: r.from_compressed,
        })
        .collect();

    let token_estimate = (turn_text.len() / 4) + surfaced.iter().map(|s| s.preview.len() / 4).sum::<usize>();
    let fill_ratio = if token_budget == 0 { 0.0 } else { (token_estimate as f32 / token_budget as f32).min(1.0) };

    let from_fts = surfaced.iter().filter(|s| s.from_fts).count();
    let from_vector = surfaced.iter().filter(|s| s.from_vector).count();
    let from_graph = surfaced.iter().filter(|s| s.from_graph).count();
    let from_working = surfaced.iter().filter(|s| s.from_working).count();
    let from_compressed = surfaced.iter().filter(|s| s.from_compressed).count();
    let summary = format!(
        "surfaced {} records for turn {turn_number} ({from_fts} fts, {from_vector} vector, {from_graph} graph, {from_working} working, {from_compressed} compressed)",
        surfaced.len()
    );

    Ok(TurnContext {
        turn_text: turn_text.to_string(),
        turn_number,
        surfaced,
        token_estimate,
        fill_ratio,
        summary,
    })
}

/// `turn_reinforce(accessed_ids)` — bump access counters for every id the
/// caller reports as actually used in the turn.
pub fn turn_reinforce(store: &PrimaryStore, accessed_ids: &[Uuid]) -> Result<usize> {
    let mut touched = 0;
    for id in accessed_ids {
        store.touch(id)?;
        touched += 1;
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::ContentStore;
    use crate::index::StructuredIndex;
    use crate::schema::{Isolation, RecordType};

    async fn fixture() -> (PrimaryStore, VectorIndex, AssociationGraph, TeamRegistry, AuditLog, CompressedTier, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::open(dir.path().join("content"), 1 << 20).await.unwrap();
        let index = StructuredIndex::open(dir.path().join("index.db")).unwrap();
        let store = PrimaryStore::new(content, index);
        let vector = VectorIndex::new(8, 8, 32);
        let graph = AssociationGraph::new();
        let teams = TeamRegistry::open(dir.path().join("teams.db")).unwrap();
        let audit = AuditLog::open(dir.path().join("audit.jsonl"));
        let compressed = CompressedTier::open(dir.path().join("tier2.jsonl"));
        (store, vector, graph, teams, audit, compressed, dir)
    }

    #[tokio::test]
    async fn recall_surfaces_fts_match() {
        let (store, vector, graph, teams, audit, compressed, _dir) = fixture().await;
        let record = Record::create("alice", RecordType::Observation, "deployed the storage substrate today", 0.6, None, None, Isolation::Private, None).unwrap();
        store.insert(&record).await.unwrap();

        let inputs = RecallInputs { store: &store, vector: &vector, graph: &graph, teams: &teams, audit: &audit, compressed: &compressed };
        let options = RecallOptions { use_vector: false, use_graph: false, use_working: false, use_compressed: false, ..Default::default() };
        let results = recall("alice", "alice", "storage substrate", None, None, &options, &inputs).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].from_fts);
    }

    #[tokio::test]
    async fn recall_filters_inaccessible_records() {
        let (store, vector, graph, teams, audit, compressed, _dir) = fixture().await;
        let record = Record::create("alice", RecordType::Observation, "private substrate notes", 0.6, None, None, Isolation::Private, None).unwrap();
        store.insert(&record).await.unwrap();

        let inputs = RecallInputs { store: &store, vector: &vector, graph: &graph, teams: &teams, audit: &audit, compressed: &compressed };
        let options = RecallOptions { use_vector: false, use_graph: false, use_working: false, use_compressed: false, ..Default::default() };
        let results = recall("bob", "alice", "substrate notes", None, None, &options, &inputs).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn recall_surfaces_compressed_summary_at_reduced_weight() {
        let (store, vector, graph, teams, audit, compressed, _dir) = fixture().await;
        let members = vec![Record::create("alice", RecordType::Observation, "deployed the storage substrate to production", 0.7, None, None, Isolation::Private, None).unwrap()];
        compressed.archive("alice", &members, &crate::compressed::LeadSentenceSummarizer).await.unwrap();

        let inputs = RecallInputs { store: &store, vector: &vector, graph: &graph, teams: &teams, audit: &audit, compressed: &compressed };
        let options = RecallOptions { use_fts: false, use_vector: false, use_graph: false, use_working: false, ..Default::default() };
        let results = recall("alice", "alice", "storage substrate production", None, None, &options, &inputs).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].from_compressed);
    }

    #[tokio::test]
    async fn recall_excludes_compressed_summaries_when_opted_out() {
        let (store, vector, graph, teams, audit, compressed, _dir) = fixture().await;
        let members = vec![Record::create("alice", RecordType::Observation, "deployed the storage substrate to production", 0.7, None, None, Isolation::Private, None).unwrap()];
        compressed.archive("alice", &members, &crate::compressed::LeadSentenceSummarizer).await.unwrap();

        let inputs = RecallInputs { store: &store, vector: &vector, graph: &graph, teams: &teams, audit: &audit, compressed: &compressed };
        let options = RecallOptions { use_fts: false, use_vector: false, use_graph: false, use_working: false, use_compressed: false, ..Default::default() };
        let results = recall("alice", "alice", "storage substrate production", None, None, &options, &inputs).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn turn_context_is_success_when_empty() {
        let (store, vector, graph, teams, audit, compressed, _dir) = fixture().await;
        let inputs = RecallInputs { store: &store, vector: &vector, graph: &graph, teams: &teams, audit: &audit, compressed: &compressed };
        let ctx = turn_context("alice", "alice", "hello there", 1, None, None, &inputs, 1500).await.unwrap();
        assert!(ctx.surfaced.is_empty());
        assert_eq!(ctx.fill_ratio, ctx.token_estimate as f32 / 1500.0);
    }

    #[test]
    fn turn_reinforce_bumps_access_count() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (store, _vector, _graph, _teams, _audit, _compressed, _dir) = fixture().await;
            let record = Record::create("alice", RecordType::Observation, "note", 0.5, None, None, Isolation::Private, None).unwrap();
            store.insert(&record).await.unwrap();
            turn_reinforce(&store, &[record.record_id]).unwrap();
            let row = store.rows_for_owner("alice").unwrap();
            assert_eq!(row[0].access_count, 1);
        });
    }
}
