//! Consolidation engine (Component F, §4.6) — detects recurring patterns,
//! preserves outliers, and archives the rest into the compressed tier.
//!
//! Heuristic, synchronous, no LLM — the same spirit as the teacher's passive
//! `distill()` pass (group by a cheap content signature, score by simple
//! arithmetic, log a one-line summary via `tracing`), built out around
//! Jaccard keyword clustering instead of exact-string repetition counting.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::compressed::{CompressedTier, Summarizer};
use crate::error::Result;
use crate::schema::{Record, Tier};
use crate::store::PrimaryStore;
use substrate_config::ConsolidationConfig;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that", "with", "from", "have",
    "you", "can", "its", "will", "but", "they", "all", "been", "also", "into", "more", "than",
    "when", "who", "what", "how", "out", "our", "new", "now",
];

fn pattern_tokens(content: &str) -> HashSet<String> {
    content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 4 && !STOP_WORDS.contains(t))
        .map(String::from)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

#[derive(Debug, Clone)]
pub struct PatternResult {
    pub pattern_id: Uuid,
    pub member_ids: Vec<Uuid>,
    pub outlier_ids: Vec<Uuid>,
    pub archived_ids: Vec<Uuid>,
    pub summary: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    pub processed: usize,
    pub patterns: Vec<PatternResult>,
    pub archived_for_low_importance: usize,
    pub archived_for_forgettable: usize,
}

/// `archive_old(owner, max_age_days)` — the consolidation engine's entry
/// point.
pub async fn consolidate(
    owner_id: &str,
    max_age_days: i64,
    store: &PrimaryStore,
    compressed: &CompressedTier,
    config: &ConsolidationConfig,
    summarizer: &dyn Summarizer,
) -> Result<ConsolidationReport> {
    let cutoff = Utc::now() - Duration::days(max_age_days);
    // Records already carrying a pattern_id — whether archived or kept in
    // PRIMARY as a preserved outlier — are excluded so a repeat pass never
    // re-clusters a former outlier or re-stamps an already-formed pattern
    // (§8: repeating consolidation with the same parameters must not
    // re-archive or lose anything already settled).
    let candidates = store
        .query(owner_id, |row| row.tier == Tier::Primary && row.created_at < cutoff && row.pattern_id.is_none())
        .await?;

    let mut report = ConsolidationReport { processed: candidates.len(), ..Default::default() };
    if candidates.is_empty() {
        return Ok(report);
    }

    let token_sets: Vec<HashSet<String>> = candidates.iter().map(|r| pattern_tokens(&r.content)).collect();
    let mut unassigned: Vec<usize> = (0..candidates.len()).collect();

    while let Some(&seed) = unassigned.first() {
        let mut cluster = vec![seed];
        unassigned.retain(|&i| i != seed);

        loop {
            let mut grew = false;
            let mut next_unassigned = Vec::new();
            for &candidate in &unassigned {
                let joins = cluster.iter().any(|&member| {
                    jaccard(&token_sets[member], &token_sets[candidate]) >= config.similarity_threshold
                        && temporally_close(candidates[member].created_at, candidates[candidate].created_at, config)
                });
                if joins {
                    cluster.push(candidate);
                    grew = true;
                } else {
                    next_unassigned.push(candidate);
                }
            }
            unassigned = next_unassigned;
            if !grew {
                break;
            }
        }

        if cluster.len() < config.min_pattern_size {
            // Not a pattern — leave these candidates for the low-importance
            // and forgettable archival passes below.
            continue;
        }

        let members: Vec<&Record> = cluster.iter().map(|&i| &candidates[i]).collect();
        let pattern = form_pattern(&members, config);
        for (member, is_outlier) in members.iter().zip(pattern.outlier_flags.iter()) {
            store.set_pattern(&member.record_id, pattern.pattern_id, *is_outlier, is_outlier.then(|| pattern.summary.clone()))?;
        }

        let to_archive: Vec<Record> = members
            .iter()
            .zip(pattern.outlier_flags.iter())
            .filter(|(_, outlier)| !**outlier)
            .map(|(m, _)| (*m).clone())
            .collect();
        if !to_archive.is_empty() {
            compressed.archive(owner_id, &to_archive, summarizer).await?;
            for record in &to_archive {
                store.archive(&record.record_id)?;
            }
        }

        debug!(pattern_id = %pattern.pattern_id, members = cluster.len(), archived = to_archive.len(), "consolidation: pattern formed");

        report.patterns.push(PatternResult {
            pattern_id: pattern.pattern_id,
            member_ids: members.iter().map(|m| m.record_id).collect(),
            outlier_ids: members
                .iter()
                .zip(pattern.outlier_flags.iter())
                .filter(|(_, o)| **o)
                .map(|(m, _)| m.record_id)
                .collect(),
            archived_ids: to_archive.iter().map(|m| m.record_id).collect(),
            summary: pattern.summary,
        });
    }

    // Records that never joined a pattern: archive if forgettable or
    // low-importance-and-stale.
    let patterned: HashSet<Uuid> = report.patterns.iter().flat_map(|p| p.member_ids.iter().copied()).collect();
    let mut forgettable_batch = Vec::new();
    let mut low_importance_batch = Vec::new();
    for record in &candidates {
        if patterned.contains(&record.record_id) {
            continue;
        }
        if record.marks.forgettable {
            forgettable_batch.push(record.clone());
        } else if record.importance < config.low_importance_threshold
            && record.access_count < config.low_importance_access_count_cutoff
        {
            low_importance_batch.push(record.clone());
        }
    }

    if !forgettable_batch.is_empty() {
        compressed.archive(owner_id, &forgettable_batch, summarizer).await?;
        for record in &forgettable_batch {
            store.archive(&record.record_id)?;
        }
        report.archived_for_forgettable = forgettable_batch.len();
    }
    if !low_importance_batch.is_empty() {
        compressed.archive(owner_id, &low_importance_batch, summarizer).await?;
        for record in &low_importance_batch {
            store.archive(&record.record_id)?;
        }
        report.archived_for_low_importance = low_importance_batch.len();
    }

    info!(
        owner = owner_id,
        processed = report.processed,
        patterns = report.patterns.len(),
        archived_forgettable = report.archived_for_forgettable,
        archived_low_importance = report.archived_for_low_importance,
        "consolidation pass complete"
    );

    Ok(report)
}

fn temporally_close(a: DateTime<Utc>, b: DateTime<Utc>, config: &ConsolidationConfig) -> bool {
    let newest = a.max(b);
    let window_days = if (Utc::now() - newest).num_days() < 30 {
        config.recent_cluster_window_days
    } else {
        config.aged_cluster_window_days
    };
    (a - b).num_days().abs() < window_days
}

struct Pattern {
    pattern_id: Uuid,
    outlier_flags: Vec<bool>,
    summary: String,
}

/// Outlier selection: earliest, latest, highest-importance, and (if distinct
/// enough) the emotionally most-divergent member (§4.6).
fn form_pattern(members: &[&Record], config: &ConsolidationConfig) -> Pattern {
    let pattern_id = Uuid::new_v4();
    let mut outliers = HashSet::new();

    let earliest = members.iter().enumerate().min_by_key(|(_, m)| m.created_at).map(|(i, _)| i);
    let latest = members.iter().enumerate().max_by_key(|(_, m)| m.created_at).map(|(i, _)| i);
    let highest_importance = members
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.importance.partial_cmp(&b.importance).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i);
    outliers.extend([earliest, latest, highest_importance].into_iter().flatten());

    let emotional: Vec<(usize, [f32; 3])> = members
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.emotion.map(|e| (i, [e.pleasure, e.arousal, e.dominance])))
        .collect();
    if !emotional.is_empty() {
        let n = emotional.len() as f32;
        let mean = emotional.iter().fold([0.0; 3], |acc, (_, e)| [acc[0] + e[0] / n, acc[1] + e[1] / n, acc[2] + e[2] / n]);
        if let Some((idx, distance)) = emotional
            .iter()
            .map(|(i, e)| {
                let d = ((e[0] - mean[0]).powi(2) + (e[1] - mean[1]).powi(2) + (e[2] - mean[2]).powi(2)).sqrt();
                (*i, d)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            if distance >= config.emotion_outlier_min_distance {
                outliers.insert(idx);
            }
        }
    }

    let archived = members.len() - outliers.len();
    let summary = format!("Pattern: {} occurrences ({archived} archived, {} preserved as outliers)", members.len(), outliers.len());

    Pattern {
        pattern_id,
        outlier_flags: (0..members.len()).map(|i| outliers.contains(&i)).collect(),
        summary,
    }
}
