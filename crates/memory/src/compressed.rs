//! Compressed Tier (Component G, §4.6) — where archived records end up:
//! one short summary standing in for a cluster of originals.
//!
//! Stored the same way the content files are (append-only JSONL segment,
//! flush + fsync per append) since a compressed-tier summary is, structurally,
//! just another small record that never changes once written.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::{Record, RecordType};

/// Produces the one-sentence summary stored for an archived cluster.
/// `Summarize` is the caller-pluggable seam (§4.6: "the same embedding-adjacent
/// capability or a caller-provided summarizer") — the default just takes the
/// highest-importance member's content, truncated.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, members: &[Record]) -> String;
}

pub struct LeadSentenceSummarizer;

impl Summarizer for LeadSentenceSummarizer {
    fn summarize(&self, members: &[Record]) -> String {
        let lead = members
            .iter()
            .max_by(|a, b| a.importance.partial_cmp(&b.importance).unwrap_or(std::cmp::Ordering::Equal));
        match lead {
            Some(record) => crate::schema::truncate_str(&record.content, 160),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedSummary {
    pub summary_id: Uuid,
    pub owner_id: String,
    pub summary_text: String,
    pub source_ids: Vec<Uuid>,
    pub time_range: (DateTime<Utc>, DateTime<Utc>),
    pub dominant_type: RecordType,
    pub aggregated_importance: f32,
    pub created_at: DateTime<Utc>,
}

pub struct CompressedTier {
    path: PathBuf,
}

impl CompressedTier {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive `members` as one summary (`archive_old` / consolidation
    /// archival policy, §4.6).
    pub async fn archive(&self, owner_id: &str, members: &[Record], summarizer: &dyn Summarizer) -> Result<CompressedSummary> {
        let mut counts = std::collections::HashMap::new();
        for m in members {
            *counts.entry(m.record_type).or_insert(0usize) += 1;
        }
        let dominant_type = counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(t, _)| t)
            .unwrap_or(RecordType::Observation);

        let earliest = members.iter().map(|m| m.created_at).min().unwrap_or_else(Utc::now);
        let latest = members.iter().map(|m| m.created_at).max().unwrap_or_else(Utc::now);
        let aggregated_importance = if members.is_empty() {
            0.0
        } else {
            members.iter().map(|m| m.importance).sum::<f32>() / members.len() as f32
        };

        let summary = CompressedSummary {
            summary_id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            summary_text: summarizer.summarize(members),
            source_ids: members.iter().map(|m| m.record_id).collect(),
            time_range: (earliest, latest),
            dominant_type,
            aggregated_importance,
            created_at: Utc::now(),
        };

        self.append(&summary).await?;
        Ok(summary)
    }

    async fn append(&self, summary: &CompressedSummary) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(summary)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn load(&self, owner_id: &str) -> Result<Vec<CompressedSummary>> {
        let Ok(raw) = tokio::fs::read_to_string(&self.path).await else {
            return Ok(Vec::new());
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<CompressedSummary>(line).ok())
            .filter(|s| s.owner_id == owner_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Isolation;

    fn record(content: &str, importance: f32) -> Record {
        Record::create("alice", RecordType::Observation, content, importance, None, None, Isolation::Private, None).unwrap()
    }

    #[tokio::test]
    async fn archive_produces_summary_with_source_ids() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CompressedTier::open(dir.path().join("tier2.jsonl"));
        let members = vec![record("low priority note", 0.2), record("high priority decision", 0.9)];
        let ids: Vec<Uuid> = members.iter().map(|m| m.record_id).collect();
        let summary = tier.archive("alice", &members, &LeadSentenceSummarizer).await.unwrap();
        assert_eq!(summary.source_ids, ids);
        assert!(summary.summary_text.contains("high priority"));
    }

    #[tokio::test]
    async fn load_returns_only_requested_owner() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CompressedTier::open(dir.path().join("tier2.jsonl"));
        tier.archive("alice", &[record("a", 0.5)], &LeadSentenceSummarizer).await.unwrap();
        let loaded = tier.load("bob").await.unwrap();
        assert!(loaded.is_empty());
        let loaded_alice = tier.load("alice").await.unwrap();
        assert_eq!(loaded_alice.len(), 1);
    }
}
