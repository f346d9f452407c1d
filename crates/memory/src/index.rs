//! Structured index over the record model (Component B, §4.2).
//!
//! The content files (`content_store.rs`) are the source of truth for a
//! record's body; this index is a write-through `redb` side-index used for
//! everything that isn't "give me the bytes at this address" — owner
//! scans, full-text search, and theme lookup. It can always be rebuilt from
//! the content files via `rebuild_from_content_store` (mirrors the
//! teacher's `rebuild_from_log`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content_store::{ContentAddress, ContentStore};
use crate::error::Result;
use crate::schema::{Isolation, Marks, Record, RecordType, Tier};

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const OWNER_INDEX: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("owner_index");
const THEME_INDEX: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("theme_index");
const FTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("fts_content");

/// Compact, redb-resident projection of a [`Record`]. Does not carry the
/// content body — that lives only in the content files. Carries every field
/// §4.2 names for predicate filtering without touching a content file:
/// owner, timestamps, type, importance, marks, archive flag (`tier`),
/// centrality, and emotion intensity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRow {
    pub record_id: Uuid,
    pub owner_id: String,
    pub record_type: RecordType,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub importance: f32,
    pub centrality: f32,
    pub isolation: Isolation,
    pub team_name: Option<String>,
    pub tier: Tier,
    pub marks: Marks,
    /// PAD-magnitude of the record's tagged emotion, if any — the "emotion
    /// (intensity & type)" field §4.2 calls for; "type" is already carried
    /// by `record_type`, so only the scalar intensity is duplicated here.
    pub emotion_intensity: Option<f32>,
    pub address: ContentAddress,
    pub pattern_id: Option<Uuid>,
    pub pattern_is_outlier: bool,
    pub pattern_summary: Option<String>,
}

impl IndexRow {
    fn from_record(record: &Record, address: ContentAddress) -> Self {
        Self {
            record_id: record.record_id,
            owner_id: record.owner_id.clone(),
            record_type: record.record_type,
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
            access_count: record.access_count,
            importance: record.importance,
            centrality: record.centrality,
            isolation: record.isolation,
            team_name: record.team_name.clone(),
            tier: record.tier,
            marks: record.marks,
            emotion_intensity: record.emotion.map(|e| e.intensity()),
            address,
            pattern_id: record.pattern_membership.as_ref().map(|p| p.pattern_id),
            pattern_is_outlier: record.pattern_membership.as_ref().map(|p| p.is_outlier).unwrap_or(false),
            pattern_summary: record.pattern_membership.as_ref().and_then(|p| p.summary.clone()),
        }
    }
}

pub struct StructuredIndex {
    db: Database,
    path: PathBuf,
}

impl StructuredIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;
        {
            let tx = db.begin_write()?;
            tx.open_table(RECORDS_TABLE)?;
            tx.open_multimap_table(OWNER_INDEX)?;
            tx.open_multimap_table(THEME_INDEX)?;
            tx.open_table(FTS_TABLE)?;
            tx.commit()?;
        }
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index a freshly-stored record at its physical content address.
    pub fn insert(&self, record: &Record, address: ContentAddress) -> Result<()> {
        let id = record.record_id.to_string();
        let row = IndexRow::from_record(record, address);
        let bytes = bincode_encode(&row)?;

        let tx = self.db.begin_write()?;
        {
            let mut records = tx.open_table(RECORDS_TABLE)?;
            records.insert(id.as_str(), bytes.as_slice())?;
        }
        {
            let mut owners = tx.open_multimap_table(OWNER_INDEX)?;
            owners.insert(record.owner_id.as_str(), id.as_str())?;
        }
        {
            let mut themes = tx.open_multimap_table(THEME_INDEX)?;
            for theme in extract_themes(&record.content) {
                themes.insert(theme.as_str(), id.as_str())?;
            }
        }
        {
            let mut fts = tx.open_table(FTS_TABLE)?;
            fts.insert(id.as_str(), record.content.as_str())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, record_id: &Uuid) -> Result<Option<IndexRow>> {
        let id = record_id.to_string();
        let tx = self.db.begin_read()?;
        let records = tx.open_table(RECORDS_TABLE)?;
        match records.get(id.as_str())? {
            None => Ok(None),
            Some(v) => Ok(Some(bincode_decode(v.value())?)),
        }
    }

    /// Every row owned by `owner_id`, newest first.
    pub fn for_owner(&self, owner_id: &str) -> Result<Vec<IndexRow>> {
        let tx = self.db.begin_read()?;
        let owners = tx.open_multimap_table(OWNER_INDEX)?;
        let records = tx.open_table(RECORDS_TABLE)?;
        let mut out = Vec::new();
        for id in owners.get(owner_id)? {
            let id = id?;
            if let Some(bytes) = records.get(id.value())? {
                out.push(bincode_decode::<IndexRow>(bytes.value())?);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Record ids tagged with `theme`.
    pub fn for_theme(&self, theme: &str) -> Result<Vec<Uuid>> {
        let tx = self.db.begin_read()?;
        let themes = tx.open_multimap_table(THEME_INDEX)?;
        let mut out = Vec::new();
        for id in themes.get(theme)? {
            if let Ok(uuid) = Uuid::parse_str(id?.value()) {
                out.push(uuid);
            }
        }
        Ok(out)
    }

    /// Naive full-text search: token-overlap lexical score against the
    /// indexed copy of `content`, restricted to `owner_id`'s records.
    /// Grounded on the teacher's `lexical_relevance_score` (`retrieval.rs`).
    pub fn search_fts(&self, owner_id: &str, query: &str, limit: usize) -> Result<Vec<(Uuid, f32)>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.db.begin_read()?;
        let owners = tx.open_multimap_table(OWNER_INDEX)?;
        let fts = tx.open_table(FTS_TABLE)?;
        let mut scored = Vec::new();
        for id in owners.get(owner_id)? {
            let id = id?;
            let id_str = id.value();
            let Some(content) = fts.get(id_str)? else { continue };
            let score = lexical_relevance_score(&query_tokens, content.value());
            if score > 0.0 {
                if let Ok(uuid) = Uuid::parse_str(id_str) {
                    scored.push((uuid, score));
                }
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn record_touch(&self, record_id: &Uuid, access_count: u64, last_accessed_at: DateTime<Utc>) -> Result<()> {
        self.mutate(record_id, |row| {
            row.access_count = access_count;
            row.last_accessed_at = last_accessed_at;
        })
    }

    pub fn set_centrality(&self, record_id: &Uuid, centrality: f32) -> Result<()> {
        self.mutate(record_id, |row| row.centrality = centrality)
    }

    pub fn set_tier(&self, record_id: &Uuid, tier: Tier) -> Result<()> {
        self.mutate(record_id, |row| row.tier = tier)
    }

    pub fn set_pattern(&self, record_id: &Uuid, pattern_id: Uuid, is_outlier: bool, summary: Option<String>) -> Result<()> {
        self.mutate(record_id, |row| {
            row.pattern_id = Some(pattern_id);
            row.pattern_is_outlier = is_outlier;
            row.pattern_summary = summary;
        })
    }

    fn mutate(&self, record_id: &Uuid, f: impl FnOnce(&mut IndexRow)) -> Result<()> {
        let id = record_id.to_string();
        let tx = self.db.begin_write()?;
        {
            let mut records = tx.open_table(RECORDS_TABLE)?;
            let Some(bytes) = records.get(id.as_str())?.map(|v| v.value().to_vec()) else {
                return Ok(());
            };
            let mut row: IndexRow = bincode_decode(&bytes)?;
            f(&mut row);
            records.insert(id.as_str(), bincode_encode(&row)?.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove(&self, record_id: &Uuid) -> Result<()> {
        let id = record_id.to_string();
        let tx = self.db.begin_write()?;
        let owner = {
            let records = tx.open_table(RECORDS_TABLE)?;
            records.get(id.as_str())?.map(|v| bincode_decode::<IndexRow>(v.value())).transpose()?
        };
        {
            let mut records = tx.open_table(RECORDS_TABLE)?;
            records.remove(id.as_str())?;
        }
        if let Some(row) = owner {
            let mut owners = tx.open_multimap_table(OWNER_INDEX)?;
            owners.remove(row.owner_id.as_str(), id.as_str())?;
        }
        {
            let mut fts = tx.open_table(FTS_TABLE)?;
            fts.remove(id.as_str())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop and rebuild the entire index by replaying every content segment
    /// (maintenance op `rebuild_overlays`, grounded on the teacher's
    /// `rebuild_from_log`).
    pub async fn rebuild_from_content_store(&self, content_store: &ContentStore) -> Result<usize> {
        {
            let tx = self.db.begin_write()?;
            {
                let mut records = tx.open_table(RECORDS_TABLE)?;
                let keys: Vec<String> = records.iter()?.filter_map(|r| r.ok().map(|(k, _)| k.value().to_string())).collect();
                for k in &keys {
                    records.remove(k.as_str())?;
                }
            }
            {
                let mut owners = tx.open_multimap_table(OWNER_INDEX)?;
                let keys: Vec<String> = owners.iter()?.filter_map(|r| r.ok().map(|(k, _)| k.value().to_string())).collect();
                for k in &keys {
                    owners.remove_all(k.as_str())?;
                }
            }
            {
                let mut themes = tx.open_multimap_table(THEME_INDEX)?;
                let keys: Vec<String> = themes.iter()?.filter_map(|r| r.ok().map(|(k, _)| k.value().to_string())).collect();
                for k in &keys {
                    themes.remove_all(k.as_str())?;
                }
            }
            {
                let mut fts = tx.open_table(FTS_TABLE)?;
                let keys: Vec<String> = fts.iter()?.filter_map(|r| r.ok().map(|(k, _)| k.value().to_string())).collect();
                for k in &keys {
                    fts.remove(k.as_str())?;
                }
            }
            tx.commit()?;
        }

        let scanned = content_store.scan_all().await?;
        let count = scanned.len();
        for (record, address) in scanned {
            self.insert(&record, address)?;
        }
        tracing::info!(records = count, path = %self.path.display(), "structured index rebuilt from content store");
        Ok(count)
    }
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "to", "of", "in", "on",
    "for", "with", "that", "this", "it", "as", "at", "by", "be",
];

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Fraction of query tokens present in `content`, weighted by how many times
/// they occur — mirrors the teacher's lexical scoring in `retrieval.rs`.
fn lexical_relevance_score(query_tokens: &[String], content: &str) -> f32 {
    let content_tokens = tokenize(content);
    if content_tokens.is_empty() {
        return 0.0;
    }
    let hits = query_tokens
        .iter()
        .filter(|qt| content_tokens.iter().any(|ct| ct == *qt))
        .count();
    hits as f32 / query_tokens.len() as f32
}

/// Cheap theme extraction: the content's most distinctive tokens (longest
/// first, capped) stand in for a topic tag until a real keyword model is
/// wired up.
fn extract_themes(content: &str) -> Vec<String> {
    let mut tokens = tokenize(content);
    tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));
    tokens.dedup();
    tokens.into_iter().take(5).collect()
}

fn bincode_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| crate::error::SubstrateError::StorageFailure(format!("encode error: {e}")))
}

fn bincode_decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| crate::error::SubstrateError::StorageFailure(format!("decode error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RecordType;

    fn record(owner: &str, content: &str) -> Record {
        Record::create(owner, RecordType::Observation, content, 0.5, None, None, Isolation::Private, None).unwrap()
    }

    fn address() -> ContentAddress {
        ContentAddress { file_path: PathBuf::from("0000000001.seg"), offset: 0, len: 10 }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let index = StructuredIndex::open(dir.path().join("index.db")).unwrap();
        let r = record("alice", "the quick brown fox jumps");
        index.insert(&r, address()).unwrap();
        let row = index.get(&r.record_id).unwrap().unwrap();
        assert_eq!(row.owner_id, "alice");
    }

    #[test]
    fn for_owner_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let index = StructuredIndex::open(dir.path().join("index.db")).unwrap();
        let a = record("alice", "first record about rust programming");
        index.insert(&a, address()).unwrap();
        let b = record("alice", "second record about database storage");
        index.insert(&b, address()).unwrap();
        let rows = index.for_owner("alice").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record_id, b.record_id);
    }

    #[test]
    fn search_fts_finds_matching_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let index = StructuredIndex::open(dir.path().join("index.db")).unwrap();
        let r = record("alice", "deployed the storage substrate to production");
        index.insert(&r, address()).unwrap();
        let hits = index.search_fts("alice", "storage substrate", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, r.record_id);
    }

    #[test]
    fn remove_clears_owner_and_fts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let index = StructuredIndex::open(dir.path().join("index.db")).unwrap();
        let r = record("alice", "ephemeral note about weather");
        index.insert(&r, address()).unwrap();
        index.remove(&r.record_id).unwrap();
        assert!(index.get(&r.record_id).unwrap().is_none());
        assert!(index.for_owner("alice").unwrap().is_empty());
    }

    #[test]
    fn marks_and_emotion_intensity_are_indexed_without_the_content_file() {
        let dir = tempfile::tempdir().unwrap();
        let index = StructuredIndex::open(dir.path().join("index.db")).unwrap();
        let mut r = record("alice", "scratch note");
        r.marks.forgettable = true;
        r.emotion = Some(crate::schema::Emotion { pleasure: 0.6, arousal: 0.0, dominance: 0.0 });
        index.insert(&r, address()).unwrap();
        let row = index.get(&r.record_id).unwrap().unwrap();
        assert!(row.marks.forgettable);
        assert!((row.emotion_intensity.unwrap() - 0.6).abs() < 1e-6);
    }
}
