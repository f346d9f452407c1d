//! Primary Store (Component B, §4.2) — content files plus structured index,
//! presented as the one object the write path and query operations touch.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::Duration;
use lru::LruCache;
use uuid::Uuid;

use crate::content_store::ContentStore;
use crate::error::{Result, SubstrateError};
use crate::index::{IndexRow, StructuredIndex};
use crate::schema::Record;

/// Number of hydrated `Record`s held in the hot-path LRU cache, avoiding a
/// content-file read on repeat `get`s of the same record (e.g. synthesis
/// recall re-fetching a record surfaced by more than one source).
const LRU_CAPACITY: usize = 256;

/// Snapshot of the hydration cache's hit/miss performance.
#[derive(Debug, Clone, Default)]
pub struct StoreCacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f32,
}

struct CacheCounters {
    hits: u64,
    misses: u64,
}

pub struct PrimaryStore {
    content: ContentStore,
    index: StructuredIndex,
    cache: Mutex<LruCache<Uuid, Record>>,
    counters: Mutex<CacheCounters>,
}

impl PrimaryStore {
    pub fn new(content: ContentStore, index: StructuredIndex) -> Self {
        Self {
            content,
            index,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap())),
            counters: Mutex::new(CacheCounters { hits: 0, misses: 0 }),
        }
    }

    /// Append `record` to its content segment and index it. Returns the
    /// record unchanged — callers already hold it.
    pub async fn insert(&self, record: &Record) -> Result<()> {
        let address = self.content.append(record).await?;
        self.index.insert(record, address)?;
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).put(record.record_id, record.clone());
        Ok(())
    }

    /// Fetch a record by id, hydrating its content from the segment file.
    /// Checks the LRU cache first since content files are immutable once
    /// written. Does not apply access control or bump `access_count` —
    /// callers that need those do so explicitly (`access.rs`, `touch`).
    pub async fn get(&self, record_id: &Uuid) -> Result<Option<Record>> {
        if let Some(cached) = self.cache.lock().unwrap_or_else(|p| p.into_inner()).get(record_id) {
            self.counters.lock().unwrap_or_else(|p| p.into_inner()).hits += 1;
            return Ok(Some(cached.clone()));
        }
        self.counters.lock().unwrap_or_else(|p| p.into_inner()).misses += 1;

        let Some(row) = self.index.get(record_id)? else {
            return Ok(None);
        };
        let record = self.content.read_content(&row.address).await?;
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).put(*record_id, record.clone());
        Ok(Some(record))
    }

    pub fn cache_stats(&self) -> StoreCacheStats {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let total = counters.hits + counters.misses;
        StoreCacheStats {
            capacity: LRU_CAPACITY,
            len: cache.len(),
            hits: counters.hits,
            misses: counters.misses,
            hit_rate_pct: if total == 0 { 0.0 } else { (counters.hits as f32 / total as f32) * 100.0 },
        }
    }

    /// `touch(record_id)` — bump access_count/last_accessed_at and persist
    /// the updated counters to the index (§3 invariant 2: monotone).
    /// The content file itself is never rewritten; counters live only in
    /// the index row.
    pub fn record_access(&self, record_id: &Uuid, access_count: u64, last_accessed_at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        self.index.record_touch(record_id, access_count, last_accessed_at)
    }

    pub fn set_centrality(&self, record_id: &Uuid, centrality: f32) -> Result<()> {
        self.index.set_centrality(record_id, centrality)
    }

    /// `turn_reinforce` primitive: bump one record's access_count/last_accessed_at
    /// without hydrating its content. No-op (not an error) if the record is gone.
    pub fn touch(&self, record_id: &Uuid) -> Result<()> {
        let Some(row) = self.index.get(record_id)? else { return Ok(()) };
        self.index.record_touch(record_id, row.access_count + 1, chrono::Utc::now())
    }

    /// Raw full-text search, forwarded from the structured index — used by
    /// the synthesis layer's FTS source.
    pub fn search_fts_raw(&self, owner_id: &str, query: &str, limit: usize) -> Result<Vec<(Uuid, f32)>> {
        self.index.search_fts(owner_id, query, limit)
    }

    pub fn archive(&self, record_id: &Uuid) -> Result<()> {
        self.index.set_tier(record_id, crate::schema::Tier::Compressed)
    }

    pub fn set_pattern(&self, record_id: &Uuid, pattern_id: Uuid, is_outlier: bool, summary: Option<String>) -> Result<()> {
        self.index.set_pattern(record_id, pattern_id, is_outlier, summary)
    }

    /// All index rows owned by `owner_id`, newest first — used by query and
    /// consolidation passes that only need metadata.
    pub fn rows_for_owner(&self, owner_id: &str) -> Result<Vec<IndexRow>> {
        self.index.for_owner(owner_id)
    }

    /// `query(owner, predicate)` — hydrate every row for `owner_id` matching
    /// `predicate`, content included.
    pub async fn query(&self, owner_id: &str, predicate: impl Fn(&IndexRow) -> bool) -> Result<Vec<Record>> {
        let rows = self.index.for_owner(owner_id)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows.into_iter().filter(|r| predicate(r)) {
            out.push(self.content.read_content(&row.address).await?);
        }
        Ok(out)
    }

    /// `find_similar(owner, text, min_importance, time_window_days)` — full
    /// text search restricted to an optional recency window and importance
    /// floor (§4.2).
    pub async fn find_similar(
        &self,
        owner_id: &str,
        text: &str,
        min_importance: f32,
        time_window_days: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(Record, f32)>> {
        let hits = self.index.search_fts(owner_id, text, limit.max(1) * 4)?;
        let cutoff = time_window_days.map(|d| chrono::Utc::now() - Duration::days(d));
        let mut out = Vec::new();
        for (record_id, score) in hits {
            let Some(row) = self.index.get(&record_id)? else { continue };
            if row.importance < min_importance {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if row.created_at < cutoff {
                    continue;
                }
            }
            let record = self.content.read_content(&row.address).await?;
            out.push((record, score));
        }
        out.truncate(limit);
        Ok(out)
    }

    pub fn remove(&self, record_id: &Uuid) -> Result<()> {
        self.index.remove(record_id)
    }

    pub async fn rebuild_overlays(&self) -> Result<usize> {
        self.index.rebuild_from_content_store(&self.content).await
    }

    /// Every record across every owner, in append order — the system of
    /// record a rebuildable overlay (vector index, association graph)
    /// replays from (§4.3 "build-from-store (for recovery)").
    pub async fn scan_all(&self) -> Result<Vec<Record>> {
        Ok(self.content.scan_all().await?.into_iter().map(|(record, _)| record).collect())
    }

    pub fn record_count(&self, owner_id: &str) -> Result<usize> {
        Ok(self.index.for_owner(owner_id)?.len())
    }

    /// Fetch a record enforcing access control on the direct-read path.
    pub async fn get_checked(
        &self,
        requester: &str,
        record_id: &Uuid,
        teams: &crate::teams::TeamRegistry,
        audit: &crate::audit::AuditLog,
    ) -> Result<Record> {
        let Some(record) = self.get(record_id).await? else {
            return Err(SubstrateError::NotFound(format!("record {record_id} not found")));
        };
        crate::access::check_read_or_deny(requester, &record, teams, audit)?;
        Ok(record)
    }
}
