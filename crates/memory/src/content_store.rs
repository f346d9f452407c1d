//! Content files — the append-only physical store backing Component B
//! (§4.2). One or more segment files per owner; writes append, never
//! modify in place. The returned `(file_path, offset)` is the record's
//! physical address, looked up later by `read_content`.
//!
//! Crash-safety follows the teacher's event-log discipline: every append is
//! flushed and fsync'd before the write path considers it durable.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::schema::Record;

/// Physical address of a record's content within a segment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAddress {
    pub file_path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    record: Record,
}

/// Single-appender content store. `insert`/`read_content` are the only
/// surface; records are never modified in place (§4.2).
pub struct ContentStore {
    root: PathBuf,
    segment_max_bytes: u64,
    /// Serializes appends to the active segment — "single appender per
    /// segment" (§5).
    active: Mutex<ActiveSegment>,
}

struct ActiveSegment {
    path: PathBuf,
    len: u64,
}

impl ContentStore {
    pub async fn open(root: impl Into<PathBuf>, segment_max_bytes: u64) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let active = Self::latest_or_new_segment(&root).await?;
        Ok(Self {
            root,
            segment_max_bytes,
            active: Mutex::new(active),
        })
    }

    async fn latest_or_new_segment(root: &Path) -> Result<ActiveSegment> {
        let mut entries = tokio::fs::read_dir(root).await?;
        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("seg")
                && latest.as_ref().is_none_or(|l| path > *l)
            {
                latest = Some(path);
            }
        }
        let path = match latest {
            Some(p) => p,
            None => root.join("0000000001.seg"),
        };
        let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        Ok(ActiveSegment { path, len })
    }

    fn next_segment_path(root: &Path, current: &Path) -> PathBuf {
        let n: u64 = current
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        root.join(format!("{:010}.seg", n + 1))
    }

    /// Append `record`'s content frame, returning its physical address.
    pub async fn append(&self, record: &Record) -> Result<ContentAddress> {
        let frame = Frame { record: record.clone() };
        let mut bytes = serde_json::to_vec(&frame)?;
        bytes.push(b'\n');

        let mut active = self.active.lock().await;
        if active.len > 0 && active.len + bytes.len() as u64 > self.segment_max_bytes {
            active.path = Self::next_segment_path(&self.root, &active.path);
            active.len = 0;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active.path)
            .await?;
        let offset = active.len;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        active.len += bytes.len() as u64;

        Ok(ContentAddress {
            file_path: active.path.clone(),
            offset,
            len: bytes.len() as u64,
        })
    }

    /// `read_content(address)` — returns the record body at its physical
    /// address.
    pub async fn read_content(&self, address: &ContentAddress) -> Result<Record> {
        let mut file = tokio::fs::File::open(&address.file_path).await?;
        file.seek(SeekFrom::Start(address.offset)).await?;
        let mut buf = vec![0u8; address.len as usize];
        file.read_exact(&mut buf).await?;
        // Trailing newline is part of the frame length; trim before parsing.
        let trimmed = buf.strip_suffix(b"\n").unwrap_or(&buf);
        let frame: Frame = serde_json::from_slice(trimmed)?;
        Ok(frame.record)
    }

    /// Replays every record across every segment file, oldest segment
    /// first, in append order. Used by `rebuild_overlays` and by structured
    /// index recovery.
    pub async fn scan_all(&self) -> Result<Vec<(Record, ContentAddress)>> {
        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("seg") {
                segments.push(path);
            }
        }
        segments.sort();

        let mut out = Vec::new();
        for path in segments {
            let raw = tokio::fs::read(&path).await?;
            let mut offset: u64 = 0;
            for line in raw.split(|&b| b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let len = line.len() as u64 + 1;
                if let Ok(frame) = serde_json::from_slice::<Frame>(line) {
                    out.push((
                        frame.record,
                        ContentAddress {
                            file_path: path.clone(),
                            offset,
                            len,
                        },
                    ));
                }
                offset += len;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Isolation, RecordType};

    fn sample() -> Record {
        Record::create(
            "alice",
            RecordType::Observation,
            "hello world",
            0.5,
            None,
            None,
            Isolation::Private,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), 1 << 20).await.unwrap();
        let record = sample();
        let address = store.append(&record).await.unwrap();
        let read_back = store.read_content(&address).await.unwrap();
        assert_eq!(read_back.record_id, record.record_id);
        assert_eq!(read_back.content, "hello world");
    }

    #[tokio::test]
    async fn multiple_appends_preserve_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), 1 << 20).await.unwrap();
        let a = sample();
        let b = sample();
        let addr_a = store.append(&a).await.unwrap();
        let addr_b = store.append(&b).await.unwrap();
        assert!(addr_b.offset > addr_a.offset);
        assert_eq!(store.read_content(&addr_a).await.unwrap().record_id, a.record_id);
        assert_eq!(store.read_content(&addr_b).await.unwrap().record_id, b.record_id);
    }

    #[tokio::test]
    async fn segment_rollover_on_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny segment cap forces a rollover after the first record.
        let store = ContentStore::open(dir.path(), 16).await.unwrap();
        store.append(&sample()).await.unwrap();
        let addr2 = store.append(&sample()).await.unwrap();
        assert_eq!(addr2.file_path.file_name().unwrap(), "0000000002.seg");
    }

    #[tokio::test]
    async fn scan_all_recovers_every_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), 1 << 20).await.unwrap();
        for _ in 0..5 {
            store.append(&sample()).await.unwrap();
        }
        let scanned = store.scan_all().await.unwrap();
        assert_eq!(scanned.len(), 5);
    }
}
