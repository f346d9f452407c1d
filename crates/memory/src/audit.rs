//! Audit & consent log (Component J, §4.1, §7).
//!
//! Every policy decision and absorbed overlay failure produces an entry
//! here, sufficient to reconstruct what happened and why. Append-only
//! JSONL, same crash-safety discipline as the content segment files
//! (flush + fsync per append).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditKind {
    AccessDenied,
    OverlayFailure,
    Consent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub actor: String,
    pub subject: String,
    pub reason: String,
}

pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: AuditEntry) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(%err, "failed to create audit log directory");
                return;
            }
        }
        let line = match serde_json::to_string(&entry) {
            Ok(l) => l,
            Err(err) => {
                warn!(%err, "failed to serialize audit entry");
                return;
            }
        };
        use std::io::Write;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        match file {
            Ok(mut f) => {
                let _ = writeln!(f, "{line}");
                let _ = f.sync_all();
            }
            Err(err) => warn!(%err, path = %self.path.display(), "failed to open audit log"),
        }
    }

    pub fn log_denial(&self, requester: &str, record_id: &str, reason: &str) {
        self.append(AuditEntry {
            at: Utc::now(),
            kind: AuditKind::AccessDenied,
            actor: requester.to_string(),
            subject: record_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Records an absorbed overlay failure (§4.1 step 3/4, §7 kind 4) so the
    /// overlay can be reconstructed later via `rebuild_overlays`.
    pub fn log_overlay_failure(&self, record_id: &str, overlay: &str, reason: &str) {
        self.append(AuditEntry {
            at: Utc::now(),
            kind: AuditKind::OverlayFailure,
            actor: overlay.to_string(),
            subject: record_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn log_consent(&self, actor: &str, subject: &str, reason: &str) {
        self.append(AuditEntry {
            at: Utc::now(),
            kind: AuditKind::Consent,
            actor: actor.to_string(),
            subject: subject.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Read back all entries — used by tests and maintenance tooling.
    pub fn load(&self) -> Vec<AuditEntry> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_is_logged_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::open(dir.path().join("audit.jsonl"));
        audit.log_denial("bob", "rec-1", "not a member");
        let entries = audit.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, AuditKind::AccessDenied);
    }
}
