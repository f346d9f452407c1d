//! Universal Write Path (Component H, §4.1) — fan-out to the content/index
//! store, vector index, and association graph under a best-effort overlay
//! policy, with an optional strict mode that promotes overlay failures to
//! hard failures.

use uuid::Uuid;

use crate::error::Result;
use crate::graph::RelationType;
use crate::schema::Record;

use super::SubstrateManager;

/// Per-overlay outcome of one `store_record` call (§4.1 step 5: "indicate
/// per-overlay success via a result descriptor").
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    pub record_id: Uuid,
    pub primary_ok: bool,
    pub vector_ok: bool,
    pub vector_error: Option<String>,
    pub graph_ok: bool,
    pub graph_error: Option<String>,
}

impl WriteOutcome {
    pub fn fully_succeeded(&self) -> bool {
        self.primary_ok && self.vector_ok && self.graph_ok
    }
}

impl SubstrateManager {
    /// `store(record, require_all)`. B is the system of record: a failure
    /// there is fatal. C and D are rebuildable overlays — failures there are
    /// absorbed into the returned descriptor, unless `require_all` is set,
    /// in which case any overlay failure is promoted to a hard error.
    pub async fn store_record(&self, record: &Record, require_all: bool) -> Result<WriteOutcome> {
        self.store.insert(record).await?;

        let mut outcome = WriteOutcome { record_id: record.record_id, primary_ok: true, ..Default::default() };

        match self.embedder.embed(&record.content).await {
            Ok(vector) => match self.vector.insert(record.record_id, vector) {
                Ok(()) => outcome.vector_ok = true,
                Err(err) => {
                    self.audit.log_overlay_failure(&record.record_id.to_string(), "vector", &err.to_string());
                    outcome.vector_error = Some(err.to_string());
                }
            },
            Err(err) => {
                self.audit.log_overlay_failure(&record.record_id.to_string(), "vector", &err.to_string());
                outcome.vector_error = Some(err.to_string());
            }
        }

        match self.link_to_recent(record).await {
            Ok(()) => outcome.graph_ok = true,
            Err(err) => {
                self.audit.log_overlay_failure(&record.record_id.to_string(), "graph", &err.to_string());
                outcome.graph_error = Some(err.to_string());
            }
        }

        if require_all && !outcome.fully_succeeded() {
            return Err(crate::error::SubstrateError::StorageFailure(format!(
                "overlay write incomplete for {}: vector_ok={} graph_ok={}",
                record.record_id, outcome.vector_ok, outcome.graph_ok
            )));
        }

        Ok(outcome)
    }

    /// Best-effort associative step: connect the new record to the owner's
    /// most recently created record with a `Sequential` edge, giving the
    /// graph overlay something to traverse without requiring the caller to
    /// specify associations explicitly.
    async fn link_to_recent(&self, record: &Record) -> Result<()> {
        self.graph.get_or_create_node(record.record_id)?;
        let rows = self.store.rows_for_owner(&record.owner_id)?;
        if let Some(previous) = rows.into_iter().find(|r| r.record_id != record.record_id) {
            self.graph.add_edge(previous.record_id, record.record_id, RelationType::Sequential, None, 0.5)?;
        }
        Ok(())
    }
}
