//! Durable per-row progress with retry accounting and the dead-letter
//! projection.
//!
//! One shared store behind a mutex; every state change is journaled and
//! synced before the call returns, so a crash immediately after `mark_done`
//! cannot resurrect the row as pending on resume.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::journal::JournalStore;

const COMPACT_AFTER_LINES: usize = 256;

/// Terminal-ish state of one row. Absent means pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    /// Not yet attempted (only ever observed, never stored).
    Pending,
    /// An ad was produced; not revisited on resume.
    Done,
    /// The attempt failed; eligible for the dead-letter pass while retries
    /// remain.
    Failed,
}

/// Everything persisted for one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Row index (0-based, dense).
    pub idx: usize,
    /// Current status.
    pub status: RowStatus,
    /// Query the row was processed with.
    pub query: String,
    /// Output filename, when one was produced.
    pub filename: String,
    /// Artifact source (provider name, `cache`, or `placeholder`).
    pub source: String,
    /// Failure message for failed rows.
    pub error: Option<String>,
    /// Failed attempts so far.
    pub retries: u32,
    /// Wall-clock completion time (epoch seconds).
    pub completed_at: f64,
    /// Full row outcome metadata.
    pub meta: serde_json::Value,
}

/// Metadata attached to a status transition.
#[derive(Debug, Clone, Default)]
pub struct ProgressMeta {
    /// Query the row was processed with.
    pub query: String,
    /// Output filename, when one was produced.
    pub filename: String,
    /// Artifact source (provider name, `cache`, or `placeholder`).
    pub source: String,
    /// Failure message, for `mark_failed`.
    pub error: Option<String>,
    /// Full row outcome metadata.
    pub meta: serde_json::Value,
}

struct ProgressInner {
    records: BTreeMap<usize, ProgressRecord>,
    store: JournalStore,
}

impl ProgressInner {
    fn write(&mut self, record: ProgressRecord) -> anyhow::Result<()> {
        self.store.append(&record)?;
        self.records.insert(record.idx, record);
        if self.store.wants_compaction() {
            self.store.compact(self.records.values().collect())?;
        }
        Ok(())
    }
}

/// Durable mapping `row index → progress record`.
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<Mutex<ProgressInner>>,
    max_retries: u32,
}

impl ProgressStore {
    /// Open (or create) the store at `path` and replay prior state.
    pub fn open(path: &Path, max_retries: u32) -> anyhow::Result<Self> {
        let (store, entries) =
            JournalStore::open::<ProgressRecord>(path.to_path_buf(), COMPACT_AFTER_LINES)?;
        let mut records = BTreeMap::new();
        for record in entries {
            records.insert(record.idx, record);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(ProgressInner { records, store })),
            max_retries,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a previous run already finished this row.
    pub fn is_done(&self, idx: usize) -> bool {
        self.lock()
            .records
            .get(&idx)
            .is_some_and(|r| r.status == RowStatus::Done)
    }

    /// Upsert the row as done: error cleared, completion time stamped.
    pub fn mark_done(&self, idx: usize, meta: ProgressMeta) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let retries = inner.records.get(&idx).map(|r| r.retries).unwrap_or(0);
        inner.write(ProgressRecord {
            idx,
            status: RowStatus::Done,
            query: meta.query,
            filename: meta.filename,
            source: meta.source,
            error: None,
            retries,
            completed_at: now_epoch(),
            meta: meta.meta,
        })
    }

    /// Upsert the row as failed; retries become prior + 1 (1 on first
    /// failure).
    pub fn mark_failed(&self, idx: usize, meta: ProgressMeta) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let retries = inner
            .records
            .get(&idx)
            .map(|r| r.retries + 1)
            .unwrap_or(1);
        inner.write(ProgressRecord {
            idx,
            status: RowStatus::Failed,
            query: meta.query,
            filename: meta.filename,
            source: meta.source,
            error: meta.error.or_else(|| Some(String::new())),
            retries,
            completed_at: now_epoch(),
            meta: meta.meta,
        })
    }

    /// Rows with `status = failed` and retry budget left, in index order.
    pub fn get_dead_letters(&self) -> Vec<usize> {
        self.lock()
            .records
            .values()
            .filter(|r| r.status == RowStatus::Failed && r.retries < self.max_retries)
            .map(|r| r.idx)
            .collect()
    }

    /// Stored record for one row.
    pub fn get(&self, idx: usize) -> Option<ProgressRecord> {
        self.lock().records.get(&idx).cloned()
    }

    /// Count of stored rows per status.
    pub fn stats(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for record in self.lock().records.values() {
            let key = match record.status {
                RowStatus::Pending => "pending",
                RowStatus::Done => "done",
                RowStatus::Failed => "failed",
            };
            *out.entry(key.to_string()).or_insert(0) += 1;
        }
        out
    }

    /// Drop all stored state.
    pub fn reset(&self) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.records.clear();
        inner.store.clear()
    }
}

fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(query: &str) -> ProgressMeta {
        ProgressMeta {
            query: query.to_string(),
            filename: "ad_0001.jpg".to_string(),
            source: "test".to_string(),
            error: None,
            meta: serde_json::json!({}),
        }
    }

    fn failure(query: &str) -> ProgressMeta {
        ProgressMeta {
            error: Some("boom".to_string()),
            ..meta(query)
        }
    }

    #[test]
    fn double_failure_counts_two_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(&dir.path().join("progress.json"), 2).unwrap();

        store.mark_failed(3, failure("q")).unwrap();
        store.mark_failed(3, failure("q")).unwrap();

        let record = store.get(3).unwrap();
        assert_eq!(record.status, RowStatus::Failed);
        assert_eq!(record.retries, 2);
    }

    #[test]
    fn failed_then_done_lands_done() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(&dir.path().join("progress.json"), 2).unwrap();

        store.mark_failed(0, failure("q")).unwrap();
        store.mark_done(0, meta("q")).unwrap();

        assert!(store.is_done(0));
        let record = store.get(0).unwrap();
        assert_eq!(record.status, RowStatus::Done);
        assert_eq!(record.error, None);
        assert!(record.completed_at > 0.0);
        assert!(store.get_dead_letters().is_empty());
    }

    #[test]
    fn dead_letters_respect_retry_ceiling_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(&dir.path().join("progress.json"), 2).unwrap();

        store.mark_failed(5, failure("a")).unwrap();
        store.mark_failed(1, failure("b")).unwrap();
        store.mark_failed(9, failure("c")).unwrap();
        store.mark_failed(9, failure("c")).unwrap(); // retries = 2 = max

        assert_eq!(store.get_dead_letters(), vec![1, 5]);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        {
            let store = ProgressStore::open(&path, 2).unwrap();
            store.mark_done(0, meta("a")).unwrap();
            store.mark_failed(1, failure("b")).unwrap();
        }

        let store = ProgressStore::open(&path, 2).unwrap();
        assert!(store.is_done(0));
        assert!(!store.is_done(1));
        assert_eq!(store.get(1).unwrap().retries, 1);
        assert_eq!(store.stats().get("done"), Some(&1));
        assert_eq!(store.stats().get("failed"), Some(&1));
    }

    #[test]
    fn reset_truncates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let store = ProgressStore::open(&path, 2).unwrap();
        store.mark_done(0, meta("a")).unwrap();
        store.reset().unwrap();
        assert!(!store.is_done(0));
        assert!(store.stats().is_empty());

        let store = ProgressStore::open(&path, 2).unwrap();
        assert!(!store.is_done(0));
    }
}
