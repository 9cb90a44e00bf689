use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Append-only journal plus compacted snapshot, the durable backing for the
/// progress store and the image cache.
///
/// Every write is appended as one JSON line and synced before the call
/// returns, so an acknowledged write survives a crash. The journal is folded
/// into the snapshot (temp file + rename) once it grows past
/// `compact_after_lines`; replay order on load is snapshot first, then
/// journal lines, so later writes win.
pub(crate) struct JournalStore {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    journal: File,
    journal_lines: usize,
    compact_after_lines: usize,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotFile<T> {
    #[serde(default)]
    version: u32,
    #[serde(default = "Vec::new")]
    entries: Vec<T>,
}

impl JournalStore {
    /// Open (or create) the store and replay its contents in write order.
    pub(crate) fn open<T: DeserializeOwned>(
        snapshot_path: PathBuf,
        compact_after_lines: usize,
    ) -> anyhow::Result<(Self, Vec<T>)> {
        let journal_path = snapshot_path.with_extension("journal");
        if let Some(dir) = snapshot_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create store dir {}", dir.display()))?;
        }

        let mut entries: Vec<T> = Vec::new();
        if snapshot_path.exists() {
            let raw = std::fs::read_to_string(&snapshot_path)
                .with_context(|| format!("read snapshot {}", snapshot_path.display()))?;
            match serde_json::from_str::<SnapshotFile<T>>(&raw) {
                Ok(file) => entries.extend(file.entries),
                Err(err) => {
                    tracing::warn!(
                        path = %snapshot_path.display(),
                        "corrupt snapshot, starting from journal only: {err:#}"
                    );
                }
            }
        }

        let mut journal_lines = 0usize;
        if journal_path.exists() {
            let raw = std::fs::read_to_string(&journal_path)
                .with_context(|| format!("read journal {}", journal_path.display()))?;
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(line) {
                    Ok(entry) => {
                        entries.push(entry);
                        journal_lines += 1;
                    }
                    Err(err) => {
                        // Usually a torn trailing line from a crash mid-append.
                        tracing::warn!(
                            path = %journal_path.display(),
                            "skipping unparseable journal line: {err:#}"
                        );
                    }
                }
            }
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .with_context(|| format!("open journal {}", journal_path.display()))?;

        Ok((
            Self {
                snapshot_path,
                journal_path,
                journal,
                journal_lines,
                compact_after_lines: compact_after_lines.max(1),
            },
            entries,
        ))
    }

    /// Append one entry and sync it to disk before returning.
    pub(crate) fn append<T: Serialize>(&mut self, entry: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(entry).context("serialize journal entry")?;
        line.push('\n');
        self.journal
            .write_all(line.as_bytes())
            .with_context(|| format!("append to {}", self.journal_path.display()))?;
        self.journal.sync_data().context("sync journal")?;
        self.journal_lines += 1;
        Ok(())
    }

    /// Whether the journal has grown enough to warrant compaction.
    pub(crate) fn wants_compaction(&self) -> bool {
        self.journal_lines >= self.compact_after_lines
    }

    /// Fold the caller's current full state into the snapshot and truncate
    /// the journal.
    pub(crate) fn compact<T: Serialize>(&mut self, entries: Vec<&T>) -> anyhow::Result<()> {
        let file = SnapshotFile {
            version: 1,
            entries,
        };
        let json = serde_json::to_string(&file).context("serialize snapshot")?;
        let tmp = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("write snapshot temp {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.snapshot_path).with_context(|| {
            format!("rename snapshot into place at {}", self.snapshot_path.display())
        })?;

        self.journal.set_len(0).context("truncate journal")?;
        self.journal.sync_data().context("sync truncated journal")?;
        self.journal_lines = 0;
        Ok(())
    }

    /// Delete both files and reset in-memory bookkeeping.
    pub(crate) fn clear(&mut self) -> anyhow::Result<()> {
        self.journal.set_len(0).context("truncate journal")?;
        self.journal.sync_data().context("sync truncated journal")?;
        self.journal_lines = 0;
        if self.snapshot_path.exists() {
            std::fs::remove_file(&self.snapshot_path)
                .with_context(|| format!("remove snapshot {}", self.snapshot_path.display()))?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn paths(&self) -> (&Path, &Path) {
        (&self.snapshot_path, &self.journal_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        key: u32,
        value: String,
    }

    fn entry(key: u32, value: &str) -> Entry {
        Entry {
            key,
            value: value.to_string(),
        }
    }

    #[test]
    fn appended_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let (mut store, loaded) = JournalStore::open::<Entry>(path.clone(), 100).unwrap();
            assert!(loaded.is_empty());
            store.append(&entry(1, "a")).unwrap();
            store.append(&entry(2, "b")).unwrap();
        }

        let (_, loaded) = JournalStore::open::<Entry>(path, 100).unwrap();
        assert_eq!(loaded, vec![entry(1, "a"), entry(2, "b")]);
    }

    #[test]
    fn compaction_folds_journal_into_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let (mut store, _) = JournalStore::open::<Entry>(path.clone(), 2).unwrap();
        store.append(&entry(1, "a")).unwrap();
        store.append(&entry(1, "b")).unwrap();
        assert!(store.wants_compaction());

        let current = entry(1, "b");
        store.compact(vec![&current]).unwrap();
        assert!(!store.wants_compaction());
        let (snapshot_path, journal_path) = store.paths();
        assert!(snapshot_path.exists());
        assert_eq!(std::fs::metadata(journal_path).unwrap().len(), 0);
        drop(store);

        let (_, loaded) = JournalStore::open::<Entry>(path, 2).unwrap();
        assert_eq!(loaded, vec![entry(1, "b")]);
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let (mut store, _) = JournalStore::open::<Entry>(path.clone(), 100).unwrap();
            store.append(&entry(7, "ok")).unwrap();
        }
        // Simulate a crash mid-append.
        let journal = path.with_extension("journal");
        let mut raw = std::fs::read_to_string(&journal).unwrap();
        raw.push_str("{\"key\":8,\"val");
        std::fs::write(&journal, raw).unwrap();

        let (_, loaded) = JournalStore::open::<Entry>(path, 100).unwrap();
        assert_eq!(loaded, vec![entry(7, "ok")]);
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let (mut store, _) = JournalStore::open::<Entry>(path.clone(), 1).unwrap();
        store.append(&entry(1, "a")).unwrap();
        store.compact(vec![&entry(1, "a")]).unwrap();
        store.clear().unwrap();
        drop(store);

        let (_, loaded) = JournalStore::open::<Entry>(path, 1).unwrap();
        assert!(loaded.is_empty());
    }
}
