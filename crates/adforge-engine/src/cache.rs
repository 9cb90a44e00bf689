//! Durable image cache keyed by query fingerprint.
//!
//! Identical normalized queries across rows (and across runs) reuse one
//! downloaded artifact instead of hitting the providers again.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use adforge_core::text::query_fingerprint;
use serde::{Deserialize, Serialize};

use crate::journal::JournalStore;

const COMPACT_AFTER_LINES: usize = 128;

/// One cached artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// 16-hex fingerprint of the normalized query.
    pub fingerprint: String,
    /// The query that produced the artifact.
    pub query: String,
    /// URL the artifact was downloaded from.
    pub source_url: String,
    /// Where the artifact lives on disk.
    pub stored_path: String,
    /// Content digest of the artifact bytes.
    pub digest: String,
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
    /// Artifact size in bytes.
    pub byte_size: u64,
    /// Provider that surfaced the artifact.
    pub provider: String,
    /// Wall-clock insert time (epoch seconds).
    pub created_at: f64,
    /// Times this entry has been served.
    pub hit_count: u64,
}

/// Aggregated cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently stored.
    pub entries: u64,
    /// Sum of hit counts across entries.
    pub total_hits: u64,
    /// Sum of artifact sizes in bytes.
    pub total_bytes: u64,
}

struct CacheInner {
    entries: BTreeMap<String, CacheEntry>,
    store: JournalStore,
}

impl CacheInner {
    fn write(&mut self, entry: CacheEntry) -> anyhow::Result<()> {
        self.store.append(&entry)?;
        self.entries.insert(entry.fingerprint.clone(), entry);
        if self.store.wants_compaction() {
            self.store.compact(self.entries.values().collect())?;
        }
        Ok(())
    }
}

/// Durable `query fingerprint → artifact` mapping behind one mutex.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl ImageCache {
    /// Open (or create) the cache at `path` and replay prior state. Entries
    /// whose stored file disappeared are dropped lazily on `get`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let (store, loaded) =
            JournalStore::open::<CacheEntry>(path.to_path_buf(), COMPACT_AFTER_LINES)?;
        let mut entries = BTreeMap::new();
        for entry in loaded {
            entries.insert(entry.fingerprint.clone(), entry);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(CacheInner { entries, store })),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the entry for `query`, bumping its hit count. Entries whose
    /// stored file no longer exists are evicted and reported as a miss.
    pub fn get(&self, query: &str) -> Option<CacheEntry> {
        let fp = query_fingerprint(query);
        let mut inner = self.lock();

        let entry = inner.entries.get(&fp)?.clone();
        if !Path::new(&entry.stored_path).exists() {
            tracing::debug!(query, "cache entry stale (file missing), evicting");
            inner.entries.remove(&fp);
            // Persist the eviction on the next compaction; losing it only
            // costs one repeated stale check.
            return None;
        }

        let mut entry = entry;
        entry.hit_count += 1;
        if let Err(err) = inner.write(entry.clone()) {
            tracing::warn!("cache hit-count update failed: {err:#}");
        }
        tracing::info!(query, hits = entry.hit_count, "cache hit");
        Some(entry)
    }

    /// Insert or replace the entry for `query`; hit count restarts at zero.
    /// The write is durable once this returns.
    pub fn put(&self, query: &str, mut entry: CacheEntry) -> anyhow::Result<()> {
        entry.fingerprint = query_fingerprint(query);
        entry.query = query.to_string();
        entry.hit_count = 0;
        entry.created_at = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.lock().write(entry)
    }

    /// Aggregated counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len() as u64,
            total_hits: inner.entries.values().map(|e| e.hit_count).sum(),
            total_bytes: inner.entries.values().map(|e| e.byte_size).sum(),
        }
    }

    /// Drop every entry.
    pub fn clear(&self) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.store.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(dir: &Path, name: &str) -> CacheEntry {
        let stored = dir.join(name);
        std::fs::write(&stored, b"image-bytes").unwrap();
        CacheEntry {
            fingerprint: String::new(),
            query: String::new(),
            source_url: "http://example.test/img.jpg".into(),
            stored_path: stored.to_string_lossy().into_owned(),
            digest: "abcd".into(),
            width: 640,
            height: 480,
            byte_size: 11,
            provider: "searx".into(),
            created_at: 0.0,
            hit_count: 99, // must be reset by put
        }
    }

    #[test]
    fn put_get_round_trip_bumps_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(&dir.path().join("cache.json")).unwrap();

        cache.put("Red  Sneakers", entry_for(dir.path(), "a.jpg")).unwrap();

        // Fingerprint normalization: same entry under differing spacing/case.
        let hit = cache.get("red sneakers").unwrap();
        assert_eq!(hit.hit_count, 1);
        let hit = cache.get("red sneakers").unwrap();
        assert_eq!(hit.hit_count, 2);

        assert!(cache.get("blue sneakers").is_none());
    }

    #[test]
    fn missing_file_evicts_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(&dir.path().join("cache.json")).unwrap();

        let entry = entry_for(dir.path(), "gone.jpg");
        let stored = entry.stored_path.clone();
        cache.put("coffee beans", entry).unwrap();
        std::fs::remove_file(stored).unwrap();

        assert!(cache.get("coffee beans").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        {
            let cache = ImageCache::open(&path).unwrap();
            cache.put("galaxy phone", entry_for(dir.path(), "p.jpg")).unwrap();
        }

        let cache = ImageCache::open(&path).unwrap();
        let hit = cache.get("galaxy phone").unwrap();
        assert_eq!(hit.provider, "searx");
        assert_eq!(hit.hit_count, 1);
    }

    #[test]
    fn clear_empties_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(&dir.path().join("cache.json")).unwrap();
        cache.put("a b", entry_for(dir.path(), "x.jpg")).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(cache.get("a b").is_none());
    }
}
