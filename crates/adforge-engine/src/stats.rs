use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Process-wide run counters. All increments are atomic; values never
/// decrease during a run.
pub struct Stats {
    pub(crate) total: AtomicU64,
    pub(crate) success: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) placeholder: AtomicU64,
    pub(crate) bg_removed: AtomicU64,
    pub(crate) bg_skipped: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) dlq_retries: AtomicU64,
    pub(crate) verified: AtomicU64,
    pub(crate) verify_fails: AtomicU64,
    pub(crate) post_verified: AtomicU64,
    pub(crate) post_verify_fails: AtomicU64,
    pub(crate) recomposes: AtomicU64,
    started_at: Instant,
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            placeholder: AtomicU64::new(0),
            bg_removed: AtomicU64::new(0),
            bg_skipped: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            dlq_retries: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            verify_fails: AtomicU64::new(0),
            post_verified: AtomicU64::new(0),
            post_verify_fails: AtomicU64::new(0),
            recomposes: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Seconds since the pipeline instance was created.
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            placeholder: self.placeholder.load(Ordering::Relaxed),
            bg_removed: self.bg_removed.load(Ordering::Relaxed),
            bg_skipped: self.bg_skipped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            dlq_retries: self.dlq_retries.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            verify_fails: self.verify_fails.load(Ordering::Relaxed),
            post_verified: self.post_verified.load(Ordering::Relaxed),
            post_verify_fails: self.post_verify_fails.load(Ordering::Relaxed),
            recomposes: self.recomposes.load(Ordering::Relaxed),
            elapsed_secs: self.elapsed_secs(),
        }
    }
}

/// Immutable view of the run counters, embedded in status snapshots and the
/// final report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    /// Rows that ran to completion (success or failure), excluding skips.
    pub total: u64,
    /// Rows that produced an ad.
    pub success: u64,
    /// Rows that produced nothing.
    pub failed: u64,
    /// Successes that fell back to a synthesized placeholder.
    pub placeholder: u64,
    /// Rows whose background was removed.
    pub bg_removed: u64,
    /// Rows where removal was skipped by the scene heuristic.
    pub bg_skipped: u64,
    /// Rows skipped because a previous run already finished them.
    pub skipped: u64,
    /// Rows served from the image cache.
    pub cache_hits: u64,
    /// Rows resubmitted by the dead-letter pass.
    pub dlq_retries: u64,
    /// Stage-1 verifications performed.
    pub verified: u64,
    /// Stage-1 verifications that rejected the candidate set.
    pub verify_fails: u64,
    /// Stage-2 (post-compose) verifications performed.
    pub post_verified: u64,
    /// Stage-2 verifications that rejected the composition.
    pub post_verify_fails: u64,
    /// Recomposition attempts made after stage-2 rejections.
    pub recomposes: u64,
    /// Seconds elapsed since pipeline start.
    pub elapsed_secs: f64,
}
