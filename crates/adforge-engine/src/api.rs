//! Public API types for the in-process `adforge` pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::background::BackgroundConditioner;
use crate::compose::Compositor;
use crate::fetch::ImageFetcher;
use crate::notify::Notifier;
use crate::providers::SearchProvider;
use crate::stats::StatsSnapshot;
use crate::verify::{Verification, Verifier};

/// Externally supplied collaborators, explicitly constructed by the caller
/// and owned by the pipeline for the length of the run.
pub struct Collaborators {
    /// Search providers in priority order.
    pub providers: Vec<Arc<dyn SearchProvider>>,
    /// Candidate downloader. `None` builds the default HTTP fetcher, one per
    /// worker so each worker owns its connection pool.
    pub fetcher: Option<Arc<dyn ImageFetcher>>,
    /// Two-stage verifier; `None` disables verification regardless of
    /// configuration.
    pub verifier: Option<Arc<dyn Verifier>>,
    /// Background-removal model; `None` disables conditioning.
    pub conditioner: Option<Arc<dyn BackgroundConditioner>>,
    /// Ad renderer.
    pub compositor: Arc<dyn Compositor>,
    /// Notification sink.
    pub notifier: Arc<dyn Notifier>,
}

/// Everything recorded about one processed row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowOutcome {
    /// Row index (0-based).
    pub idx: usize,
    /// Whether an ad was produced.
    pub success: bool,
    /// Whether the row was skipped by shutdown before doing work.
    pub skipped: bool,
    /// Query the row was processed with.
    pub query: String,
    /// Output filename (relative to the images directory).
    pub filename: String,
    /// Artifact source: provider name, `cache`, or `placeholder`.
    pub source: String,
    /// Stage-1 verification of the selected candidate, when performed.
    pub stage1: Option<Verification>,
    /// Stage-2 verification of the composed ad, when performed.
    pub stage2: Option<Verification>,
    /// Whether a recomposition replaced the first composition. `None` when
    /// stage 2 never rejected.
    pub recomposed: Option<bool>,
    /// Why recomposition ran.
    pub recompose_reason: Option<String>,
    /// Failure message for failed rows.
    pub error: Option<String>,
    /// Total wall time spent on the row (milliseconds).
    pub total_ms: u64,
}

/// Pipeline event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// The run started.
    Started {
        /// Rows in the input table.
        table_rows: usize,
        /// Rows selected for processing after resume filtering.
        to_process: usize,
        /// Rows skipped as already done.
        skipped: usize,
    },
    /// Graceful shutdown was requested.
    StopRequested,
    /// A worker picked up a row.
    RowStarted {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Row index.
        idx: usize,
    },
    /// A worker finished a row (success, failure, or shutdown skip).
    RowFinished {
        /// Row outcome.
        outcome: RowOutcome,
    },
    /// The dead-letter pass is starting.
    DeadLetterPass {
        /// Rows being retried.
        count: usize,
    },
    /// A warning from the pipeline.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the pipeline.
    Error {
        /// Error message.
        message: String,
    },
    /// The run finished and the final flush completed.
    Stopped,
}

/// Current pipeline state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    /// Whether a stop has been requested.
    pub stop_requested: bool,
    /// Rows in the input table.
    pub table_rows: usize,
    /// Rows selected for processing this run.
    pub to_process: usize,
    /// Rows finished so far this run (including failures).
    pub completed: usize,
    /// Counter block.
    pub stats: StatsSnapshot,
}

/// Handle to a running in-process pipeline.
pub struct PipelineHandle {
    pub(crate) inner: Arc<crate::engine::PipelineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<StatsSnapshot>>,
}

impl PipelineHandle {
    /// Subscribe to the pipeline event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Latest status snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown: in-flight rows finish, pending rows are
    /// skipped, the final flush still runs.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the run to finish and return the final counters.
    pub async fn wait(self) -> anyhow::Result<StatsSnapshot> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("pipeline task join error: {err}")),
        }
    }
}

/// Start a pipeline over the given configuration and collaborators.
///
/// Returns immediately; progress flows through the handle's event stream.
pub fn start_pipeline(
    cfg: adforge_core::AppConfig,
    collaborators: Collaborators,
) -> PipelineHandle {
    crate::engine::start_pipeline(cfg, collaborators)
}
