use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use adforge_core::AppConfig;
use adforge_core::config::RunConfig;
use adforge_core::table::RowTable;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use crate::api::{Collaborators, PipelineEvent, PipelineHandle, RowOutcome, StatusSnapshot};
use crate::background::ConditionerGate;
use crate::broker::SearchBroker;
use crate::cache::ImageCache;
use crate::dedup::DedupSet;
use crate::fetch::{HttpFetcher, ImageFetcher};
use crate::health::HealthMonitor;
use crate::notify::Notifier;
use crate::progress::{ProgressMeta, ProgressStore};
use crate::score::CandidateScorer;
use crate::select::CandidateSelector;
use crate::stats::{Stats, StatsSnapshot};
use crate::verify::VerifierGate;
use crate::worker::{WorkerCommand, WorkerContext, WorkerEvent, run_worker};

/// Dispatcher poll bound: every wait in the runtime loop wakes at least this
/// often so a stop request is always observed promptly.
const DISPATCH_TICK: Duration = Duration::from_millis(500);

pub(crate) struct PipelineInner {
    pub(crate) event_tx: broadcast::Sender<PipelineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    // Shared with every worker, which polls it between stages.
    stop_requested: Arc<AtomicBool>,
    notify: tokio::sync::Notify,
}

impl PipelineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(PipelineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) fn start_pipeline(cfg: AppConfig, collaborators: Collaborators) -> PipelineHandle {
    let (event_tx, _) = broadcast::channel::<PipelineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());

    let inner = Arc::new(PipelineInner {
        event_tx,
        snapshot_rx,
        stop_requested: Arc::new(AtomicBool::new(false)),
        notify: tokio::sync::Notify::new(),
    });

    let join = tokio::spawn(run_pipeline(inner.clone(), snapshot_tx, cfg, collaborators));
    PipelineHandle { inner, join }
}

struct PipelineRuntime {
    cfg: Arc<AppConfig>,
    inner: Arc<PipelineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,

    table: Arc<std::sync::Mutex<RowTable>>,
    table_rows: usize,
    to_process: usize,
    completed: usize,

    progress: ProgressStore,
    cache: Option<ImageCache>,
    stats: Arc<Stats>,
    health: Arc<HealthMonitor>,
    notifier: Arc<dyn Notifier>,

    worker_cmds: Vec<mpsc::Sender<WorkerCommand>>,
    worker_busy: Vec<bool>,
    worker_join: JoinSet<()>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,

    pending: VecDeque<usize>,
    remaining_chunks: VecDeque<Vec<usize>>,
    dlq_done: bool,
    csv_counter: AtomicU64,
}

impl PipelineRuntime {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            table_rows: self.table_rows,
            to_process: self.to_process,
            completed: self.completed,
            stats: self.stats.snapshot(),
        });
    }

    fn all_idle(&self) -> bool {
        !self.worker_busy.iter().any(|b| *b)
    }

    /// Hand pending rows to idle workers. Stops handing out work once a stop
    /// has been requested.
    async fn assign_rows(&mut self) {
        if self.inner.should_stop() {
            self.pending.clear();
            self.remaining_chunks.clear();
            return;
        }
        for worker_idx in 0..self.worker_busy.len() {
            if self.worker_busy[worker_idx] {
                continue;
            }
            let Some(idx) = self.pending.pop_front() else {
                break;
            };
            self.worker_busy[worker_idx] = true;
            if self.worker_cmds[worker_idx]
                .send(WorkerCommand::Row { idx })
                .await
                .is_err()
            {
                // Worker channel gone; row will be retried on resume.
                self.worker_busy[worker_idx] = false;
                self.emit(PipelineEvent::Error {
                    message: format!("worker {worker_idx} command channel closed"),
                });
                self.pending.push_front(idx);
                break;
            }
        }
    }

    /// Refill the pending queue: next chunk first, then one dead-letter
    /// pass. Returns false when there is nothing left to do.
    async fn refill_pending(&mut self) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        if !self.all_idle() {
            // Wait for in-flight rows; their completion may feed the DLQ.
            return true;
        }
        if let Some(chunk) = self.remaining_chunks.pop_front() {
            if let (Some(first), Some(last)) = (chunk.first(), chunk.last()) {
                tracing::info!("chunk {}-{}", first + 1, last + 1);
            }
            self.pending = chunk.into();
            return true;
        }
        if !self.dlq_done {
            self.dlq_done = true;
            if self.cfg.run.enable_dlq && !self.inner.should_stop() {
                let progress = self.progress.clone();
                let dead = tokio::task::spawn_blocking(move || progress.get_dead_letters())
                    .await
                    .unwrap_or_default();
                if !dead.is_empty() {
                    tracing::info!(count = dead.len(), "dead-letter retry pass");
                    Stats::add(&self.stats.dlq_retries, dead.len() as u64);
                    self.emit(PipelineEvent::DeadLetterPass { count: dead.len() });
                    self.pending = dead.into();
                    return true;
                }
            }
        }
        false
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::RowStarted { worker_idx, idx } => {
                self.emit(PipelineEvent::RowStarted { worker_idx, idx });
            }
            WorkerEvent::RowFinished { worker_idx, outcome } => {
                if let Some(busy) = self.worker_busy.get_mut(worker_idx) {
                    *busy = false;
                }
                self.completed += 1;
                self.record_outcome(&outcome).await;
                self.emit(PipelineEvent::RowFinished { outcome });
                self.push_snapshot();

                // Serial path: space rows out.
                if self.worker_busy.len() == 1
                    && !self.inner.should_stop()
                    && self.cfg.run.inter_row_delay_ms > 0
                    && !self.pending.is_empty()
                {
                    tokio::time::sleep(Duration::from_millis(self.cfg.run.inter_row_delay_ms))
                        .await;
                }
            }
        }
    }

    /// Progress bookkeeping for a finished row. Store errors are logged, not
    /// fatal: the row stays in flight for the next run.
    async fn record_outcome(&mut self, outcome: &RowOutcome) {
        if outcome.skipped {
            return;
        }

        let meta = ProgressMeta {
            query: outcome.query.clone(),
            filename: outcome.filename.clone(),
            source: outcome.source.clone(),
            error: outcome.error.clone(),
            meta: serde_json::to_value(outcome).unwrap_or_default(),
        };

        let progress = self.progress.clone();
        let idx = outcome.idx;
        let success = outcome.success;
        let write = tokio::task::spawn_blocking(move || {
            if success {
                progress.mark_done(idx, meta)
            } else {
                progress.mark_failed(idx, meta)
            }
        })
        .await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(idx, "progress write failed: {err:#}");
                self.emit(PipelineEvent::Warning {
                    message: format!("progress write failed for row {idx}: {err:#}"),
                });
            }
            Err(err) => tracing::error!("progress write join error: {err:#}"),
        }

        if success {
            self.notifier
                .on_milestone(self.stats.success.load(Ordering::Relaxed));
        } else if let Some(error) = &outcome.error {
            self.notifier.on_failure(outcome.idx, error);
        }

        let nth = self.csv_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if nth % self.cfg.run.csv_save_interval == 0 {
            self.checkpoint_csv().await;
        }
    }

    async fn checkpoint_csv(&self) {
        let table = self.table.clone();
        let path = self.cfg.paths.csv_output.clone();
        let result = tokio::task::spawn_blocking(move || {
            let table = table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            table.save(&path)
        })
        .await;
        match result {
            Ok(Ok(())) => tracing::debug!("csv checkpoint saved"),
            Ok(Err(err)) => tracing::warn!("csv checkpoint failed: {err:#}"),
            Err(err) => tracing::warn!("csv checkpoint join error: {err:#}"),
        }
    }

    async fn shutdown_workers(&mut self) {
        for cmd in &self.worker_cmds {
            let _ = cmd.send(WorkerCommand::Stop).await;
        }
        while self.worker_join.join_next().await.is_some() {}
    }

    async fn run(mut self) -> anyhow::Result<StatsSnapshot> {
        self.push_snapshot();
        let mut tick = tokio::time::interval(DISPATCH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.inner.should_stop() && self.all_idle() {
                self.pending.clear();
                self.remaining_chunks.clear();
                break;
            }

            if !self.refill_pending().await {
                break;
            }
            self.assign_rows().await;

            tokio::select! {
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                _ = self.inner.notify.notified() => {}
                _ = tick.tick() => {
                    self.push_snapshot();
                }
            }
        }

        self.shutdown_workers().await;
        self.finish().await;
        Ok(self.stats.snapshot())
    }

    /// The always-runs tail: final checkpoint, stats logging, completion
    /// notification, temp cleanup.
    async fn finish(&mut self) {
        self.checkpoint_csv().await;

        self.health.log_report();
        if let Some(cache) = &self.cache {
            let stats = cache.stats();
            tracing::info!(
                entries = stats.entries,
                hits = stats.total_hits,
                bytes = stats.total_bytes,
                "cache stats"
            );
        }
        {
            let progress = self.progress.clone();
            if let Ok(stats) = tokio::task::spawn_blocking(move || progress.stats()).await {
                tracing::info!(?stats, "progress store");
            }
        }

        let snap = self.stats.snapshot();
        self.notifier
            .on_completion(snap.total, snap.success, snap.elapsed_secs);

        if self.cfg.run.remove_temp && !self.inner.should_stop() {
            let temp_dir = self.cfg.paths.temp_dir.clone();
            let _ = tokio::task::spawn_blocking(move || {
                if temp_dir.exists() {
                    let _ = std::fs::remove_dir_all(&temp_dir);
                }
            })
            .await;
        }

        if self.inner.should_stop() {
            tracing::info!("graceful shutdown complete, progress saved, safe to resume");
        }

        self.emit(PipelineEvent::Stopped);
        self.push_snapshot();
    }
}

fn normalize(cfg: &mut AppConfig) {
    cfg.run.workers = cfg.run.workers.clamp(1, RunConfig::MAX_WORKERS);
    cfg.run.chunk_size = cfg.run.chunk_size.max(1);
    cfg.run.csv_save_interval = cfg.run.csv_save_interval.max(1);
}

async fn run_pipeline(
    inner: Arc<PipelineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut cfg: AppConfig,
    collaborators: Collaborators,
) -> anyhow::Result<StatsSnapshot> {
    normalize(&mut cfg);

    let fail = |message: String| {
        let _ = inner.event_tx.send(PipelineEvent::Error {
            message: message.clone(),
        });
        let _ = inner.event_tx.send(PipelineEvent::Stopped);
        anyhow::anyhow!("{message}")
    };

    if let Err(err) = cfg.paths.ensure() {
        return Err(fail(format!("create run directories: {err:#}")));
    }

    // Row table.
    let csv_input = cfg.paths.csv_input.clone();
    let image_column = cfg.query.image_column.clone();
    let table =
        match tokio::task::spawn_blocking(move || RowTable::load(&csv_input, &image_column)).await
        {
            Ok(Ok(table)) => table,
            Ok(Err(err)) => return Err(fail(format!("load input table: {err:#}"))),
            Err(err) => return Err(fail(format!("load input table join error: {err:#}"))),
        };
    let table_rows = table.len();

    // Durable stores.
    let progress_path = cfg.paths.progress_file.clone();
    let max_retries = cfg.run.dlq_max_retries;
    let progress = match tokio::task::spawn_blocking(move || {
        ProgressStore::open(&progress_path, max_retries)
    })
    .await
    {
        Ok(Ok(store)) => store,
        Ok(Err(err)) => return Err(fail(format!("open progress store: {err:#}"))),
        Err(err) => return Err(fail(format!("open progress store join error: {err:#}"))),
    };

    let cache = if cfg.run.enable_cache {
        match ImageCache::open(&cfg.paths.cache_file) {
            Ok(cache) => Some(cache),
            Err(err) => {
                tracing::warn!("image cache unavailable: {err:#}");
                let _ = inner.event_tx.send(PipelineEvent::Warning {
                    message: format!("image cache unavailable: {err:#}"),
                });
                None
            }
        }
    } else {
        None
    };

    // Index set, honoring range and resume.
    let start = cfg.run.start_index.unwrap_or(0);
    let end = cfg.run.end_index.unwrap_or(table_rows).min(table_rows);
    let all: Vec<usize> = (start.min(end)..end).collect();
    let to_process: Vec<usize> = if cfg.run.resume {
        let progress = progress.clone();
        let all = all.clone();
        tokio::task::spawn_blocking(move || {
            all.into_iter().filter(|i| !progress.is_done(*i)).collect()
        })
        .await
        .unwrap_or_default()
    } else {
        all.clone()
    };

    let stats = Arc::new(Stats::new());
    let skipped = (all.len() - to_process.len()) as u64;
    Stats::add(&stats.skipped, skipped);

    tracing::info!(
        to_process = to_process.len(),
        skipped,
        workers = cfg.run.workers,
        "pipeline starting"
    );
    let _ = inner.event_tx.send(PipelineEvent::Started {
        table_rows,
        to_process: to_process.len(),
        skipped: skipped as usize,
    });

    // Shared machinery.
    let health = Arc::new(HealthMonitor::new());
    let broker = Arc::new(SearchBroker::new(
        collaborators.providers,
        &cfg.search,
        health.clone(),
    ));
    let scorer = Arc::new(CandidateScorer::new(&broker.provider_names()));
    let dedup = Arc::new(DedupSet::new());
    let verifier_gate = collaborators
        .verifier
        .filter(|_| cfg.verify.enabled)
        .map(VerifierGate::new);
    let conditioner_gate = collaborators
        .conditioner
        .map(|c| ConditionerGate::new(c, cfg.background.clone()));

    let stop = inner.stop_requested.clone();
    let table = Arc::new(std::sync::Mutex::new(table));
    let cfg = Arc::new(cfg);

    // Worker pool.
    let (events_tx, events_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let mut worker_cmds = Vec::with_capacity(cfg.run.workers);
    let mut worker_join = JoinSet::new();
    for worker_idx in 0..cfg.run.workers {
        let fetcher: Arc<dyn ImageFetcher> = match &collaborators.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => match HttpFetcher::new(
                Duration::from_secs(cfg.run.download_timeout_secs.max(1)),
                cfg.quality.min_file_bytes,
            ) {
                Ok(fetcher) => Arc::new(fetcher),
                Err(err) => return Err(fail(format!("build http fetcher: {err:#}"))),
            },
        };

        let ctx = WorkerContext {
            worker_idx,
            cfg: cfg.clone(),
            table: table.clone(),
            broker: broker.clone(),
            selector: CandidateSelector {
                fetcher,
                dedup: dedup.clone(),
                verifier: verifier_gate.clone(),
                scorer: scorer.clone(),
                quality: cfg.quality,
                verify_cfg: cfg.verify,
            },
            cache: cache.clone(),
            conditioner: conditioner_gate.clone(),
            verifier: verifier_gate.clone(),
            compositor: collaborators.compositor.clone(),
            stats: stats.clone(),
            stop: stop.clone(),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(1);
        worker_cmds.push(cmd_tx);
        let events_tx = events_tx.clone();
        worker_join.spawn(async move {
            run_worker(ctx, cmd_rx, events_tx).await;
        });
    }

    let remaining_chunks: VecDeque<Vec<usize>> = to_process
        .chunks(cfg.run.chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect();

    let runtime = PipelineRuntime {
        cfg,
        inner,
        snapshot_tx,
        table,
        table_rows,
        to_process: to_process.len(),
        completed: 0,
        progress,
        cache,
        stats,
        health,
        notifier: collaborators.notifier,
        worker_busy: vec![false; worker_cmds.len()],
        worker_cmds,
        worker_join,
        events_rx,
        pending: VecDeque::new(),
        remaining_chunks,
        dlq_done: false,
        csv_counter: AtomicU64::new(0),
    };

    runtime.run().await
}
