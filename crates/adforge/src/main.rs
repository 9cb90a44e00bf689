mod cli;
mod report;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use adforge_core::config::{AppConfig, PathsConfig, SearchEndpoint};
use adforge_core::table::RowTable;
use adforge_core::text::build_query;
use adforge_engine::background::{BackgroundConditioner, BorderFloodConditioner};
use adforge_engine::cache::ImageCache;
use adforge_engine::compose::BasicCompositor;
use adforge_engine::notify::{Notifier, NullNotifier, WebhookNotifier};
use adforge_engine::progress::ProgressStore;
use adforge_engine::providers::{SearchProvider, SearxProvider};
use adforge_engine::{Collaborators, PipelineEvent, start_pipeline};

use crate::cli::Cli;
use crate::report::format_report;

const EXIT_CONFIG: i32 = 2;
const EXIT_GRACEFUL: i32 = 130;
const EXIT_FORCED: i32 = 1;

fn exit_config_error(err: impl std::fmt::Display) -> ! {
    eprintln!("configuration error: {err}");
    std::process::exit(EXIT_CONFIG);
}

fn apply_overrides(cfg: &mut AppConfig, cli: &Cli) {
    if let Some(root) = &cli.data_dir {
        let input = cfg.paths.csv_input.clone();
        cfg.paths = PathsConfig::under_root(root);
        if cli.input.is_none() && input != PathsConfig::default().csv_input {
            cfg.paths.csv_input = input;
        }
    }
    if let Some(input) = &cli.input {
        cfg.paths.csv_input = input.clone();
    }
    if let Some(workers) = cli.workers {
        cfg.run.workers = workers as usize;
    }
    if cli.start.is_some() {
        cfg.run.start_index = cli.start;
    }
    if cli.end.is_some() {
        cfg.run.end_index = cli.end;
    }
    if cli.resume {
        cfg.run.resume = true;
    }
    if cli.dry_run {
        cfg.run.dry_run = true;
    }
    if cli.no_dlq {
        cfg.run.enable_dlq = false;
    }
    if cli.no_cache {
        cfg.run.enable_cache = false;
    }
    if !cli.searx.is_empty() {
        cfg.search.endpoints = cli
            .searx
            .iter()
            .enumerate()
            .map(|(i, url)| SearchEndpoint {
                name: url
                    .host_str()
                    .map(|h| format!("searx-{h}"))
                    .unwrap_or_else(|| format!("searx-{i}")),
                base_url: url.to_string(),
            })
            .collect();
    }
}

fn print_status(cfg: &AppConfig) -> anyhow::Result<()> {
    let progress = ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries)?;
    let stats = progress.stats();
    println!("progress store ({}):", cfg.paths.progress_file.display());
    if stats.is_empty() {
        println!("  empty");
    }
    for (status, count) in &stats {
        println!("  {status:8} {count}");
    }
    let dead = progress.get_dead_letters();
    println!("  dead-letter eligible: {}", dead.len());

    if cfg.run.enable_cache {
        let cache = ImageCache::open(&cfg.paths.cache_file)?;
        let stats = cache.stats();
        println!("image cache ({}):", cfg.paths.cache_file.display());
        println!(
            "  entries={} hits={} bytes={}",
            stats.entries, stats.total_hits, stats.total_bytes
        );
    }
    Ok(())
}

fn print_preview(cfg: &AppConfig, count: usize) -> anyhow::Result<()> {
    let table = RowTable::load(&cfg.paths.csv_input, &cfg.query.image_column)?;
    for idx in 0..table.len().min(count) {
        let Some(row) = table.snapshot(idx) else {
            break;
        };
        let query = build_query(&row, &cfg.query);
        println!("[{:>4}] {}", idx + 1, if query.is_empty() { "(empty)" } else { &query });
    }
    Ok(())
}

fn build_collaborators(cfg: &AppConfig) -> Collaborators {
    let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();
    let timeout = Duration::from_secs(cfg.run.download_timeout_secs.max(1));
    for endpoint in &cfg.search.endpoints {
        let url = match reqwest::Url::parse(&endpoint.base_url) {
            Ok(url) => url,
            Err(err) => exit_config_error(format!(
                "search endpoint {}: invalid base url: {err}",
                endpoint.name
            )),
        };
        match SearxProvider::new(endpoint.name.clone(), url, timeout) {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(err) => exit_config_error(format!(
                "search endpoint {}: {err:#}",
                endpoint.name
            )),
        }
    }
    if providers.is_empty() {
        tracing::warn!("no search endpoints configured; every row will fall back to a placeholder");
    }
    if cfg.verify.enabled {
        tracing::warn!("no verifier model wired; stage-1/2 verification disabled for this run");
    }

    let notifier: Arc<dyn Notifier> =
        if cfg.notify.enabled && !cfg.notify.webhook_url.is_empty() {
            match WebhookNotifier::new(cfg.notify.clone()) {
                Ok(notifier) => Arc::new(notifier),
                Err(err) => {
                    tracing::warn!("webhook notifier unavailable: {err:#}");
                    Arc::new(NullNotifier)
                }
            }
        } else {
            Arc::new(NullNotifier)
        };

    Collaborators {
        providers,
        fetcher: None,
        verifier: None,
        conditioner: cfg
            .background
            .enabled
            .then(|| Arc::new(BorderFloodConditioner::default()) as Arc<dyn BackgroundConditioner>),
        compositor: Arc::new(BasicCompositor),
        notifier,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut cfg = match AppConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => exit_config_error(format!("{err:#}")),
    };
    apply_overrides(&mut cfg, &cli);

    // Maintenance modes run and exit before any pipeline work.
    if cli.clear_cache {
        let cache = ImageCache::open(&cfg.paths.cache_file)?;
        cache.clear()?;
        println!("image cache cleared");
        return Ok(());
    }
    if cli.status {
        return print_status(&cfg);
    }
    if let Some(count) = cli.preview {
        if let Err(err) = cfg.validate() {
            exit_config_error(format!("{err:#}"));
        }
        return print_preview(&cfg, count.max(1));
    }

    if let Err(err) = cfg.validate() {
        exit_config_error(format!("{err:#}"));
    }

    if cli.fresh {
        let progress = ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries)?;
        progress.reset()?;
        tracing::info!("progress store reset");
    }

    let collaborators = build_collaborators(&cfg);
    let handle = start_pipeline(cfg.clone(), collaborators);
    let mut events = handle.subscribe();

    // Signals are handled here and only here; the engine's workers never see
    // them, they just poll the stop flag. Trip counting lives in the event
    // loop below.
    let (sig_tx, mut sig_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if sig_tx.send(()).is_err() {
                return;
            }
        }
    });

    println!(
        "adforge {} input={} workers={}",
        env!("CARGO_PKG_VERSION"),
        cfg.paths.csv_input.display(),
        cfg.run.workers
    );

    let show_bar = !cli.no_progress && std::io::stderr().is_terminal();
    let mut bar: Option<ProgressBar> = None;
    let mut trips: u32 = 0;
    let mut forced = false;

    loop {
        tokio::select! {
            Some(_) = sig_rx.recv() => {
                trips += 1;
                if trips == 1 {
                    eprintln!(
                        "Stop requested — finishing current rows before exiting \
                         (press CTRL+C again to exit immediately)."
                    );
                    handle.request_stop();
                } else {
                    eprintln!("Stop requested again — exiting immediately.");
                    forced = true;
                    break;
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(evt) => evt,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match evt {
                    PipelineEvent::Started { table_rows, to_process, skipped } => {
                        println!(
                            "{table_rows} rows, {to_process} to process, {skipped} already done"
                        );
                        if show_bar && to_process > 0 {
                            let pb = ProgressBar::new(to_process as u64);
                            pb.set_style(
                                ProgressStyle::with_template(
                                    "{bar:40} {pos}/{len} [{elapsed_precise}] {msg}",
                                )
                                .unwrap_or_else(|_| ProgressStyle::default_bar()),
                            );
                            bar = Some(pb);
                        }
                    }
                    PipelineEvent::RowFinished { outcome } => {
                        let line = if outcome.skipped {
                            format!("[{:>4}] skipped (shutdown)", outcome.idx + 1)
                        } else if outcome.success {
                            format!(
                                "[{:>4}] ok    {} -> {} ({})",
                                outcome.idx + 1,
                                outcome.query,
                                outcome.filename,
                                outcome.source
                            )
                        } else {
                            format!(
                                "[{:>4}] FAIL  {} ({})",
                                outcome.idx + 1,
                                outcome.query,
                                outcome.error.as_deref().unwrap_or("unknown error")
                            )
                        };
                        match &bar {
                            Some(pb) => {
                                if !outcome.skipped {
                                    pb.inc(1);
                                }
                                pb.set_message(outcome.query.clone());
                                pb.println(line);
                            }
                            None => println!("{line}"),
                        }
                    }
                    PipelineEvent::DeadLetterPass { count } => {
                        let msg = format!("dead-letter retry: {count} rows");
                        match &bar {
                            Some(pb) => {
                                pb.inc_length(count as u64);
                                pb.println(msg);
                            }
                            None => println!("{msg}"),
                        }
                    }
                    PipelineEvent::Warning { message } | PipelineEvent::Error { message } => {
                        match &bar {
                            Some(pb) => pb.println(message),
                            None => eprintln!("{message}"),
                        }
                    }
                    PipelineEvent::StopRequested
                    | PipelineEvent::RowStarted { .. } => {}
                    PipelineEvent::Stopped => break,
                }
            }
        }
    }

    if let Some(pb) = &bar {
        pb.finish_and_clear();
    }

    if forced {
        std::process::exit(EXIT_FORCED);
    }

    let stats = handle.wait().await?;
    println!("{}", format_report(&stats));
    println!("csv -> {}", cfg.paths.csv_output.display());

    if trips > 0 {
        std::process::exit(EXIT_GRACEFUL);
    }
    Ok(())
}
