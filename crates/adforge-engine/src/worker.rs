use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use adforge_core::config::AppConfig;
use adforge_core::table::RowTable;
use adforge_core::text::{build_query, clean_query};
use image::DynamicImage;
use tokio::sync::mpsc;

use crate::api::RowOutcome;
use crate::background::{ConditionerGate, should_attempt};
use crate::broker::SearchBroker;
use crate::cache::{CacheEntry, ImageCache};
use crate::compose::{AdFields, ComposeRequest, Compositor, placeholder_image, template_for};
use crate::select::{CandidateSelector, Selection, save_image};
use crate::stats::Stats;
use crate::verify::{Verification, VerifierGate};

const PLACEHOLDER_SOURCE: &str = "placeholder";
const CACHE_SOURCE: &str = "cache";
const PLACEHOLDER_EDGE: u32 = 1080;

pub(crate) enum WorkerCommand {
    Row { idx: usize },
    Stop,
}

pub(crate) enum WorkerEvent {
    RowStarted { worker_idx: usize, idx: usize },
    RowFinished { worker_idx: usize, outcome: RowOutcome },
}

/// Everything one worker needs; shared pieces are behind `Arc`s, the
/// selector (and with it the HTTP fetcher) is worker-owned.
pub(crate) struct WorkerContext {
    pub(crate) worker_idx: usize,
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) table: Arc<std::sync::Mutex<RowTable>>,
    pub(crate) broker: Arc<SearchBroker>,
    pub(crate) selector: CandidateSelector,
    pub(crate) cache: Option<ImageCache>,
    pub(crate) conditioner: Option<ConditionerGate>,
    pub(crate) verifier: Option<VerifierGate>,
    pub(crate) compositor: Arc<dyn Compositor>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) stop: Arc<AtomicBool>,
}

impl WorkerContext {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub(crate) async fn run_worker(
    ctx: WorkerContext,
    mut rx: mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let timeout = Duration::from_secs(ctx.cfg.run.worker_timeout_secs.max(1));
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Row { idx } => {
                let _ = events.send(WorkerEvent::RowStarted {
                    worker_idx: ctx.worker_idx,
                    idx,
                });

                let started = Instant::now();
                let outcome = match tokio::time::timeout(timeout, process_row(&ctx, idx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::warn!(idx, "row timed out");
                        Stats::bump(&ctx.stats.total);
                        Stats::bump(&ctx.stats.failed);
                        RowOutcome {
                            idx,
                            error: Some(format!(
                                "row timed out after {}s",
                                timeout.as_secs()
                            )),
                            total_ms: started.elapsed().as_millis() as u64,
                            ..Default::default()
                        }
                    }
                };

                let _ = events.send(WorkerEvent::RowFinished {
                    worker_idx: ctx.worker_idx,
                    outcome,
                });
            }
        }
    }
}

/// Drive one row through the stage sequence. Never panics the worker: any
/// stage error lands in `outcome.error`.
pub(crate) async fn process_row(ctx: &WorkerContext, idx: usize) -> RowOutcome {
    let started = Instant::now();
    let mut outcome = RowOutcome {
        idx,
        ..Default::default()
    };

    if ctx.should_stop() {
        outcome.skipped = true;
        return outcome;
    }

    let worker_dir = ctx
        .cfg
        .paths
        .temp_dir
        .join(format!("w{}", ctx.worker_idx % 100));
    let tmp_stem = worker_dir.join(format!("dl_{idx}"));
    let conditioned_path = worker_dir.join(format!("nobg_{idx}.png"));

    if let Err(err) = std::fs::create_dir_all(&worker_dir) {
        outcome.error = Some(format!("create worker dir: {err:#}"));
    } else if let Err(err) = run_stages(ctx, idx, &tmp_stem, &conditioned_path, &mut outcome).await
    {
        tracing::warn!(idx, "row failed: {err:#}");
        outcome.success = false;
        outcome.error = Some(format!("{err:#}"));
    }

    // Worker-owned scratch files go away no matter how the row ended.
    for path in [
        tmp_stem.with_extension("jpg"),
        tmp_stem.with_extension("png"),
        conditioned_path.clone(),
    ] {
        let _ = std::fs::remove_file(path);
    }

    outcome.total_ms = started.elapsed().as_millis() as u64;
    if outcome.skipped {
        return outcome;
    }
    Stats::bump(&ctx.stats.total);
    if outcome.success {
        Stats::bump(&ctx.stats.success);
    } else {
        Stats::bump(&ctx.stats.failed);
    }
    outcome
}

async fn run_stages(
    ctx: &WorkerContext,
    idx: usize,
    tmp_stem: &Path,
    conditioned_path: &Path,
    outcome: &mut RowOutcome,
) -> anyhow::Result<()> {
    let cfg = &ctx.cfg;

    let Some(row) = ctx
        .table
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .snapshot(idx)
    else {
        anyhow::bail!("row {idx} out of range");
    };

    let query = build_query(&row, &cfg.query);
    outcome.query = query.clone();

    let out_stem = cfg.paths.images_dir.join(format!("ad_{:04}", idx + 1));
    // Stands until the compositor reports the path it actually wrote.
    outcome.filename = format!("ad_{:04}.jpg", idx + 1);

    let table_len = ctx
        .table
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .len();
    tracing::info!("[{}/{}] query='{}'", idx + 1, table_len, query);

    // Cache probe.
    let mut cached: Option<PathBuf> = None;
    if cfg.run.enable_cache {
        if let Some(cache) = &ctx.cache {
            if let Some(path) = probe_cache(cache, &query, tmp_stem).await {
                cached = Some(path);
                outcome.source = CACHE_SOURCE.to_string();
                Stats::bump(&ctx.stats.cache_hits);
            }
        }
    }

    // Search, select, fall back, placeholder.
    let artifact: PathBuf = if let Some(path) = cached {
        path
    } else {
        if ctx.should_stop() {
            outcome.skipped = true;
            return Ok(());
        }

        let mut selection = search_and_select(ctx, &query, tmp_stem).await;

        if selection.is_none() && !ctx.should_stop() {
            for fb_column in cfg.query.fallback_columns.iter().take(2) {
                let Some(raw) = row.get_non_empty(fb_column) else {
                    continue;
                };
                let fallback = clean_query(raw, 0, &cfg.query.strip_suffixes);
                if fallback.is_empty() || fallback.eq_ignore_ascii_case(&query) {
                    continue;
                }
                tracing::info!(query = %fallback, "trying fallback query");
                selection = search_and_select(ctx, &fallback, tmp_stem).await;
                if selection.is_some() {
                    break;
                }
            }
        }

        match selection {
            Some(selection) => {
                outcome.source = selection.provider.clone();
                outcome.stage1 = selection.verification.clone();
                if let Some(verification) = &selection.verification {
                    Stats::bump(&ctx.stats.verified);
                    if !verification.accepted {
                        Stats::bump(&ctx.stats.verify_fails);
                    }
                }
                if cfg.run.enable_cache {
                    if let Some(cache) = &ctx.cache {
                        store_in_cache(ctx, cache, &query, &selection).await;
                    }
                }
                selection.path
            }
            None => {
                if ctx.verifier.is_some() && !query.is_empty() {
                    Stats::bump(&ctx.stats.verify_fails);
                }
                outcome.source = PLACEHOLDER_SOURCE.to_string();
                Stats::bump(&ctx.stats.placeholder);
                synthesize_placeholder(&query, tmp_stem).await?
            }
        }
    };

    if ctx.should_stop() {
        outcome.skipped = true;
        return Ok(());
    }

    // Background conditioning.
    let mut use_original = true;
    let mut bg_attempted = false;
    let conditioner = ctx
        .conditioner
        .as_ref()
        .filter(|_| cfg.background.enabled && should_attempt(&query, &cfg.background));
    if let Some(gate) = conditioner {
        bg_attempted = true;
        let product = load_image(&artifact).await?;
        let conditioned = gate.condition(Arc::new(product)).await;
        if !conditioned.use_original {
            if let Some(output) = conditioned.output {
                save_rgba_png(output, conditioned_path).await?;
                use_original = false;
                Stats::bump(&ctx.stats.bg_removed);
            }
        }
    } else {
        Stats::bump(&ctx.stats.bg_skipped);
    }

    // Compose.
    let fields = ad_fields(&row, cfg);
    if !cfg.run.dry_run {
        let conditioned = (!use_original && conditioned_path.exists())
            .then(|| conditioned_path.to_path_buf());
        let template = template_for(idx);
        tracing::debug!(template = template.name, idx, "composing");
        let composed = run_compose(
            ctx,
            ComposeRequest {
                product_path: artifact.clone(),
                conditioned_path: conditioned,
                use_original,
                fields: fields.clone(),
                output: out_stem.clone(),
                template: template.clone(),
            },
        )
        .await?;
        if let Some(name) = composed.file_name().and_then(|n| n.to_str()) {
            outcome.filename = name.to_string();
        }

        // Stage-2 verification with bounded recomposition.
        if outcome.source != PLACEHOLDER_SOURCE && cfg.verify.use_post_compose {
            if let Some(gate) = ctx.verifier.clone() {
                post_verify(
                    ctx,
                    gate,
                    idx,
                    &query,
                    &artifact,
                    bg_attempted,
                    &fields,
                    &out_stem,
                    &composed,
                    outcome,
                )
                .await;
            }
        }
    }

    // Publish the produced path into the row table.
    let rel = relative_image_path(cfg, &outcome.filename);
    {
        let mut table = ctx
            .table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        table.set_image_path(idx, &rel);
    }

    outcome.success = true;
    Ok(())
}

async fn search_and_select(
    ctx: &WorkerContext,
    query: &str,
    tmp_stem: &Path,
) -> Option<Selection> {
    let candidates = ctx.broker.search(query).await;
    if candidates.is_empty() {
        return None;
    }
    ctx.selector.select(candidates, query, tmp_stem).await
}

#[allow(clippy::too_many_arguments)]
async fn post_verify(
    ctx: &WorkerContext,
    gate: VerifierGate,
    idx: usize,
    query: &str,
    artifact: &Path,
    bg_attempted: bool,
    fields: &AdFields,
    out_stem: &Path,
    composed: &Path,
    outcome: &mut RowOutcome,
) {
    let verify_cfg = &ctx.cfg.verify;

    let post = verify_composed_file(ctx, &gate, composed, query).await;
    Stats::bump(&ctx.stats.post_verified);
    outcome.stage2 = Some(post.clone());

    if post.accepted {
        return;
    }
    Stats::bump(&ctx.stats.post_verify_fails);
    tracing::warn!(idx, "post-compose verification failed, attempting recovery");

    let mut recovered = false;
    for attempt in 0..verify_cfg.max_recompose_attempts {
        let request = match attempt {
            0 if verify_cfg.recompose_without_bg && bg_attempted => ComposeRequest {
                product_path: artifact.to_path_buf(),
                conditioned_path: None,
                use_original: true,
                fields: fields.clone(),
                output: out_stem.to_path_buf(),
                template: template_for(idx).clone(),
            },
            1 if verify_cfg.recompose_simpler_text => {
                let mut simpler = fields.clone();
                simpler.monetary.clear();
                simpler.cta.clear();
                ComposeRequest {
                    product_path: artifact.to_path_buf(),
                    conditioned_path: None,
                    use_original: true,
                    fields: simpler,
                    output: out_stem.to_path_buf(),
                    template: template_for(idx).clone(),
                }
            }
            _ => continue,
        };

        tracing::info!(
            idx,
            attempt = attempt + 1,
            total = verify_cfg.max_recompose_attempts,
            "recompose attempt"
        );
        Stats::bump(&ctx.stats.recomposes);
        let recomposed_path = match run_compose(ctx, request).await {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(idx, "recompose attempt failed: {err:#}");
                continue;
            }
        };
        if let Some(name) = recomposed_path.file_name().and_then(|n| n.to_str()) {
            outcome.filename = name.to_string();
        }

        let verdict = verify_composed_file(ctx, &gate, &recomposed_path, query).await;
        let accepted = verdict.accepted;
        outcome.stage2 = Some(verdict);
        if accepted {
            recovered = true;
            break;
        }
    }

    outcome.recomposed = Some(recovered);
    outcome.recompose_reason = Some("post_verify_fail".to_string());
    if !recovered {
        // The last composition stays on disk; the degradation is recorded in
        // the row meta.
        tracing::warn!(idx, "all recompose attempts rejected, keeping last composition");
    }
}

async fn verify_composed_file(
    ctx: &WorkerContext,
    gate: &VerifierGate,
    composed: &Path,
    query: &str,
) -> Verification {
    let image = match load_image(composed).await {
        Ok(image) => image,
        Err(err) => {
            tracing::warn!("cannot reload composed ad: {err:#}");
            return Verification {
                accepted: ctx.cfg.verify.accept_on_model_failure,
                reason: "composed_reload_failure".into(),
                ..Default::default()
            };
        }
    };
    match gate.verify_composed(Arc::new(image), query.to_string()).await {
        Ok(verification) => verification,
        Err(err) => {
            tracing::warn!("stage-2 verifier failed: {err:#}");
            Verification {
                accepted: ctx.cfg.verify.accept_on_model_failure,
                reason: "model_failure".into(),
                ..Default::default()
            }
        }
    }
}

async fn run_compose(ctx: &WorkerContext, request: ComposeRequest) -> anyhow::Result<PathBuf> {
    let compositor = ctx.compositor.clone();
    tokio::task::spawn_blocking(move || compositor.compose(&request))
        .await
        .map_err(|err| anyhow::anyhow!("compose task join error: {err:#}"))?
}

async fn load_image(path: &Path) -> anyhow::Result<DynamicImage> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::open(&path).map_err(anyhow::Error::from))
        .await
        .map_err(|err| anyhow::anyhow!("decode task join error: {err:#}"))?
}

async fn save_rgba_png(image: image::RgbaImage, path: &Path) -> anyhow::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        image.save_with_format(&path, image::ImageFormat::Png).map_err(anyhow::Error::from)
    })
    .await
    .map_err(|err| anyhow::anyhow!("save task join error: {err:#}"))?
}

async fn synthesize_placeholder(query: &str, tmp_stem: &Path) -> anyhow::Result<PathBuf> {
    let image = DynamicImage::ImageRgb8(
        placeholder_image(query, PLACEHOLDER_EDGE, PLACEHOLDER_EDGE).to_rgb8(),
    );
    let stem = tmp_stem.to_path_buf();
    tokio::task::spawn_blocking(move || save_image(&image, &stem))
        .await
        .map_err(|err| anyhow::anyhow!("placeholder task join error: {err:#}"))?
}

async fn probe_cache(cache: &ImageCache, query: &str, tmp_stem: &Path) -> Option<PathBuf> {
    let cache = cache.clone();
    let query = query.to_string();
    let tmp_stem = tmp_stem.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let entry = cache.get(&query)?;
        let stored = PathBuf::from(&entry.stored_path);
        let ext = stored
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg")
            .to_string();
        let dest = tmp_stem.with_extension(ext);
        match std::fs::copy(&stored, &dest) {
            Ok(_) => Some(dest),
            Err(err) => {
                tracing::warn!("cache artifact copy failed: {err:#}");
                None
            }
        }
    })
    .await;
    result.ok().flatten()
}

/// Copy the freshly selected artifact into cache-owned storage and record
/// it. Worker scratch files are deleted per row, so the cache keeps its own
/// copy keyed by fingerprint.
async fn store_in_cache(ctx: &WorkerContext, cache: &ImageCache, query: &str, sel: &Selection) {
    let cache = cache.clone();
    let query = query.to_string();
    let artifacts_dir = ctx
        .cfg
        .paths
        .cache_file
        .parent()
        .map(|p| p.join("artifacts"))
        .unwrap_or_else(|| PathBuf::from("artifacts"));
    let sel = sel.clone();

    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        std::fs::create_dir_all(&artifacts_dir)?;
        let ext = sel
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        let fingerprint = adforge_core::text::query_fingerprint(&query);
        let stored = artifacts_dir.join(format!("{fingerprint}.{ext}"));
        std::fs::copy(&sel.path, &stored)?;

        cache.put(
            &query,
            CacheEntry {
                fingerprint: String::new(),
                query: String::new(),
                source_url: sel.source_url.clone(),
                stored_path: stored.to_string_lossy().into_owned(),
                digest: sel.digest.clone(),
                width: sel.width,
                height: sel.height,
                byte_size: sel.byte_size,
                provider: sel.provider.clone(),
                created_at: 0.0,
                hit_count: 0,
            },
        )
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!("cache store failed: {err:#}"),
        Err(err) => tracing::warn!("cache store join error: {err:#}"),
    }
}

fn ad_fields(row: &adforge_core::RowSnapshot, cfg: &AppConfig) -> AdFields {
    let get = |column: &str| row.get_non_empty(column).unwrap_or("").to_string();
    AdFields {
        title: get(&cfg.query.text_column),
        monetary: get(&cfg.query.monetary_column),
        cta: get(&cfg.query.cta_column),
        color: get(&cfg.query.color_column),
    }
}

/// Path written back into the table: relative to the output CSV when the
/// images directory sits beneath it, absolute otherwise.
fn relative_image_path(cfg: &AppConfig, name: &str) -> String {
    let base = cfg.paths.csv_output.parent();
    match base.and_then(|b| cfg.paths.images_dir.strip_prefix(b).ok()) {
        Some(rel) if rel.as_os_str().is_empty() => name.to_string(),
        Some(rel) => format!("{}/{name}", rel.display()),
        None => cfg.paths.images_dir.join(name).display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adforge_core::config::PathsConfig;

    #[test]
    fn relative_path_prefers_csv_relative_form() {
        let mut cfg = AppConfig::default();
        cfg.paths = PathsConfig::under_root(Path::new("/data"));
        assert_eq!(
            relative_image_path(&cfg, "ad_0001.jpg"),
            "images/ad_0001.jpg"
        );

        cfg.paths.images_dir = PathBuf::from("/elsewhere/images");
        assert_eq!(
            relative_image_path(&cfg, "ad_0001.jpg"),
            "/elsewhere/images/ad_0001.jpg"
        );
    }

    #[test]
    fn ad_fields_pull_configured_columns() {
        let cfg = AppConfig::default();
        let row = adforge_core::RowSnapshot::from_pairs([
            ("text", "50% off sneakers"),
            ("monetary_mention", "50%"),
            ("call_to_action", "buy now"),
            ("dominant_colour", "Red"),
        ]);
        let fields = ad_fields(&row, &cfg);
        assert_eq!(fields.title, "50% off sneakers");
        assert_eq!(fields.monetary, "50%");
        assert_eq!(fields.cta, "buy now");
        assert_eq!(fields.color, "Red");
    }
}
