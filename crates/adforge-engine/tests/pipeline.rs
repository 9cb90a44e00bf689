//! End-to-end pipeline scenarios over fake collaborators.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use adforge_core::config::{AppConfig, PathsConfig};
use adforge_core::table::RowTable;
use adforge_engine::background::BackgroundConditioner;
use adforge_engine::cache::ImageCache;
use adforge_engine::compose::{BasicCompositor, ComposeRequest, Compositor};
use adforge_engine::fetch::ImageFetcher;
use adforge_engine::notify::{Notifier, NullNotifier};
use adforge_engine::progress::ProgressStore;
use adforge_engine::providers::{Candidate, SearchProvider};
use adforge_engine::verify::{Verification, Verifier};
use adforge_engine::{Collaborators, RowOutcome, start_pipeline};

// ── fake collaborators ──────────────────────────────────────────────────

struct FakeProvider {
    name: String,
    per_query: usize,
}

#[async_trait]
impl SearchProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, _max: usize) -> anyhow::Result<Vec<Candidate>> {
        Ok((0..self.per_query)
            .map(|i| Candidate {
                url: format!("mem://{}/{}/{}", self.name, query.replace(' ', "+"), i),
                provider: self.name.clone(),
                width: 800,
                height: 600,
                title: query.to_string(),
            })
            .collect())
    }
}

/// Generates a distinct decodable PNG per URL.
struct GenFetcher;

fn seeded_png(seed: u64) -> Vec<u8> {
    let s = (seed % 251) as u8;
    let img = image::RgbImage::from_fn(240, 240, |x, y| {
        image::Rgb([
            (x as u8).wrapping_add(s),
            (y as u8).wrapping_mul(s | 1),
            ((x + y) as u8) ^ s,
        ])
    });
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

#[async_trait]
impl ImageFetcher for GenFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut seed = 0u64;
        for b in url.bytes() {
            seed = seed.wrapping_mul(31).wrapping_add(b as u64);
        }
        Ok(Some(seeded_png(seed)))
    }
}

/// Stage-1 verdicts are fixed; stage-2 verdicts play back a script (empty
/// script accepts).
struct ScriptedVerifier {
    stage1_clip: f64,
    stage2: Mutex<VecDeque<bool>>,
}

impl ScriptedVerifier {
    fn accepting() -> Arc<Self> {
        Arc::new(Self {
            stage1_clip: 0.9,
            stage2: Mutex::new(VecDeque::new()),
        })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            stage1_clip: 0.01,
            stage2: Mutex::new(VecDeque::new()),
        })
    }

    fn with_stage2(script: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            stage1_clip: 0.9,
            stage2: Mutex::new(script.iter().copied().collect()),
        })
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, _image: &image::DynamicImage, _query: &str) -> anyhow::Result<Verification> {
        Ok(Verification {
            clip_score: self.stage1_clip,
            blip_score: self.stage1_clip,
            combined_score: self.stage1_clip,
            caption: "scripted".into(),
            accepted: self.stage1_clip >= 0.25,
            reason: "stage1_scripted".into(),
        })
    }

    fn verify_composed(
        &self,
        _image: &image::DynamicImage,
        _query: &str,
    ) -> anyhow::Result<Verification> {
        let accepted = self.stage2.lock().unwrap().pop_front().unwrap_or(true);
        let score = if accepted { 0.9 } else { 0.01 };
        Ok(Verification {
            clip_score: score,
            blip_score: score,
            combined_score: score,
            caption: "scripted".into(),
            accepted,
            reason: "stage2_scripted".into(),
        })
    }
}

/// Fails the first composition of a chosen output stem, then delegates.
struct FailOnceCompositor {
    inner: BasicCompositor,
    target_stem: String,
    tripped: AtomicBool,
}

impl Compositor for FailOnceCompositor {
    fn compose(&self, request: &ComposeRequest) -> anyhow::Result<PathBuf> {
        let stem = request
            .output
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if stem == self.target_stem && !self.tripped.swap(true, Ordering::SeqCst) {
            anyhow::bail!("transient render error");
        }
        self.inner.compose(request)
    }
}

/// Signals once when the first composition lands, then delegates.
struct SignalCompositor {
    inner: BasicCompositor,
    first_done: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl Compositor for SignalCompositor {
    fn compose(&self, request: &ComposeRequest) -> anyhow::Result<PathBuf> {
        let out = self.inner.compose(request)?;
        if let Some(tx) = self.first_done.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Ok(out)
    }
}

/// Keeps everything opaque so the sanity gate falls back to the original,
/// while still counting as an attempted removal.
struct OpaqueConditioner;

impl BackgroundConditioner for OpaqueConditioner {
    fn remove(&self, image: &image::DynamicImage) -> anyhow::Result<image::RgbaImage> {
        Ok(image.to_rgba8())
    }
}

// ── harness ─────────────────────────────────────────────────────────────

fn write_input(root: &Path, rows: &[(&str, &str)]) {
    let input = root.join("input").join("ads.csv");
    std::fs::create_dir_all(input.parent().unwrap()).unwrap();
    let mut body = String::from(
        "keywords,text,monetary_mention,call_to_action,dominant_colour,object_detected\n",
    );
    for (keywords, text) in rows {
        body.push_str(&format!("{keywords},{text},10% off,buy now,Blue,\n"));
    }
    std::fs::write(input, body).unwrap();
}

fn test_config(root: &Path) -> AppConfig {
    let mut cfg = AppConfig {
        paths: PathsConfig::under_root(root),
        ..Default::default()
    };
    cfg.run.workers = 2;
    cfg.run.csv_save_interval = 1;
    cfg.run.inter_row_delay_ms = 0;
    cfg.quality.min_file_bytes = 16;
    cfg.search.inter_provider_delay_ms = 0;
    cfg.search.rate_limit_per_sec = 10_000.0;
    cfg
}

struct Collab {
    verifier: Option<Arc<ScriptedVerifier>>,
    compositor: Option<Arc<dyn Compositor>>,
    conditioner: Option<Arc<dyn BackgroundConditioner>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Default for Collab {
    fn default() -> Self {
        Self {
            verifier: Some(ScriptedVerifier::accepting()),
            compositor: None,
            conditioner: None,
            notifier: None,
        }
    }
}

fn collaborators(parts: Collab) -> Collaborators {
    Collaborators {
        providers: vec![Arc::new(FakeProvider {
            name: "fake".into(),
            per_query: 3,
        })],
        fetcher: Some(Arc::new(GenFetcher)),
        verifier: parts.verifier.map(|v| v as Arc<dyn Verifier>),
        conditioner: parts.conditioner,
        compositor: parts
            .compositor
            .unwrap_or_else(|| Arc::new(BasicCompositor)),
        notifier: parts.notifier.unwrap_or_else(|| Arc::new(NullNotifier)),
    }
}

fn outcome_for(store: &ProgressStore, idx: usize) -> RowOutcome {
    let record = store.get(idx).expect("row record");
    serde_json::from_value(record.meta.clone()).expect("row outcome meta")
}

// ── scenarios ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_happy_path_three_rows() {
    let dir = tempfile::tempdir().unwrap();
    write_input(
        dir.path(),
        &[
            ("red sneakers", "50% off"),
            ("coffee beans", "fresh"),
            ("galaxy phone", "buy now"),
        ],
    );
    let cfg = test_config(dir.path());

    let handle = start_pipeline(cfg.clone(), collaborators(Collab::default()));
    let stats = handle.wait().await.unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.success, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.placeholder, 0);
    assert_eq!(stats.verified, 3);

    for n in 1..=3 {
        assert!(cfg.paths.images_dir.join(format!("ad_000{n}.jpg")).exists());
    }

    let output = RowTable::load(&cfg.paths.csv_output, "image_path").unwrap();
    for idx in 0..3 {
        assert_eq!(
            output.image_path(idx),
            Some(format!("images/ad_000{}.jpg", idx + 1).as_str())
        );
    }

    let progress =
        ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
    assert_eq!(progress.stats().get("done"), Some(&3));
    assert!(progress.get_dead_letters().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_resume_skips_done_rows() {
    let dir = tempfile::tempdir().unwrap();
    write_input(
        dir.path(),
        &[("red sneakers", "a"), ("coffee beans", "b"), ("galaxy phone", "c")],
    );

    // First run: only row 0, then "interrupted".
    let mut cfg = test_config(dir.path());
    cfg.run.end_index = Some(1);
    let stats = start_pipeline(cfg, collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();
    assert_eq!(stats.success, 1);

    // Second run resumes over the full range.
    let mut cfg = test_config(dir.path());
    cfg.run.resume = true;
    let stats = start_pipeline(cfg.clone(), collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.success, 2);

    let progress =
        ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
    assert_eq!(progress.stats().get("done"), Some(&3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_failed_row_recovers_via_dead_letter_pass() {
    let dir = tempfile::tempdir().unwrap();
    write_input(
        dir.path(),
        &[("red sneakers", "a"), ("coffee beans", "b"), ("galaxy phone", "c")],
    );
    let cfg = test_config(dir.path());

    let compositor = Arc::new(FailOnceCompositor {
        inner: BasicCompositor,
        target_stem: "ad_0001".into(),
        tripped: AtomicBool::new(false),
    });
    let handle = start_pipeline(
        cfg.clone(),
        collaborators(Collab {
            compositor: Some(compositor),
            ..Default::default()
        }),
    );
    let stats = handle.wait().await.unwrap();

    assert_eq!(stats.dlq_retries, 1);
    assert_eq!(stats.success, 3);
    assert_eq!(stats.failed, 1);
    // Row 0 ran twice: once failed, once recovered.
    assert_eq!(stats.total, 4);

    let progress =
        ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
    assert_eq!(progress.stats().get("done"), Some(&3));
    assert_eq!(progress.stats().get("failed"), None);
    let record = progress.get(0).unwrap();
    assert_eq!(record.retries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_all_candidates_rejected_falls_back_to_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[("red sneakers", "half price")]);
    let cfg = test_config(dir.path());

    let handle = start_pipeline(
        cfg.clone(),
        collaborators(Collab {
            verifier: Some(ScriptedVerifier::rejecting()),
            ..Default::default()
        }),
    );
    let stats = handle.wait().await.unwrap();

    assert_eq!(stats.success, 1);
    assert_eq!(stats.placeholder, 1);
    assert!(stats.verify_fails >= 1);
    assert!(cfg.paths.images_dir.join("ad_0001.jpg").exists());

    let progress =
        ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
    let record = progress.get(0).unwrap();
    assert_eq!(record.source, "placeholder");
    assert!(progress.is_done(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_stage2_rejection_recovers_by_recomposition() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[("red sneakers", "half price")]);
    let cfg = test_config(dir.path());

    let handle = start_pipeline(
        cfg.clone(),
        collaborators(Collab {
            verifier: Some(ScriptedVerifier::with_stage2(&[false, true])),
            conditioner: Some(Arc::new(OpaqueConditioner)),
            ..Default::default()
        }),
    );
    let stats = handle.wait().await.unwrap();

    assert_eq!(stats.success, 1);
    assert_eq!(stats.post_verified, 1);
    assert_eq!(stats.post_verify_fails, 1);
    assert_eq!(stats.recomposes, 1);

    let progress =
        ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
    let outcome = outcome_for(&progress, 0);
    assert_eq!(outcome.recomposed, Some(true));
    assert_eq!(outcome.recompose_reason.as_deref(), Some("post_verify_fail"));
    assert!(outcome.stage2.unwrap().accepted);
    assert!(cfg.paths.images_dir.join("ad_0001.jpg").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_interrupted_run_resumes_without_reprocessing() {
    let dir = tempfile::tempdir().unwrap();
    let rows: Vec<(String, String)> = (0..6)
        .map(|i| (format!("item number {i}"), format!("text {i}")))
        .collect();
    let row_refs: Vec<(&str, &str)> = rows
        .iter()
        .map(|(a, b)| (a.as_str(), b.as_str()))
        .collect();
    write_input(dir.path(), &row_refs);

    // First run: trip shutdown as soon as the first ad is composed.
    let (first_tx, first_rx) = tokio::sync::oneshot::channel();
    let mut cfg = test_config(dir.path());
    cfg.run.workers = 1;
    let handle = start_pipeline(
        cfg,
        collaborators(Collab {
            compositor: Some(Arc::new(SignalCompositor {
                inner: BasicCompositor,
                first_done: Mutex::new(Some(first_tx)),
            })),
            ..Default::default()
        }),
    );
    first_rx.await.unwrap();
    handle.request_stop();
    let first = handle.wait().await.unwrap();
    assert!(first.success >= 1);
    assert!(first.success < 6);
    assert_eq!(first.failed, 0);

    // Second run resumes and finishes the rest exactly once.
    let mut cfg = test_config(dir.path());
    cfg.run.resume = true;
    let second = start_pipeline(cfg.clone(), collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();

    assert_eq!(second.skipped, first.success);
    assert_eq!(first.success + second.success, 6);

    let progress =
        ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
    assert_eq!(progress.stats().get("done"), Some(&6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stage2_exhaustion_keeps_last_composition_and_marks_done() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[("red sneakers", "half price")]);
    let cfg = test_config(dir.path());

    // Initial check and both recompose attempts all rejected.
    let handle = start_pipeline(
        cfg.clone(),
        collaborators(Collab {
            verifier: Some(ScriptedVerifier::with_stage2(&[false, false, false])),
            conditioner: Some(Arc::new(OpaqueConditioner)),
            ..Default::default()
        }),
    );
    let stats = handle.wait().await.unwrap();

    assert_eq!(stats.success, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.post_verify_fails, 1);
    assert_eq!(stats.recomposes, 2);
    assert!(cfg.paths.images_dir.join("ad_0001.jpg").exists());

    let progress =
        ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
    assert!(progress.is_done(0));
    let outcome = outcome_for(&progress, 0);
    assert_eq!(outcome.recomposed, Some(false));
    assert!(!outcome.stage2.unwrap().accepted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_hit_skips_stage1_verification() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[("red sneakers", "a")]);

    let cfg = test_config(dir.path());
    start_pipeline(cfg, collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();

    // Second run would reject everything at stage 1, but the cache hit
    // bypasses selection entirely.
    let cfg = test_config(dir.path());
    let stats = start_pipeline(
        cfg,
        collaborators(Collab {
            verifier: Some(ScriptedVerifier::rejecting()),
            ..Default::default()
        }),
    )
    .wait()
    .await
    .unwrap();

    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.verified, 0);
    assert_eq!(stats.placeholder, 0);
}

// ── boundaries ──────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_table_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[]);
    let cfg = test_config(dir.path());

    let stats = start_pipeline(cfg.clone(), collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.skipped, 0);
    let images: Vec<_> = std::fs::read_dir(&cfg.paths.images_dir)
        .map(|d| d.collect())
        .unwrap_or_default();
    assert!(images.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_at_end_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[("red sneakers", "a"), ("coffee beans", "b")]);
    let mut cfg = test_config(dir.path());
    cfg.run.start_index = Some(2);
    cfg.run.end_index = Some(2);

    let stats = start_pipeline(cfg, collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.skipped, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fully_done_resume_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[("red sneakers", "a"), ("coffee beans", "b")]);

    let cfg = test_config(dir.path());
    start_pipeline(cfg, collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();

    let mut cfg = test_config(dir.path());
    cfg.run.resume = true;
    let stats = start_pipeline(cfg, collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.skipped, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn serial_and_parallel_runs_agree_on_done_set() {
    let rows: &[(&str, &str)] = &[
        ("red sneakers", "a"),
        ("coffee beans", "b"),
        ("galaxy phone", "c"),
        ("desk lamp", "d"),
    ];

    let mut done_sets = Vec::new();
    for workers in [1usize, 3] {
        let dir = tempfile::tempdir().unwrap();
        write_input(dir.path(), rows);
        let mut cfg = test_config(dir.path());
        cfg.run.workers = workers;

        start_pipeline(cfg.clone(), collaborators(Collab::default()))
            .wait()
            .await
            .unwrap();

        let progress =
            ProgressStore::open(&cfg.paths.progress_file, cfg.run.dlq_max_retries).unwrap();
        let done: Vec<usize> = (0..rows.len()).filter(|i| progress.is_done(*i)).collect();
        done_sets.push(done);
    }
    assert_eq!(done_sets[0], done_sets[1]);
    assert_eq!(done_sets[0], vec![0, 1, 2, 3]);
}

// ── cache behavior across runs ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_query_hits_cache_on_second_run() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), &[("red sneakers", "a")]);

    let cfg = test_config(dir.path());
    let stats = start_pipeline(cfg.clone(), collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();
    assert_eq!(stats.cache_hits, 0);

    let cache = ImageCache::open(&cfg.paths.cache_file).unwrap();
    assert_eq!(cache.stats().entries, 1);
    drop(cache);

    // Fresh run over the same input (no resume): the artifact comes from
    // the cache instead of search.
    let cfg2 = test_config(dir.path());
    let stats = start_pipeline(cfg2, collaborators(Collab::default()))
        .wait()
        .await
        .unwrap();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.success, 1);
}
