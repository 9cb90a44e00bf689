//! Pipeline configuration.
//!
//! The whole configuration is one JSON document loaded from disk (when
//! present) and overridable by CLI flags. Saving uses a sibling temp file and
//! rename so a crash mid-write never leaves a torn config behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Startup validation failure. Any of these aborts before work begins.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("input table missing: {0}")]
    MissingInput(PathBuf),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_image_column() -> String {
    "image_path".to_string()
}

/// Filesystem layout for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub csv_input: PathBuf,
    pub csv_output: PathBuf,
    pub images_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub progress_file: PathBuf,
    pub cache_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            csv_input: data.join("input").join("ads.csv"),
            csv_output: data.join("output").join("ads_with_images.csv"),
            images_dir: data.join("output").join("images"),
            temp_dir: data.join("temp").join("workers"),
            progress_file: data.join("temp").join("progress.json"),
            cache_file: data.join("cache").join("images.json"),
        }
    }
}

impl PathsConfig {
    /// Create every directory the run writes into.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [
            Some(self.images_dir.as_path()),
            Some(self.temp_dir.as_path()),
            self.csv_output.parent(),
            self.progress_file.parent(),
            self.cache_file.parent(),
        ];
        for dir in dirs.into_iter().flatten() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Re-root every path under `root`. Used by tests and the `--data-dir`
    /// flag.
    pub fn under_root(root: &Path) -> Self {
        Self {
            csv_input: root.join("input").join("ads.csv"),
            csv_output: root.join("output").join("ads_with_images.csv"),
            images_dir: root.join("output").join("images"),
            temp_dir: root.join("temp").join("workers"),
            progress_file: root.join("temp").join("progress.json"),
            cache_file: root.join("cache").join("images.json"),
        }
    }
}

/// How a search query is built from a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Columns tried in order; the first usable value wins.
    pub priority_columns: Vec<String>,
    /// Fallback source when no priority column yields a query.
    pub text_column: String,
    /// Columns tried for fallback queries when selection fails outright.
    pub fallback_columns: Vec<String>,
    pub monetary_column: String,
    pub cta_column: String,
    pub color_column: String,
    /// Column receiving the produced image path.
    #[serde(default = "default_image_column")]
    pub image_column: String,
    /// 0 = unlimited.
    pub max_query_words: usize,
    /// Cell values that never become queries.
    pub ignore_values: Vec<String>,
    /// Search-operator junk stripped from query tails.
    pub strip_suffixes: Vec<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            priority_columns: vec![
                "img_desc".into(),
                "keywords".into(),
                "object_detected".into(),
                "product_name".into(),
                "description".into(),
                "text".into(),
            ],
            text_column: "text".into(),
            fallback_columns: vec!["object_detected".into(), "keywords".into()],
            monetary_column: "monetary_mention".into(),
            cta_column: "call_to_action".into(),
            color_column: "dominant_colour".into(),
            image_column: default_image_column(),
            max_query_words: 0,
            ignore_values: vec![
                "nan".into(),
                "none".into(),
                "general".into(),
                "food".into(),
                "automotive".into(),
                "object".into(),
                "unknown".into(),
                "null".into(),
            ],
            strip_suffixes: vec![
                "filetype png".into(),
                "filetype jpg".into(),
                "filetype jpeg".into(),
                "filetype webp".into(),
                "site:".into(),
                "inurl:".into(),
            ],
        }
    }
}

/// Gates applied to downloaded candidate images.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_width: u32,
    pub min_height: u32,
    pub min_file_bytes: usize,
    pub min_aspect: f64,
    pub max_aspect: f64,
    pub min_unique_colors: usize,
    pub min_std_dev: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_width: 60,
            min_height: 60,
            min_file_bytes: 30_000,
            min_aspect: 0.3,
            max_aspect: 3.0,
            min_unique_colors: 100,
            min_std_dev: 10.0,
        }
    }
}

/// Background-conditioning policy and sanity gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub enabled: bool,
    /// Accept band for the retained-pixel ratio after removal.
    pub min_retention: f64,
    pub max_retention: f64,
    /// Reject when the retained bounding box covers less of the canvas.
    pub min_object_ratio: f64,
    /// Reject when the retained bounding box is mostly hollow.
    pub min_fill_ratio: f64,
    /// Queries mentioning any of these skip removal entirely.
    pub scene_keywords: Vec<String>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_retention: 0.05,
            max_retention: 0.95,
            min_object_ratio: 0.10,
            min_fill_ratio: 0.15,
            scene_keywords: [
                "highway", "road", "street", "city", "landscape", "beach", "mountain",
                "forest", "park", "building", "house", "room", "interior", "outdoor",
                "sky", "sunset", "sunrise", "driving", "parking", "traffic", "accident",
                "breakdown", "crowd", "group", "family", "restaurant", "dining",
                "concert", "festival", "wedding", "ceremony", "meeting", "party",
                "office", "store", "shop", "mall", "gym", "stadium", "arena",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// One search endpoint the binary should construct a provider for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEndpoint {
    pub name: String,
    pub base_url: String,
}

/// Provider fan-in behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Endpoints in priority order.
    pub endpoints: Vec<SearchEndpoint>,
    pub max_results: usize,
    /// Stop querying further providers once this many candidates exist.
    pub sufficiency_threshold: usize,
    pub inter_provider_delay_ms: u64,
    pub rate_limit_per_sec: f64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_results: 100,
            sufficiency_threshold: 10,
            inter_provider_delay_ms: 500,
            rate_limit_per_sec: 2.0,
            breaker_threshold: 5,
            breaker_cooldown_secs: 120.0,
        }
    }
}

/// Two-stage verification thresholds.
///
/// Stage 1 checks the downloaded candidate with strict thresholds; stage 2
/// re-checks the composed ad with relaxed ones, since text overlays and
/// gradients depress the scores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub enabled: bool,
    pub use_post_compose: bool,

    pub clip_accept: f64,
    pub clip_reject: f64,
    pub combined_accept: f64,
    pub combined_reject: f64,

    pub post_clip_accept: f64,
    pub post_clip_reject: f64,
    pub post_combined_accept: f64,
    pub post_combined_reject: f64,

    pub clip_weight: f64,
    pub blip_weight: f64,

    pub max_verify_candidates: usize,
    pub min_candidates_before_best: usize,

    pub max_recompose_attempts: usize,
    pub recompose_without_bg: bool,
    pub recompose_simpler_text: bool,

    /// Treat verifier errors as acceptance instead of rejection.
    pub accept_on_model_failure: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_post_compose: true,
            clip_accept: 0.25,
            clip_reject: 0.15,
            combined_accept: 0.25,
            combined_reject: 0.12,
            post_clip_accept: 0.18,
            post_clip_reject: 0.08,
            post_combined_accept: 0.15,
            post_combined_reject: 0.06,
            clip_weight: 0.6,
            blip_weight: 0.4,
            max_verify_candidates: 10,
            min_candidates_before_best: 3,
            max_recompose_attempts: 2,
            recompose_without_bg: true,
            recompose_simpler_text: true,
            accept_on_model_failure: true,
        }
    }
}

/// Fire-and-forget notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub milestone_every: u64,
    pub on_completion: bool,
    pub on_failure: bool,
    pub on_milestone: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            milestone_every: 100,
            on_completion: true,
            on_failure: true,
            on_milestone: true,
        }
    }
}

/// Execution knobs for the run itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Worker pool size. 1 selects the serial path.
    pub workers: usize,
    /// Serial-path delay between rows (milliseconds).
    pub inter_row_delay_ms: u64,
    /// Checkpoint the CSV every Nth completed row.
    pub csv_save_interval: u64,
    pub download_timeout_secs: u64,
    /// Upper bound on wall time for one row.
    pub worker_timeout_secs: u64,
    pub chunk_size: usize,
    pub enable_cache: bool,
    pub enable_dlq: bool,
    pub dlq_max_retries: u32,
    pub resume: bool,
    pub dry_run: bool,
    pub remove_temp: bool,
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
}

impl RunConfig {
    /// Hard ceiling on pool size; more concurrency than this mostly earns
    /// provider bans.
    pub const MAX_WORKERS: usize = 32;
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            inter_row_delay_ms: 500,
            csv_save_interval: 5,
            download_timeout_secs: 10,
            worker_timeout_secs: 300,
            chunk_size: 50,
            enable_cache: true,
            enable_dlq: true,
            dlq_max_retries: 2,
            resume: false,
            dry_run: false,
            remove_temp: true,
            start_index: None,
            end_index: None,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub query: QueryConfig,
    pub quality: QualityConfig,
    pub background: BackgroundConfig,
    pub search: SearchConfig,
    pub verify: VerifyConfig,
    pub notify: NotifyConfig,
    pub run: RunConfig,
}

impl AppConfig {
    /// Load from a JSON file; absent file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Save as pretty JSON via temp file + rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with. Called before any
    /// work starts; failures map to exit code 2.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.paths.csv_input.exists() {
            return Err(ConfigError::MissingInput(self.paths.csv_input.clone()));
        }
        if self.run.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "run.workers",
                reason: "must be >= 1".into(),
            });
        }
        if self.run.workers > RunConfig::MAX_WORKERS {
            return Err(ConfigError::Invalid {
                field: "run.workers",
                reason: format!("must be <= {}", RunConfig::MAX_WORKERS),
            });
        }
        if self.run.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "run.chunk_size",
                reason: "must be >= 1".into(),
            });
        }
        if self.run.csv_save_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "run.csv_save_interval",
                reason: "must be >= 1".into(),
            });
        }
        if self.search.rate_limit_per_sec <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "search.rate_limit_per_sec",
                reason: "must be positive".into(),
            });
        }
        if !(self.quality.min_aspect > 0.0 && self.quality.max_aspect >= self.quality.min_aspect) {
            return Err(ConfigError::Invalid {
                field: "quality.min_aspect/max_aspect",
                reason: "need 0 < min <= max".into(),
            });
        }
        for (field, value) in [
            ("verify.clip_accept", self.verify.clip_accept),
            ("verify.clip_reject", self.verify.clip_reject),
            ("verify.combined_accept", self.verify.combined_accept),
            ("verify.combined_reject", self.verify.combined_reject),
            ("verify.post_combined_accept", self.verify.post_combined_accept),
            ("verify.post_combined_reject", self.verify.post_combined_reject),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} outside [0, 1]"),
                });
            }
        }
        if let (Some(start), Some(end)) = (self.run.start_index, self.run.end_index) {
            if start > end {
                return Err(ConfigError::Invalid {
                    field: "run.start_index/end_index",
                    reason: format!("start {start} > end {end}"),
                });
            }
        }
        Ok(())
    }
}
