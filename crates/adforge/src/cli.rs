use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "adforge", version, about = "Batch ad-image generation pipeline")]
pub struct Cli {
    /// JSON config file; missing file means defaults.
    #[arg(short = 'c', long, env = "ADFORGE_CONFIG", default_value = "adforge.json")]
    pub config: PathBuf,

    /// Input CSV (overrides the config file).
    #[arg(short = 'i', long, env = "ADFORGE_INPUT")]
    pub input: Option<PathBuf>,

    /// Re-root all data paths (output, temp, cache, progress) here.
    #[arg(long, env = "ADFORGE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Number of row workers to run in parallel.
    #[arg(
        short = 'w',
        long,
        env = "ADFORGE_WORKERS",
        value_parser = clap::value_parser!(u16).range(1..=32)
    )]
    pub workers: Option<u16>,

    /// First row index to process (0-based).
    #[arg(long)]
    pub start: Option<usize>,

    /// One past the last row index to process.
    #[arg(long)]
    pub end: Option<usize>,

    /// Skip rows a previous run already finished.
    #[arg(long, env = "ADFORGE_RESUME", default_value_t = false)]
    pub resume: bool,

    /// Reset the progress store before running.
    #[arg(long, default_value_t = false)]
    pub fresh: bool,

    /// Run every stage except writing composed ads.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Disable the dead-letter retry pass.
    #[arg(long, default_value_t = false)]
    pub no_dlq: bool,

    /// Disable the image cache.
    #[arg(long, default_value_t = false)]
    pub no_cache: bool,

    /// SearxNG instance to search against (repeatable, priority order).
    #[arg(long = "searx", env = "ADFORGE_SEARX_URL", value_delimiter = ',')]
    pub searx: Vec<reqwest::Url>,

    /// Print progress-store and cache statistics, then exit.
    #[arg(long, default_value_t = false)]
    pub status: bool,

    /// Print the first N built queries without running, then exit.
    #[arg(long, value_name = "N")]
    pub preview: Option<usize>,

    /// Clear the image cache, then exit.
    #[arg(long, default_value_t = false)]
    pub clear_cache: bool,

    /// Disable the progress bar.
    #[arg(long, env = "ADFORGE_NO_PROGRESS", default_value_t = false)]
    pub no_progress: bool,
}
