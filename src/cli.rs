use clap::Parser;
use std::path::PathBuf;

/// Batch translate JSON export files, filling in missing language variants.
///
/// Every flag falls back to its environment variable (see `Config::from_env`).
#[derive(Debug, Parser)]
#[command(name = "json-export-translator", version, about)]
pub struct Cli {
    /// Directory with files to process
    #[arg(long)]
    pub todo_dir: Option<PathBuf>,

    /// Directory to move completed files to
    #[arg(long)]
    pub done_dir: Option<PathBuf>,

    /// Directory to move failed files to (default: leave them in the todo directory)
    #[arg(long)]
    pub failed_dir: Option<PathBuf>,

    /// Path to the system prompt file
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// Model name for the API request
    #[arg(long)]
    pub model: Option<String>,

    /// Comma-separated target language codes
    #[arg(long)]
    pub languages: Option<String>,

    /// Worker count (initial target when auto-tuning)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Concurrency ceiling for the auto-tuner
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Adapt the number of in-flight requests to endpoint latency and errors
    #[arg(long)]
    pub auto_tune: bool,

    /// Attempts per unit before a transient failure becomes terminal
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Treat empty-string values as missing translations
    #[arg(long)]
    pub empty_is_missing: bool,

    /// Append-only JSON lines log of unit outcomes
    #[arg(long)]
    pub progress_log: Option<PathBuf>,
}
