use crate::cli::Cli;
use crate::document::{is_language_code, ExtractOptions};
use crate::retry::RetryConfig;
use crate::tuner::TunerConfig;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Immutable configuration snapshot for one run.
#[derive(Debug, Clone)]
pub struct Config {
    // Inference endpoint
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub prompt_file: Option<PathBuf>,
    pub request_timeout: Duration,

    // Languages
    pub target_languages: Vec<String>,
    pub source_priority: Vec<String>,
    pub empty_is_missing: bool,
    pub record_id_key: String,

    // Directories and logs
    pub todo_dir: PathBuf,
    pub done_dir: PathBuf,
    pub failed_dir: Option<PathBuf>,
    pub progress_log: PathBuf,

    // Concurrency
    pub workers: usize,
    pub max_workers: usize,
    pub auto_tune: bool,
    pub max_open_files: usize,
    pub checkpoint_every: usize,

    pub retry: RetryConfig,
    pub tuner: TunerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let retry = RetryConfig::new(
            env_parse("MAX_ATTEMPTS", 3)?,
            Duration::from_millis(env_parse("RETRY_INITIAL_DELAY_MS", 1000)?),
        )
        .with_max_delay(Duration::from_millis(env_parse("RETRY_MAX_DELAY_MS", 30_000)?))
        .with_backoff_multiplier(env_parse("RETRY_BACKOFF_MULTIPLIER", 2.0)?)
        .with_jitter(env_bool("RETRY_JITTER", true)?);

        let tuner = TunerConfig {
            window: env_parse("TUNE_WINDOW", 20)?,
            failure_threshold: env_parse("TUNE_FAILURE_THRESHOLD", 0.2)?,
            latency_growth: env_parse("TUNE_LATENCY_GROWTH", 1.5)?,
            increase_step: env_parse("TUNE_INCREASE_STEP", 1)?,
            decrease_factor: env_parse("TUNE_DECREASE_FACTOR", 0.5)?,
        };

        Ok(Self {
            api_url: std::env::var("AI_API_URL").context("AI_API_URL not set")?,
            api_key: std::env::var("AI_API_KEY").ok().filter(|k| !k.is_empty()),
            model: std::env::var("AI_MODEL_NAME").unwrap_or_else(|_| "qwen/qwen3-8b".to_string()),
            prompt_file: std::env::var("PROMPT_FILE").ok().map(PathBuf::from),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 180)?),

            target_languages: env_list("TARGET_LANGUAGES", "de,en,fr,it,es,nl,pl"),
            source_priority: env_list("SOURCE_LANGUAGE_PRIORITY", "de,en,fr"),
            empty_is_missing: env_bool("EMPTY_STRING_IS_MISSING", false)?,
            record_id_key: std::env::var("RECORD_ID_KEY").unwrap_or_else(|_| "id".to_string()),

            todo_dir: env_path("TODO_DIR", "data/todo"),
            done_dir: env_path("DONE_DIR", "data/done"),
            failed_dir: std::env::var("FAILED_DIR").ok().map(PathBuf::from),
            progress_log: env_path("PROGRESS_LOG", "translation_log.jsonl"),

            workers: env_parse("WORKERS", 1)?,
            max_workers: env_parse("MAX_WORKERS", 8)?,
            auto_tune: env_bool("AUTO_TUNE", false)?,
            max_open_files: env_parse("MAX_OPEN_FILES", 4)?,
            checkpoint_every: env_parse("CHECKPOINT_EVERY", 100)?,

            retry,
            tuner,
        })
    }

    /// Command-line flags take precedence over the environment.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(dir) = &cli.todo_dir {
            self.todo_dir = dir.clone();
        }
        if let Some(dir) = &cli.done_dir {
            self.done_dir = dir.clone();
        }
        if let Some(dir) = &cli.failed_dir {
            self.failed_dir = Some(dir.clone());
        }
        if let Some(file) = &cli.prompt_file {
            self.prompt_file = Some(file.clone());
        }
        if let Some(model) = &cli.model {
            self.model = model.clone();
        }
        if let Some(langs) = &cli.languages {
            self.target_languages = split_list(langs);
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
            // An explicit worker count above the default ceiling raises the ceiling.
            self.max_workers = self.max_workers.max(workers);
        }
        if let Some(max) = cli.max_workers {
            self.max_workers = max;
        }
        if cli.auto_tune {
            self.auto_tune = true;
        }
        if let Some(attempts) = cli.max_attempts {
            self.retry.max_attempts = attempts;
        }
        if cli.empty_is_missing {
            self.empty_is_missing = true;
        }
        if let Some(log) = &cli.progress_log {
            self.progress_log = log.clone();
        }
        self
    }

    /// Reject configurations that would make the run meaningless. Called
    /// before any file is touched.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("AI_API_URL is not a valid URL: {}", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("AI_API_URL must use http or https, got {}", url.scheme());
        }
        if self.model.trim().is_empty() {
            bail!("Model name must not be empty");
        }
        if self.workers == 0 {
            bail!("WORKERS must be at least 1");
        }
        // The ceiling only bounds the auto-tuner; a fixed pool runs at WORKERS.
        if self.auto_tune && self.max_workers < self.workers {
            bail!(
                "MAX_WORKERS ({}) must be >= WORKERS ({})",
                self.max_workers,
                self.workers
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.max_open_files == 0 {
            bail!("MAX_OPEN_FILES must be at least 1");
        }
        if self.target_languages.is_empty() {
            bail!("TARGET_LANGUAGES must name at least one language");
        }
        for lang in self.target_languages.iter().chain(&self.source_priority) {
            if !is_language_code(lang) {
                bail!("Invalid language code: '{}'", lang);
            }
        }
        if self.auto_tune {
            self.tuner.validate()?;
        }
        if let Some(path) = &self.prompt_file {
            if !path.is_file() {
                bail!("Prompt file not found: {}", path.display());
            }
        }
        Ok(())
    }

    /// Read the configured system prompt, if any.
    pub fn load_system_prompt(&self) -> Result<Option<String>> {
        match &self.prompt_file {
            Some(path) => {
                let prompt = std::fs::read_to_string(path)
                    .with_context(|| format!("Could not read prompt file {}", path.display()))?;
                Ok(Some(prompt))
            }
            None => Ok(None),
        }
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            target_languages: self.target_languages.clone(),
            source_priority: self.source_priority.clone(),
            empty_is_missing: self.empty_is_missing,
            record_id_key: self.record_id_key.clone(),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        _ => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{} must be a boolean, got '{}'", name, other),
        },
        Err(_) => Ok(default),
    }
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    split_list(&std::env::var(name).unwrap_or_else(|_| default.to_string()))
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(name).unwrap_or_else(|_| default.to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
pub(crate) fn test_config(api_url: &str) -> Config {
    Config {
        api_url: api_url.to_string(),
        api_key: None,
        model: "test-model".to_string(),
        prompt_file: None,
        request_timeout: Duration::from_secs(5),
        target_languages: ["de", "en", "fr"].iter().map(|s| s.to_string()).collect(),
        source_priority: ["de", "en", "fr"].iter().map(|s| s.to_string()).collect(),
        empty_is_missing: false,
        record_id_key: "id".to_string(),
        todo_dir: PathBuf::from("todo"),
        done_dir: PathBuf::from("done"),
        failed_dir: None,
        progress_log: PathBuf::from("log.jsonl"),
        workers: 2,
        max_workers: 4,
        auto_tune: false,
        max_open_files: 2,
        checkpoint_every: 100,
        retry: RetryConfig::new(3, Duration::from_millis(1)).with_jitter(false),
        tuner: TunerConfig::default(),
    }
}
