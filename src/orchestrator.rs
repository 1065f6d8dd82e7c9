//! File orchestrator: discovery, per-file bookkeeping, dispatch loop and
//! promotion to the completed directory.
//!
//! Per file: pending -> in progress (units queued) -> complete (promoted) or
//! failed (checkpointed, left in pending or moved to the failed directory).
//! On shutdown, in-flight requests finish, nothing new is admitted, and every
//! open file is checkpointed so the next run only sees the missing slots.

use crate::client::Translator;
use crate::config::Config;
use crate::document::{ExtractOptions, FileId, JobDocument};
use crate::error::JobFileError;
use crate::pool::{Completion, RetryQueue, UnitQueue, WorkerPool};
use crate::progress::{FileEvent, FileRecord, OutcomeKind, OutcomeRecord, ProgressLog};
use crate::retry::UnitState;
use crate::storage::{self, Recovery};
use crate::tuner::ConcurrencyController;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Totals for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub files_discovered: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_interrupted: usize,
    pub units_succeeded: usize,
    pub units_failed: usize,
    pub units_retried: usize,
    pub final_target: usize,
    pub peak_in_flight: usize,
}

impl RunSummary {
    /// True when every discovered file reached the completed directory.
    pub fn all_complete(&self) -> bool {
        self.files_completed == self.files_discovered
    }
}

struct OpenFile {
    path: PathBuf,
    name: String,
    document: Arc<Mutex<JobDocument>>,
    outstanding: usize,
    succeeded: usize,
    failed_slots: Vec<String>,
    since_checkpoint: usize,
}

impl OpenFile {
    fn snapshot(&self) -> JobDocument {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct Orchestrator<T: Translator> {
    config: Config,
    options: ExtractOptions,
    pool: WorkerPool<T>,
    controller: ConcurrencyController,
    log: ProgressLog,
    cancel: CancellationToken,

    queue: UnitQueue,
    retries: RetryQueue,
    files: HashMap<FileId, OpenFile>,
    next_file_id: FileId,
    summary: RunSummary,
}

impl<T: Translator> Orchestrator<T> {
    pub fn new(config: Config, translator: T, log: ProgressLog, cancel: CancellationToken) -> Self {
        let controller = if config.auto_tune {
            ConcurrencyController::adaptive(config.workers, config.max_workers, config.tuner.clone())
        } else {
            ConcurrencyController::fixed(config.workers)
        };
        let pool = WorkerPool::new(Arc::new(translator), config.retry.clone());

        Self {
            options: config.extract_options(),
            pool,
            controller,
            log,
            cancel,
            queue: UnitQueue::new(),
            retries: RetryQueue::new(),
            files: HashMap::new(),
            next_file_id: 0,
            summary: RunSummary::default(),
            config,
        }
    }

    /// Process every `.json` file in the pending directory.
    ///
    /// Only directory setup and discovery errors are returned; anything that
    /// goes wrong with an individual file or unit is recorded in the summary.
    pub async fn run(mut self) -> Result<RunSummary> {
        std::fs::create_dir_all(&self.config.todo_dir).with_context(|| {
            format!("Could not create todo dir {}", self.config.todo_dir.display())
        })?;
        std::fs::create_dir_all(&self.config.done_dir).with_context(|| {
            format!("Could not create done dir {}", self.config.done_dir.display())
        })?;

        let mut pending: VecDeque<PathBuf> = storage::discover(&self.config.todo_dir)
            .with_context(|| format!("Could not scan {}", self.config.todo_dir.display()))?
            .into();
        self.summary.files_discovered = pending.len();

        if pending.is_empty() {
            info!("No files to process in {}", self.config.todo_dir.display());
            return Ok(self.summary);
        }
        info!(
            "Starting {} job(s) with {} concurrency {} (ceiling {})",
            pending.len(),
            if self.controller.is_adaptive() { "adaptive" } else { "fixed" },
            self.controller.target(),
            self.controller.ceiling()
        );

        let mut shutting_down = false;

        loop {
            if !shutting_down && self.cancel.is_cancelled() {
                shutting_down = true;
                info!(
                    "Shutdown requested: waiting for {} in-flight request(s), no new units will start",
                    self.pool.in_flight()
                );
            }

            if !shutting_down {
                while self.files.len() < self.config.max_open_files {
                    let Some(path) = pending.pop_front() else {
                        break;
                    };
                    self.open_file(path);
                }

                while self.pool.has_capacity(self.controller.target()) {
                    let Some(unit) = self.queue.pop() else {
                        break;
                    };
                    let Some(file) = self.files.get(&unit.file) else {
                        continue;
                    };
                    let document = Arc::clone(&file.document);
                    self.pool.spawn(unit, document);
                }
            }

            let idle = self.pool.in_flight() == 0;
            if idle && (shutting_down || (self.queue.is_empty() && self.retries.is_empty() && pending.is_empty())) {
                break;
            }

            tokio::select! {
                Some(completion) = self.pool.next_completion(), if !idle => {
                    self.handle_completion(completion);
                }
                Some(unit) = self.retries.next_ready(), if !shutting_down && !self.retries.is_empty() => {
                    self.queue.push(unit);
                }
                // Handled at the top of the loop.
                _ = self.cancel.cancelled(), if !shutting_down => {}
                else => break,
            }
        }

        if shutting_down {
            self.interrupt_open_files();
        }

        self.summary.final_target = self.controller.target();
        self.summary.peak_in_flight = self.pool.peak();
        self.log_summary();
        Ok(self.summary)
    }

    fn open_file(&mut self, path: PathBuf) {
        let name = file_name(&path);

        match storage::recover_interrupted(&path, &self.config.done_dir, self.options.empty_is_missing) {
            Ok(Recovery::NotNeeded) => {}
            Ok(Recovery::Recovered) => {
                info!("{}: finishing an interrupted promotion", name);
                self.summary.files_completed += 1;
                self.file_event(&name, FileEvent::Recovered, 0, Vec::new(), None);
                return;
            }
            Ok(Recovery::Diverged) => {
                let error = JobFileError::Diverged(path.clone()).to_string();
                self.summary.files_failed += 1;
                self.file_event(&name, FileEvent::Failed, 0, Vec::new(), Some(error));
                return;
            }
            Err(e) => {
                self.fail_unreadable(&path, &name, e);
                return;
            }
        }

        let document = match JobDocument::load(&path) {
            Ok(document) => document,
            Err(e) => {
                self.fail_unreadable(&path, &name, e);
                return;
            }
        };

        let id = self.next_file_id;
        self.next_file_id += 1;

        let extraction = document.extract(id, &self.options);
        for field in &extraction.untranslatable {
            warn!(
                "{}: record {} field '{}' has no source text, skipping",
                name, field.record_id, field.field
            );
        }

        if extraction.units.is_empty() {
            // Nothing to translate: move the file as-is so its bytes stay untouched.
            match storage::move_to(&path, &self.config.done_dir) {
                Ok(_) => {
                    self.summary.files_completed += 1;
                    self.file_event(&name, FileEvent::Completed, 0, Vec::new(), None);
                }
                Err(e) => {
                    self.summary.files_failed += 1;
                    self.file_event(&name, FileEvent::Failed, 0, Vec::new(), Some(e.to_string()));
                }
            }
            return;
        }

        info!(
            "{}: {} records, {} units to translate",
            name,
            document.len(),
            extraction.units.len()
        );

        self.files.insert(
            id,
            OpenFile {
                path,
                name,
                document: Arc::new(Mutex::new(document)),
                outstanding: extraction.units.len(),
                succeeded: 0,
                failed_slots: Vec::new(),
                since_checkpoint: 0,
            },
        );
        self.queue.extend(extraction.units);
    }

    fn fail_unreadable(&mut self, path: &Path, name: &str, error: JobFileError) {
        self.summary.files_failed += 1;
        self.file_event(name, FileEvent::Failed, 0, Vec::new(), Some(error.to_string()));
        if let Some(dir) = self.config.failed_dir.clone() {
            if let Err(e) = storage::move_to(path, &dir) {
                warn!("{}: could not move to failed dir: {}", name, e);
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        if let Some(adjustment) = self.controller.observe(completion.sample()) {
            tracing::debug!("Tuner decision: {:?}", adjustment);
        }

        let Completion {
            unit,
            latency,
            error,
        } = completion;
        let Some(file) = self.files.get_mut(&unit.file) else {
            return;
        };
        let error_text = error.as_ref().map(|e| e.to_string());

        match unit.state.clone() {
            UnitState::Succeeded { .. } => {
                file.succeeded += 1;
                file.outstanding -= 1;
                file.since_checkpoint += 1;
                self.summary.units_succeeded += 1;
                self.log
                    .unit(OutcomeRecord::new(&file.name, &unit, OutcomeKind::Succeeded, latency, None));

                if file.outstanding > 0 && file.since_checkpoint >= self.config.checkpoint_every.max(1) {
                    file.since_checkpoint = 0;
                    if let Err(e) = storage::checkpoint(&file.path, &file.snapshot()) {
                        warn!("{}: checkpoint failed: {}", file.name, e);
                    }
                }
            }
            UnitState::Retrying { delay, .. } => {
                self.summary.units_retried += 1;
                self.log.unit(OutcomeRecord::new(
                    &file.name,
                    &unit,
                    OutcomeKind::Retrying,
                    latency,
                    error_text,
                ));
                self.retries.schedule(unit, delay);
                return;
            }
            UnitState::Failed { reason, .. } => {
                file.outstanding -= 1;
                file.failed_slots.push(unit.slot());
                self.summary.units_failed += 1;
                self.log.unit(OutcomeRecord::new(
                    &file.name,
                    &unit,
                    OutcomeKind::Failed,
                    latency,
                    Some(reason),
                ));
            }
            UnitState::Pending | UnitState::Dispatched { .. } => {
                warn!("{}: unit {} returned in state {:?}", file.name, unit.slot(), unit.state);
                return;
            }
        }

        if file.outstanding == 0 {
            self.finalize(unit.file);
        }
    }

    /// Every unit of the file has a terminal outcome: promote or fail it.
    fn finalize(&mut self, id: FileId) {
        let Some(mut file) = self.files.remove(&id) else {
            return;
        };
        let document = file.snapshot();
        self.settle(&mut file, &document);
    }

    fn settle(&mut self, file: &mut OpenFile, document: &JobDocument) {
        if file.failed_slots.is_empty() {
            match storage::promote(&file.path, &self.config.done_dir, document) {
                Ok(target) => {
                    self.summary.files_completed += 1;
                    info!("{}: written to {}", file.name, target.display());
                    self.file_event(&file.name, FileEvent::Completed, file.succeeded, Vec::new(), None);
                }
                Err(e) => {
                    self.summary.files_failed += 1;
                    // Keep the translations so the next run does not redo them.
                    if let Err(ce) = storage::checkpoint(&file.path, document) {
                        warn!("{}: checkpoint failed: {}", file.name, ce);
                    }
                    self.file_event(
                        &file.name,
                        FileEvent::Failed,
                        file.succeeded,
                        Vec::new(),
                        Some(e.to_string()),
                    );
                }
            }
            return;
        }

        self.summary.files_failed += 1;
        if let Err(e) = storage::checkpoint(&file.path, document) {
            warn!("{}: checkpoint failed: {}", file.name, e);
        }
        if let Some(dir) = self.config.failed_dir.clone() {
            if let Err(e) = storage::move_to(&file.path, &dir) {
                warn!("{}: could not move to failed dir: {}", file.name, e);
            }
        }
        let failed_slots = std::mem::take(&mut file.failed_slots);
        self.file_event(&file.name, FileEvent::Failed, file.succeeded, failed_slots, None);
    }

    /// Persist partial progress for every file still open at shutdown.
    fn interrupt_open_files(&mut self) {
        let mut ids: Vec<FileId> = self.files.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let Some(file) = self.files.remove(&id) else {
                continue;
            };
            self.summary.files_interrupted += 1;
            if file.succeeded > 0 {
                if let Err(e) = storage::checkpoint(&file.path, &file.snapshot()) {
                    warn!("{}: checkpoint failed: {}", file.name, e);
                }
            }
            let failed_slots = file.failed_slots.clone();
            self.file_event(&file.name, FileEvent::Interrupted, file.succeeded, failed_slots, None);
        }
    }

    fn file_event(
        &mut self,
        name: &str,
        event: FileEvent,
        units_succeeded: usize,
        failed_slots: Vec<String>,
        error: Option<String>,
    ) {
        self.log.file(FileRecord {
            timestamp: Utc::now(),
            file: name.to_string(),
            event,
            units_succeeded,
            units_failed: failed_slots.len(),
            failed_slots,
            error,
        });
    }

    fn log_summary(&self) {
        let s = &self.summary;
        info!(
            "Run finished: {} discovered, {} completed, {} failed, {} interrupted; units: {} translated, {} failed, {} retries; concurrency final {} peak {}",
            s.files_discovered,
            s.files_completed,
            s.files_failed,
            s.files_interrupted,
            s.units_succeeded,
            s.units_failed,
            s.units_retried,
            s.final_target,
            s.peak_in_flight
        );
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
