//! Append-only progress log.
//!
//! One JSON object per line. Unit lines describe a single request outcome;
//! file lines describe a Job File reaching a final state. Operators grep the
//! `failed` lines to see which (file, record, field, language) slots need
//! another run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Retrying,
    Failed,
}

/// Immutable record of one request for one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub timestamp: DateTime<Utc>,
    pub file: String,
    pub record_id: String,
    pub field: String,
    pub target_language: String,
    pub attempt: u32,
    pub outcome: OutcomeKind,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl OutcomeRecord {
    pub fn new(
        file: &str,
        unit: &crate::document::TranslationUnit,
        outcome: OutcomeKind,
        latency: Duration,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            file: file.to_string(),
            record_id: unit.record_id.clone(),
            field: unit.field.clone(),
            target_language: unit.target_language.clone(),
            attempt: unit.state.attempts(),
            outcome,
            latency_ms: latency.as_millis() as u64,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEvent {
    Completed,
    Failed,
    Interrupted,
    Recovered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub timestamp: DateTime<Utc>,
    pub file: String,
    pub event: FileEvent,
    pub units_succeeded: usize,
    pub units_failed: usize,
    /// `record/field/lang` of every failed unit
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_slots: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Unit(OutcomeRecord),
    File(FileRecord),
}

pub struct ProgressLog {
    writer: Option<BufWriter<File>>,
}

impl ProgressLog {
    /// Open (or create) the log for appending.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
        })
    }

    /// A log that only emits tracing events.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn unit(&mut self, record: OutcomeRecord) {
        match record.outcome {
            OutcomeKind::Succeeded => info!(
                "{}: {}/{}/{} translated (attempt {}, {}ms)",
                record.file,
                record.record_id,
                record.field,
                record.target_language,
                record.attempt,
                record.latency_ms
            ),
            OutcomeKind::Retrying => warn!(
                "{}: {}/{}/{} attempt {} failed, will retry: {}",
                record.file,
                record.record_id,
                record.field,
                record.target_language,
                record.attempt,
                record.error.as_deref().unwrap_or("unknown error")
            ),
            OutcomeKind::Failed => error!(
                "{}: {}/{}/{} failed after {} attempt(s): {}",
                record.file,
                record.record_id,
                record.field,
                record.target_language,
                record.attempt,
                record.error.as_deref().unwrap_or("unknown error")
            ),
        }
        self.append(&LogEntry::Unit(record));
    }

    pub fn file(&mut self, record: FileRecord) {
        match record.event {
            FileEvent::Completed | FileEvent::Recovered => info!(
                "{}: {:?} ({} units translated)",
                record.file, record.event, record.units_succeeded
            ),
            FileEvent::Interrupted => warn!(
                "{}: interrupted with {} units translated, will resume on next run",
                record.file, record.units_succeeded
            ),
            FileEvent::Failed => error!(
                "{}: failed ({} units failed: {:?}){}",
                record.file,
                record.units_failed,
                record.failed_slots,
                record
                    .error
                    .as_deref()
                    .map(|e| format!(" - {}", e))
                    .unwrap_or_default()
            ),
        }
        self.append(&LogEntry::File(record));
    }

    fn append(&mut self, entry: &LogEntry) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = serde_json::to_writer(&mut *writer, entry)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!("Failed to append to progress log: {}", e);
        }
    }
}

/// Parse a progress log back into entries, skipping malformed lines.
pub fn read_log(path: &Path) -> std::io::Result<Vec<LogEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TranslationUnit;
    use crate::retry::UnitState;

    fn unit() -> TranslationUnit {
        TranslationUnit {
            file: 0,
            record_index: 0,
            record_id: "42".to_string(),
            field: "name".to_string(),
            source_language: "de".to_string(),
            source_text: "Tisch".to_string(),
            target_language: "en".to_string(),
            state: UnitState::Succeeded { attempts: 3 },
        }
    }

    #[test]
    fn test_outcome_record_takes_attempts_from_state() {
        let record = OutcomeRecord::new(
            "a.json",
            &unit(),
            OutcomeKind::Succeeded,
            Duration::from_millis(1500),
            None,
        );
        assert_eq!(record.attempt, 3);
        assert_eq!(record.latency_ms, 1500);
        assert_eq!(record.record_id, "42");
    }

    #[test]
    fn test_unit_line_schema() {
        let record = OutcomeRecord::new(
            "a.json",
            &unit(),
            OutcomeKind::Failed,
            Duration::from_millis(10),
            Some("bad".to_string()),
        );
        let json = serde_json::to_value(LogEntry::Unit(record)).unwrap();

        assert_eq!(json["type"], "unit");
        assert_eq!(json["outcome"], "failed");
        for key in [
            "timestamp",
            "file",
            "record_id",
            "field",
            "target_language",
            "attempt",
            "latency_ms",
            "error",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_success_line_omits_error() {
        let record = OutcomeRecord::new(
            "a.json",
            &unit(),
            OutcomeKind::Succeeded,
            Duration::ZERO,
            None,
        );
        let json = serde_json::to_string(&LogEntry::Unit(record)).unwrap();
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_log_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("progress.jsonl");

        {
            let mut log = ProgressLog::open(&path).unwrap();
            log.unit(OutcomeRecord::new(
                "a.json",
                &unit(),
                OutcomeKind::Succeeded,
                Duration::ZERO,
                None,
            ));
        }
        {
            let mut log = ProgressLog::open(&path).unwrap();
            log.file(FileRecord {
                timestamp: Utc::now(),
                file: "a.json".to_string(),
                event: FileEvent::Completed,
                units_succeeded: 1,
                units_failed: 0,
                failed_slots: Vec::new(),
                error: None,
            });
        }

        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], LogEntry::Unit(_)));
        assert!(matches!(
            entries[1],
            LogEntry::File(FileRecord {
                event: FileEvent::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let mut log = ProgressLog::disabled();
        log.unit(OutcomeRecord::new(
            "a.json",
            &unit(),
            OutcomeKind::Retrying,
            Duration::ZERO,
            Some("timeout".to_string()),
        ));
    }
}
