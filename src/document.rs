//! Job File documents and the Unit Extractor.
//!
//! An export file is a JSON array of records. A record member is a
//! translatable field when its value is an object keyed by language codes:
//!
//! ```json
//! [{ "id": 7, "name": { "de": "Tisch", "en": "Table", "fr": null } }]
//! ```
//!
//! Extraction is pure: it inspects a document and reports which
//! (record, field, language) slots still need a value. It never touches the
//! network or the filesystem.

use crate::error::JobFileError;
use crate::retry::UnitState;
use serde_json::{Map, Value};
use std::path::Path;

/// Index of an open Job File inside the orchestrator.
pub type FileId = usize;

/// Options controlling what counts as missing and where source text comes from.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub target_languages: Vec<String>,
    pub source_priority: Vec<String>,
    /// When false an empty string counts as an existing translation.
    pub empty_is_missing: bool,
    pub record_id_key: String,
}

/// One missing (record, field, target-language) slot, plus what is needed to fill it.
#[derive(Debug, Clone)]
pub struct TranslationUnit {
    pub file: FileId,
    pub record_index: usize,
    pub record_id: String,
    pub field: String,
    pub source_language: String,
    pub source_text: String,
    pub target_language: String,
    pub state: UnitState,
}

impl TranslationUnit {
    /// Human-readable slot name used in logs: `record/field/lang`.
    pub fn slot(&self) -> String {
        format!("{}/{}/{}", self.record_id, self.field, self.target_language)
    }
}

/// A field that has missing slots but no usable source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntranslatableField {
    pub record_id: String,
    pub field: String,
}

/// Result of scanning a whole document.
#[derive(Debug, Default)]
pub struct Extraction {
    pub units: Vec<TranslationUnit>,
    pub untranslatable: Vec<UntranslatableField>,
}

/// ISO 639-1 style key: exactly two lowercase ASCII letters.
pub fn is_language_code(key: &str) -> bool {
    key.len() == 2 && key.bytes().all(|b| b.is_ascii_lowercase())
}

/// A record member is translatable when it maps language codes to values.
pub fn is_translatable_field(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.keys().any(|k| is_language_code(k)))
}

fn is_missing(value: Option<&Value>, empty_is_missing: bool) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) if s.is_empty() => empty_is_missing,
        Some(_) => false,
    }
}

/// Languages of `field` that still need a value, in target-language order.
pub fn missing_languages(field: &Map<String, Value>, options: &ExtractOptions) -> Vec<String> {
    options
        .target_languages
        .iter()
        .filter(|lang| is_missing(field.get(lang.as_str()), options.empty_is_missing))
        .cloned()
        .collect()
}

/// Contract of the Unit Extractor for a single record: the (field, language)
/// pairs whose value is absent, null, or (optionally) empty.
pub fn missing_slots(record: &Map<String, Value>, options: &ExtractOptions) -> Vec<(String, String)> {
    record
        .iter()
        .filter(|(_, value)| is_translatable_field(value))
        .filter_map(|(name, value)| value.as_object().map(|map| (name, map)))
        .flat_map(|(name, map)| {
            missing_languages(map, options)
                .into_iter()
                .map(move |lang| (name.clone(), lang))
        })
        .collect()
}

/// Pick the source text for a field: priority languages first, then the first
/// non-empty language value in document order.
pub fn select_source(field: &Map<String, Value>, priority: &[String]) -> Option<(String, String)> {
    let usable = |lang: &str| -> Option<String> {
        match field.get(lang) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            _ => None,
        }
    };

    priority
        .iter()
        .find_map(|lang| usable(lang).map(|text| (lang.clone(), text)))
        .or_else(|| {
            field
                .keys()
                .filter(|k| is_language_code(k))
                .find_map(|lang| usable(lang).map(|text| (lang.clone(), text)))
        })
}

/// In-memory copy of one Job File.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDocument {
    records: Vec<Value>,
}

impl JobDocument {
    pub fn new(records: Vec<Value>) -> Self {
        Self { records }
    }

    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self, JobFileError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|source| JobFileError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        match value {
            Value::Array(records) => Ok(Self { records }),
            _ => Err(JobFileError::NotAnArray(path.to_path_buf())),
        }
    }

    pub fn load(path: &Path) -> Result<Self, JobFileError> {
        let bytes = std::fs::read(path).map_err(|source| JobFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes, path)
    }

    /// Pretty JSON, two-space indent, non-ASCII left as-is.
    pub fn to_pretty_json(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec_pretty(&self.records).unwrap_or_default();
        out.push(b'\n');
        out
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stable identifier for logs: the id member rendered as text, else the index.
    pub fn record_id(&self, index: usize, id_key: &str) -> String {
        match self.records.get(index).and_then(|r| r.get(id_key)) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => format!("#{}", index),
            Some(other) => other.to_string(),
        }
    }

    /// Run the Unit Extractor over every record.
    pub fn extract(&self, file: FileId, options: &ExtractOptions) -> Extraction {
        let mut extraction = Extraction::default();

        for (index, record) in self.records.iter().enumerate() {
            let Some(record_map) = record.as_object() else {
                continue;
            };
            let record_id = self.record_id(index, &options.record_id_key);

            for (field_name, value) in record_map {
                if !is_translatable_field(value) {
                    continue;
                }
                let Some(field) = value.as_object() else {
                    continue;
                };
                let missing = missing_languages(field, options);
                if missing.is_empty() {
                    continue;
                }
                let Some((source_language, source_text)) =
                    select_source(field, &options.source_priority)
                else {
                    extraction.untranslatable.push(UntranslatableField {
                        record_id: record_id.clone(),
                        field: field_name.clone(),
                    });
                    continue;
                };

                for target_language in missing {
                    extraction.units.push(TranslationUnit {
                        file,
                        record_index: index,
                        record_id: record_id.clone(),
                        field: field_name.clone(),
                        source_language: source_language.clone(),
                        source_text: source_text.clone(),
                        target_language,
                        state: UnitState::Pending,
                    });
                }
            }
        }

        extraction
    }

    /// Write a translation into its slot. Returns false if the slot no longer exists.
    pub fn set_slot(&mut self, record_index: usize, field: &str, language: &str, text: String) -> bool {
        let slot = self
            .records
            .get_mut(record_index)
            .and_then(Value::as_object_mut)
            .and_then(|record| record.get_mut(field))
            .and_then(Value::as_object_mut);

        match slot {
            Some(map) => {
                map.insert(language.to_string(), Value::String(text));
                true
            }
            None => false,
        }
    }

    /// True when `completed` contains everything in `self`, differing only in
    /// slots that are null or absent here (or empty, with `empty_is_missing`).
    pub fn is_filled_by(&self, completed: &JobDocument, empty_is_missing: bool) -> bool {
        self.records.len() == completed.records.len()
            && self
                .records
                .iter()
                .zip(&completed.records)
                .all(|(pending, done)| fills(pending, Some(done), empty_is_missing))
    }
}

fn fills(pending: &Value, completed: Option<&Value>, empty_is_missing: bool) -> bool {
    match (pending, completed) {
        (Value::Null, _) => true,
        (Value::String(s), _) if empty_is_missing && s.is_empty() => true,
        (_, None) => false,
        (Value::Object(p), Some(Value::Object(c))) => p
            .iter()
            .all(|(key, value)| fills(value, c.get(key), empty_is_missing)),
        (Value::Array(p), Some(Value::Array(c))) => {
            p.len() == c.len()
                && p.iter()
                    .zip(c)
                    .all(|(a, b)| fills(a, Some(b), empty_is_missing))
        }
        (p, Some(c)) => p == c,
    }
}
