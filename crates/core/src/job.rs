//! Import job description: the source file, the target collection,
//! parsing options, and field mappings.
//!
//! An [`ImportJob`] is created when the operator selects a file and is
//! frozen once submission begins. All validation here is pure; no file
//! or network access happens in this module.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::JobId;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Batch size used when neither the operator nor the adviser picked one.
pub const DEFAULT_BATCH_SIZE: u32 = 500;

/// Upper bound accepted for an explicit batch size.
pub const MAX_BATCH_SIZE: u32 = 100_000;

/// Default text encoding label.
pub const DEFAULT_ENCODING: &str = "utf-8";

/// Default depth to which nested JSON objects are flattened into keys.
pub const DEFAULT_SAMPLE_DEPTH: u8 = 2;

// ---------------------------------------------------------------------------
// Source format
// ---------------------------------------------------------------------------

/// The structural family of the file being imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Delimited rows (tabular).
    Csv,
    /// A JSON array of items, optionally nested under a root path (hierarchical).
    Json,
}

impl SourceFormat {
    /// Path segment used by the ingestion endpoints (`/upload-{segment}/...`).
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    /// Reconnect budget for the progress channel.
    ///
    /// Row-streaming jobs (CSV) get 3 attempts, item-streaming jobs (JSON) 5.
    pub fn default_max_retries(&self) -> u32 {
        match self {
            Self::Csv => 3,
            Self::Json => 5,
        }
    }

    /// Guess the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path_segment())
    }
}

// ---------------------------------------------------------------------------
// Parsing configuration
// ---------------------------------------------------------------------------

/// Options controlling how the file is parsed, both by the local
/// analyzer and by the remote ingestion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ParsingConfig {
    pub format: SourceFormat,
    /// Field delimiter (CSV only).
    pub delimiter: char,
    /// WHATWG encoding label, e.g. `utf-8`, `windows-1252`.
    #[validate(length(min = 1, max = 64))]
    pub encoding: String,
    /// Whether the first CSV record is a header row.
    pub has_header: bool,
    /// Dotted path to the item array inside a JSON document. Empty means
    /// the document root.
    pub root_path: String,
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: u32,
    /// Set once the operator picks a batch size; the adviser never
    /// overrides an explicit choice.
    pub batch_size_explicit: bool,
    /// Skip CSV rows whose fields are all empty.
    pub skip_empty_rows: bool,
    /// How deep nested JSON objects are flattened into dotted keys.
    #[validate(range(min = 1, max = 8))]
    pub sample_depth: u8,
}

impl ParsingConfig {
    /// Defaults for a given format.
    pub fn for_format(format: SourceFormat) -> Self {
        Self {
            format,
            delimiter: ',',
            encoding: DEFAULT_ENCODING.to_string(),
            has_header: true,
            root_path: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_size_explicit: false,
            skip_empty_rows: true,
            sample_depth: DEFAULT_SAMPLE_DEPTH,
        }
    }

    /// Defaults for a file at `path`. Tab-separated files get a tab
    /// delimiter.
    pub fn for_file(format: SourceFormat, path: &Path) -> Self {
        let mut config = Self::for_format(format);
        let tsv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tsv"));
        if format == SourceFormat::Csv && tsv {
            config.delimiter = '\t';
        }
        config
    }

    /// Record an operator-chosen batch size.
    pub fn with_explicit_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self.batch_size_explicit = true;
        self
    }

    /// Check every field that must hold before the configuration is sent
    /// to the ingestion service.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()?;

        match self.format {
            SourceFormat::Csv => validate_delimiter(self.delimiter),
            SourceFormat::Json => validate_root_path(&self.root_path),
        }
    }
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self::for_format(SourceFormat::Csv)
    }
}

/// A delimiter must be a single printable ASCII, non-alphanumeric
/// character, or a tab.
pub fn validate_delimiter(delimiter: char) -> Result<(), CoreError> {
    let ok = delimiter == '\t'
        || (delimiter.is_ascii_graphic() && !delimiter.is_ascii_alphanumeric() && delimiter != '"');
    if ok {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "Invalid delimiter {delimiter:?}: must be a printable ASCII symbol or tab"
        )))
    }
}

/// Validate a dotted JSON root path such as `data.items`.
///
/// The empty string (document root) is valid. Empty segments (`a..b`,
/// leading or trailing dots) and whitespace inside segments are not.
pub fn validate_root_path(path: &str) -> Result<(), CoreError> {
    if path.is_empty() {
        return Ok(());
    }
    for segment in path.split('.') {
        if segment.is_empty() || segment.chars().any(char::is_whitespace) {
            return Err(CoreError::Validation(format!(
                "Invalid JSON root path '{path}': segments must be non-empty and contain no whitespace"
            )));
        }
    }
    Ok(())
}

/// Split a validated root path into its segments.
pub fn root_path_segments(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

// ---------------------------------------------------------------------------
// Import job
// ---------------------------------------------------------------------------

/// A file handle as seen by the orchestrator: where it lives and how big
/// it is. The contents are never held here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Self {
            path,
            file_name,
            size_bytes,
        }
    }
}

/// Source field identifier (CSV header or flattened JSON key) to target
/// field name.
pub type FieldMappings = IndexMap<String, String>;

/// One end-to-end attempt to import a single file into one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: JobId,
    pub source: SourceFile,
    pub target_collection: Option<String>,
    pub parsing: ParsingConfig,
    #[serde(default)]
    pub field_mappings: FieldMappings,
}

impl ImportJob {
    pub fn new(id: JobId, source: SourceFile, parsing: ParsingConfig) -> Self {
        Self {
            id,
            source,
            target_collection: None,
            parsing,
            field_mappings: FieldMappings::new(),
        }
    }

    /// Validate everything that must be true before submission. Failing
    /// here is a configuration error: no network call is made.
    pub fn check_submittable(&self) -> Result<&str, CoreError> {
        let target = self
            .target_collection
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CoreError::Validation("No target collection selected".to_string()))?;

        self.parsing.check()?;

        for (source, target_field) in &self.field_mappings {
            if target_field.trim().is_empty() {
                return Err(CoreError::Validation(format!(
                    "Field mapping for '{source}' has an empty target name"
                )));
            }
        }

        Ok(target)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
