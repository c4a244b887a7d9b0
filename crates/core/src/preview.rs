//! Preview report types and per-field statistics.
//!
//! The sampling analyzer feeds every observed value into a
//! [`FieldAccumulator`]; once parsing stops the accumulators are turned
//! into [`ColumnStats`] and classified. When only a prefix of the file was
//! read, [`PreviewReport::extrapolate`] scales counts up to the full size.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Distinct values tracked per field before the set stops growing.
pub const UNIQUE_VALUE_CAP: usize = 100;

/// Share of numeric values required for a field to be classified `number`.
pub const NUMERIC_RATIO_THRESHOLD: f64 = 0.9;

/// A field whose unique/value ratio is below this is a `category`.
pub const CATEGORY_UNIQUE_RATIO: f64 = 0.1;

/// Rows kept verbatim in the preview table.
pub const SAMPLE_ROW_LIMIT: usize = 10;

/// Maximum characters returned in an opaque (unparsed) preview.
pub const RAW_PREVIEW_CHARS: usize = 2_000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The inferred type of a column or key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferredType {
    Empty,
    Number,
    Category,
    Text,
}

impl InferredType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Number => "number",
            Self::Category => "category",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for InferredType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics for one column (CSV) or flattened key (JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub inferred_type: InferredType,
    /// Empty values; extrapolated when the report is sampled.
    pub empty_count: u64,
    /// Non-empty values actually observed.
    pub value_count: u64,
    /// Distinct non-empty values seen, at most [`UNIQUE_VALUE_CAP`].
    pub unique_count_capped: usize,
    /// Share of observed non-empty values that parse as numbers.
    pub numeric_ratio: f64,
    pub min_len: usize,
    pub max_len: usize,
}

/// How the report was produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingInfo {
    pub is_sampled: bool,
    /// Bytes of complete records the statistics were computed from.
    pub sample_size: u64,
    /// Records actually parsed.
    pub sampled_records: u64,
    pub note: Option<String>,
}

/// Result of analyzing a candidate file.
///
/// Produced once per analysis request and read-only afterwards; a change
/// of file or parsing configuration invalidates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewReport {
    /// Data rows (CSV) or items (JSON); an estimate when sampled.
    pub total_records: u64,
    pub columns: Vec<ColumnStats>,
    pub sampling: SamplingInfo,
    pub sample_rows: Vec<Vec<String>>,
    pub file_size: u64,
    /// Bytes read from disk to produce this report.
    pub bytes_read: u64,
    /// Unparsed text returned when no complete structure could be found.
    pub raw_preview: Option<String>,
    pub warning: Option<String>,
}

impl PreviewReport {
    /// Build an opaque preview from raw text when the structure could not
    /// be parsed. Never fails.
    pub fn opaque(raw: &str, file_size: u64, bytes_read: u64, warning: impl Into<String>) -> Self {
        Self {
            raw_preview: Some(raw.chars().take(RAW_PREVIEW_CHARS).collect()),
            warning: Some(warning.into()),
            file_size,
            bytes_read,
            ..Default::default()
        }
    }

    /// Whether the preview carries parsed structure (as opposed to an
    /// opaque text fallback).
    pub fn is_structured(&self) -> bool {
        self.raw_preview.is_none()
    }

    /// Scale the counts computed over `sample_size` bytes to the full file
    /// size and mark the report as sampled.
    ///
    /// Empty counts and the record total are multiplied by
    /// `file_size / sample_size` and rounded to the nearest integer.
    pub fn extrapolate(&mut self, file_size: u64, sample_size: u64) {
        let factor = scale_factor(file_size, sample_size);

        self.sampling.is_sampled = true;
        self.sampling.sample_size = sample_size;
        self.sampling.sampled_records = self.total_records;
        self.total_records = scale_count(self.total_records, factor);
        for column in &mut self.columns {
            column.empty_count = scale_count(column.empty_count, factor);
        }
        self.sampling.note = Some(format!(
            "Analyzed the first {} of {}; record and empty-value counts are estimates (x{factor:.1})",
            format_bytes(sample_size),
            format_bytes(file_size),
        ));
    }
}

// ---------------------------------------------------------------------------
// Accumulation
// ---------------------------------------------------------------------------

/// Running statistics for a single field.
#[derive(Debug, Clone)]
pub struct FieldAccumulator {
    name: String,
    empty: u64,
    values: u64,
    numeric: u64,
    uniques: HashSet<String>,
    min_len: Option<usize>,
    max_len: usize,
}

impl FieldAccumulator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            empty: 0,
            values: 0,
            numeric: 0,
            uniques: HashSet::new(),
            min_len: None,
            max_len: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one value. `None` (missing) and blank strings count as empty.
    pub fn observe(&mut self, value: Option<&str>) {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            self.empty += 1;
            return;
        };

        self.values += 1;
        if is_numeric(value) {
            self.numeric += 1;
        }
        if self.uniques.len() < UNIQUE_VALUE_CAP {
            self.uniques.insert(value.to_string());
        }

        let len = value.chars().count();
        self.min_len = Some(self.min_len.map_or(len, |m| m.min(len)));
        self.max_len = self.max_len.max(len);
    }

    /// Record `count` records in which the field was absent entirely.
    pub fn observe_missing(&mut self, count: u64) {
        self.empty += count;
    }

    pub fn finish(self) -> ColumnStats {
        let unique = self.uniques.len();
        let numeric_ratio = if self.values == 0 {
            0.0
        } else {
            self.numeric as f64 / self.values as f64
        };

        ColumnStats {
            inferred_type: classify(self.values, self.numeric, unique),
            name: self.name,
            empty_count: self.empty,
            value_count: self.values,
            unique_count_capped: unique,
            numeric_ratio,
            min_len: self.min_len.unwrap_or(0),
            max_len: self.max_len,
        }
    }
}

/// Classify a field from its observed counts.
///
/// Precedence: no values -> `empty`; at least 90% numeric -> `number`;
/// unique/value ratio under 10% with more than one distinct value ->
/// `category`; otherwise `text`.
pub fn classify(values: u64, numeric: u64, unique: usize) -> InferredType {
    if values == 0 {
        return InferredType::Empty;
    }
    let values_f = values as f64;
    if numeric as f64 / values_f >= NUMERIC_RATIO_THRESHOLD {
        InferredType::Number
    } else if unique > 1 && (unique as f64 / values_f) < CATEGORY_UNIQUE_RATIO {
        InferredType::Category
    } else {
        InferredType::Text
    }
}

/// Whether a trimmed value reads as a finite number.
pub fn is_numeric(value: &str) -> bool {
    value.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Scaling helpers
// ---------------------------------------------------------------------------

/// `full / sample`, or `1.0` when nothing was sampled.
pub fn scale_factor(full: u64, sample: u64) -> f64 {
    if sample == 0 {
        1.0
    } else {
        full as f64 / sample as f64
    }
}

/// Multiply a count by `factor`, rounding to the nearest integer.
pub fn scale_count(count: u64, factor: f64) -> u64 {
    (count as f64 * factor).round() as u64
}

/// Human-readable byte size (`512.0 KB`, `50.0 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
