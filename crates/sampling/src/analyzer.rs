use std::path::Path;

use bulkload_core::job::{ParsingConfig, SourceFormat};
use bulkload_core::preview::PreviewReport;

use crate::decode::decode;
use crate::error::AnalyzerError;
use crate::reader::read_sample;
use crate::{hierarchical, tabular, Unstructured};

/// Files above this size are sampled instead of parsed in full.
pub const DEFAULT_SAMPLE_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

/// Bytes read from the start of a sampled file.
pub const DEFAULT_PREFIX_BYTES: u64 = 512_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub sample_threshold_bytes: u64,
    pub prefix_bytes: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_threshold_bytes: DEFAULT_SAMPLE_THRESHOLD_BYTES,
            prefix_bytes: DEFAULT_PREFIX_BYTES,
        }
    }
}

/// Builds preview reports from files on disk.
#[derive(Debug, Clone, Default)]
pub struct SamplingAnalyzer {
    config: AnalyzerConfig,
}

impl SamplingAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze the file at `path`.
    ///
    /// Only I/O failures are errors. Text that cannot be parsed produces
    /// an opaque preview carrying a warning.
    #[tracing::instrument(skip(self, parsing), fields(path = %path.display(), format = %parsing.format))]
    pub async fn analyze(
        &self,
        path: &Path,
        parsing: &ParsingConfig,
    ) -> Result<PreviewReport, AnalyzerError> {
        let sample = read_sample(
            path,
            self.config.sample_threshold_bytes,
            self.config.prefix_bytes,
        )
        .await?;
        let bytes_read = sample.bytes.len() as u64;
        let decoded = decode(&sample.bytes, &parsing.encoding, sample.truncated);

        let parsed = match parsing.format {
            SourceFormat::Csv => tabular::analyze(&decoded.text, parsing, sample.truncated),
            SourceFormat::Json => hierarchical::analyze(&decoded.text, parsing, sample.truncated),
        };

        let report = match parsed {
            Ok(analysis) => {
                let mut report = analysis.report;
                report.file_size = sample.file_size;
                report.bytes_read = bytes_read;
                report.sampling.sampled_records = report.total_records;
                report.sampling.sample_size = bytes_read;
                if sample.truncated {
                    let sample_size =
                        consumed_bytes(bytes_read, analysis.consumed, decoded.text.len());
                    report.extrapolate(sample.file_size, sample_size);
                }
                report.warning = join_warnings(decoded.warning, report.warning);
                report
            }
            Err(Unstructured(reason)) => {
                tracing::warn!(%reason, "Falling back to opaque preview");
                let warning = join_warnings(decoded.warning, Some(reason)).unwrap_or_default();
                PreviewReport::opaque(&decoded.text, sample.file_size, bytes_read, warning)
            }
        };

        tracing::info!(
            total_records = report.total_records,
            columns = report.columns.len(),
            is_sampled = report.sampling.is_sampled,
            bytes_read,
            "Preview ready",
        );

        Ok(report)
    }
}

/// Map an offset in decoded text back to raw bytes, proportionally.
fn consumed_bytes(raw_len: u64, consumed: usize, text_len: usize) -> u64 {
    if text_len == 0 || consumed >= text_len {
        return raw_len;
    }
    let scaled = (raw_len as f64 * consumed as f64 / text_len as f64).round() as u64;
    scaled.max(1)
}

fn join_warnings(first: Option<String>, second: Option<String>) -> Option<String> {
    match (first, second) {
        (Some(a), Some(b)) => Some(format!("{a}; {b}")),
        (a, b) => a.or(b),
    }
}
