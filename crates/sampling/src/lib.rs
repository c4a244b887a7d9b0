//! Sampling analyzer: builds a [`PreviewReport`](bulkload_core::preview::PreviewReport)
//! for a candidate file without reading more than a bounded prefix of it.
//!
//! Small files are parsed in full. Files above the sampling threshold are
//! read up to a fixed prefix, parsed as far as complete records go, and
//! the resulting counts are extrapolated to the full file size.

pub mod analyzer;
pub mod decode;
pub mod error;
pub mod hierarchical;
pub mod reader;
pub mod tabular;

pub use analyzer::{AnalyzerConfig, SamplingAnalyzer};
pub use error::AnalyzerError;

/// Statistics computed over the parsed part of a text, before any
/// extrapolation.
#[derive(Debug)]
pub struct Analysis {
    pub report: bulkload_core::preview::PreviewReport,
    /// Bytes of the decoded text that formed complete records.
    pub consumed: usize,
}

/// The text contained no complete top-level structure. Carries the
/// warning shown to the operator alongside the opaque preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unstructured(pub String);
