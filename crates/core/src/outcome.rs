//! Terminal import outcome, synthesized from the final progress event.

use serde::{Deserialize, Serialize};

/// At most this many failed records are kept for display.
pub const FAILED_SAMPLE_LIMIT: usize = 20;

/// One record the ingestion service could not insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSample {
    /// Row or item index in the source file, when the service reports it.
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub error: String,
    /// The offending record as reported by the service.
    #[serde(default)]
    pub record: serde_json::Value,
}

/// Final counts of a finished import. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub success_count: u64,
    pub failed_count: u64,
    pub total_count: u64,
    pub processing_time_ms: u64,
    pub failed_samples: Vec<FailedSample>,
}

impl ImportOutcome {
    /// Build an outcome, deriving the total and bounding the samples.
    pub fn new(
        success_count: u64,
        failed_count: u64,
        processing_time_ms: u64,
        mut failed_samples: Vec<FailedSample>,
    ) -> Self {
        failed_samples.truncate(FAILED_SAMPLE_LIMIT);
        Self {
            success_count,
            failed_count,
            total_count: success_count + failed_count,
            processing_time_ms,
            failed_samples,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_sum_of_success_and_failed() {
        let outcome = ImportOutcome::new(900, 10, 1234, Vec::new());
        assert_eq!(outcome.total_count, 910);
        assert!(outcome.has_failures());
    }

    #[test]
    fn failed_samples_are_bounded() {
        let samples = (0..50)
            .map(|i| FailedSample {
                index: Some(i),
                error: "duplicate key".into(),
                record: serde_json::Value::Null,
            })
            .collect();
        let outcome = ImportOutcome::new(0, 50, 0, samples);
        assert_eq!(outcome.failed_samples.len(), FAILED_SAMPLE_LIMIT);
    }
}
