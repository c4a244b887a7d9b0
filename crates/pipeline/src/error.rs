use bulkload_core::error::CoreError;
use bulkload_core::store::JobPhase;
use bulkload_core::types::JobId;
use bulkload_remote::error::IngestApiError;
use bulkload_sampling::AnalyzerError;

/// Errors returned to the operator by the orchestrator. None of them
/// leave the job state inconsistent; a failed call changes nothing
/// unless the variant says otherwise.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Caught before submission: missing file or target, invalid parsing
    /// options, bad mappings. No network call was made.
    #[error("Configuration error: {0}")]
    Configuration(#[from] CoreError),

    #[error("Cannot {operation} while the job is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: JobPhase,
    },

    /// Another import already owns the upload and progress channel.
    #[error("Import {0} is still running")]
    Busy(JobId),

    /// The upload never reached the service, so there is no server-side
    /// progress to follow. Reset and submit the file again.
    #[error("Import {0} was never accepted by the ingestion service; submit it again")]
    NotAccepted(JobId),

    #[error("File is {size} bytes, above the {limit} byte warning threshold; confirm to upload")]
    OversizeConfirmationRequired { size: u64, limit: u64 },

    /// The preview could not be built. The job stays editable.
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Api(#[from] IngestApiError),
}

impl PipelineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(CoreError::Validation(message.into()))
    }
}
