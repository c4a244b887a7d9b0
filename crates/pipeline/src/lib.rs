//! Import orchestration.
//!
//! The [`Orchestrator`] wires operator intents (select a file, preview,
//! submit, cancel, retry, reset) to the sampling analyzer, the
//! [`UploadController`](upload::UploadController) and the progress channel
//! manager, and applies everything they report to the job store.

pub mod error;
pub mod orchestrator;
pub mod upload;

pub use error::PipelineError;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use upload::{RejectionKind, SubmitOutcome, SubmitPolicy, UploadController};
