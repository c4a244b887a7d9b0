//! Upload controller.
//!
//! Runs one submission per import as a background task under the job's
//! [`CancellationToken`]. The task reports transfer progress and a single
//! settled [`SubmitOutcome`] over an mpsc channel; like the progress
//! channel it never touches job state.
//!
//! Acceptance is held back until the progress channel has finished its
//! first connection attempt, so the channel is always open before the
//! orchestrator sees the submission settle.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bulkload_core::store::JobEvent;
use bulkload_remote::api::{IngestBackend, SubmitAck, TransferProgress, UploadRequest};
use bulkload_remote::error::IngestApiError;

use crate::error::PipelineError;

const UPLOAD_EVENT_CAPACITY: usize = 32;

/// Files above this size need explicit confirmation (500 MB).
pub const DEFAULT_OVERSIZE_WARN_BYTES: u64 = 500 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitPolicy {
    pub oversize_warn_bytes: u64,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self {
            oversize_warn_bytes: DEFAULT_OVERSIZE_WARN_BYTES,
        }
    }
}

impl SubmitPolicy {
    pub fn check_size(&self, size: u64, confirmed: bool) -> Result<(), PipelineError> {
        if size > self.oversize_warn_bytes && !confirmed {
            return Err(PipelineError::OversizeConfirmationRequired {
                size,
                limit: self.oversize_warn_bytes,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// 4xx: the request is wrong.
    Client,
    /// 5xx or anything else.
    Server,
}

impl RejectionKind {
    pub fn from_status(status: u16) -> Self {
        if (400..500).contains(&status) {
            Self::Client
        } else {
            Self::Server
        }
    }
}

/// How a submission settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The service queued the work. Ingestion continues remotely.
    Accepted { status: u16 },
    /// The service could not be reached. Not fatal.
    Offline(String),
    Rejected {
        kind: RejectionKind,
        status: u16,
        message: String,
    },
    /// The request never reached the service (unreadable file, bad URL).
    Failed(String),
    Cancelled,
}

impl SubmitOutcome {
    pub fn from_result(result: Result<SubmitAck, IngestApiError>) -> Self {
        match result {
            Ok(ack) => Self::Accepted { status: ack.status },
            Err(e) if e.is_transient() => Self::Offline(e.to_string()),
            Err(IngestApiError::Rejected { status, message }) => Self::Rejected {
                kind: RejectionKind::from_status(status),
                status,
                message,
            },
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    /// The store event this outcome stands for. `Cancelled` has none:
    /// the orchestrator records cancellation itself.
    pub fn job_event(&self) -> Option<JobEvent> {
        match self {
            Self::Accepted { .. } => Some(JobEvent::ServerAccepted),
            Self::Offline(message) => Some(JobEvent::NetworkOffline(message.clone())),
            Self::Rejected {
                kind,
                status,
                message,
            } => {
                let side = match kind {
                    RejectionKind::Client => "rejected the upload",
                    RejectionKind::Server => "failed",
                };
                Some(JobEvent::SubmitRejected(format!(
                    "Ingestion service {side} (HTTP {status}): {message}"
                )))
            }
            Self::Failed(message) => Some(JobEvent::SubmitRejected(message.clone())),
            Self::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// Transfer percentage, 0-100 and non-decreasing.
    Transfer(u8),
    /// The last event of every upload.
    Settled(SubmitOutcome),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct UploadController {
    backend: Arc<dyn IngestBackend>,
}

impl UploadController {
    pub fn new(backend: Arc<dyn IngestBackend>) -> Self {
        Self { backend }
    }

    /// Spawn the submission task.
    ///
    /// `channel_ready` resolves once the progress channel has made its
    /// first connection attempt; acceptance is reported only after it.
    pub fn start(
        &self,
        request: UploadRequest,
        cancel: CancellationToken,
        channel_ready: Option<oneshot::Receiver<()>>,
    ) -> (UploadHandle, mpsc::Receiver<UploadEvent>) {
        let (events_tx, events_rx) = mpsc::channel(UPLOAD_EVENT_CAPACITY);
        let backend = Arc::clone(&self.backend);
        let task = tokio::spawn(run(backend, request, cancel, channel_ready, events_tx));
        (UploadHandle { task }, events_rx)
    }
}

/// Owned handle to a running upload. Dropping it aborts the request.
#[derive(Debug)]
pub struct UploadHandle {
    task: JoinHandle<()>,
}

impl UploadHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit.
    pub async fn closed(&mut self) {
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Upload task panicked");
            }
        }
    }
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    backend: Arc<dyn IngestBackend>,
    request: UploadRequest,
    cancel: CancellationToken,
    channel_ready: Option<oneshot::Receiver<()>>,
    events: mpsc::Sender<UploadEvent>,
) {
    let collection = request.collection.as_str();
    let (progress, mut percent) = TransferProgress::channel();
    let mut submit = backend.submit(&request, progress);
    let mut watching = true;

    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(%collection, "Upload cancelled");
                let _ = events.send(UploadEvent::Settled(SubmitOutcome::Cancelled)).await;
                return;
            }
            result = &mut submit => break result,
            changed = percent.changed(), if watching => match changed {
                Ok(()) => {
                    let value = *percent.borrow_and_update();
                    let _ = events.send(UploadEvent::Transfer(value)).await;
                }
                Err(_) => watching = false,
            },
        }
    };
    drop(submit);

    let outcome = SubmitOutcome::from_result(result);

    if matches!(outcome, SubmitOutcome::Accepted { .. }) {
        if let Some(ready) = channel_ready {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = events.send(UploadEvent::Settled(SubmitOutcome::Cancelled)).await;
                    return;
                }
                _ = ready => {}
            }
        }
    }

    match &outcome {
        SubmitOutcome::Accepted { status } => {
            tracing::info!(%collection, status, "Upload accepted, awaiting ingestion");
        }
        SubmitOutcome::Offline(reason) => {
            tracing::warn!(%collection, %reason, "Ingestion service offline");
        }
        SubmitOutcome::Rejected { status, message, .. } => {
            tracing::error!(%collection, status, %message, "Upload rejected");
        }
        SubmitOutcome::Failed(message) => {
            tracing::error!(%collection, %message, "Upload failed");
        }
        SubmitOutcome::Cancelled => {}
    }

    if events.send(UploadEvent::Settled(outcome)).await.is_err() {
        tracing::debug!("Upload event receiver dropped");
    }
}
