//! Import orchestrator.
//!
//! Turns operator intents into store events and owns every live resource
//! of the current import: the cancellation token, the upload task and the
//! progress channel task. Background tasks only report what happened;
//! [`Orchestrator::next_event`] feeds their reports through the store, so
//! the [`JobStore`] is mutated in exactly one place.
//!
//! Only one import is active at a time. Its resources live in a single
//! [`ActiveImport`] that is released as a unit on every terminal
//! transition, on cancellation and on reset.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bulkload_core::batch::apply_advice;
use bulkload_core::collection::Collection;
use bulkload_core::job::{FieldMappings, ImportJob, ParsingConfig, SourceFile, SourceFormat};
use bulkload_core::preview::PreviewReport;
use bulkload_core::store::{JobEvent, JobPhase, JobState, JobStore};
use bulkload_core::types::{new_job_id, JobId};
use bulkload_events::{Notice, Notifier};
use bulkload_remote::api::{IngestBackend, UploadRequest};
use bulkload_remote::channel::{ChannelEvent, ChannelHandle, ProgressChannelManager};
use bulkload_remote::reconnect::ChannelPolicy;
use bulkload_remote::transport::{ChannelTarget, ProgressTransport};
use bulkload_sampling::{AnalyzerConfig, SamplingAnalyzer};

use crate::error::PipelineError;
use crate::upload::{SubmitPolicy, UploadController, UploadEvent, UploadHandle};

/// Tunables for every component the orchestrator drives.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub analyzer: AnalyzerConfig,
    pub channel: ChannelPolicy,
    pub submit: SubmitPolicy,
}

/// Live resources of the import currently in flight.
struct ActiveImport {
    job_id: JobId,
    cancel: CancellationToken,
    channel: ChannelHandle,
    channel_events: Option<mpsc::Receiver<ChannelEvent>>,
    upload: Option<UploadHandle>,
    upload_events: Option<mpsc::Receiver<UploadEvent>>,
}

impl ActiveImport {
    /// Cancel the shared token and wait for both tasks to exit.
    async fn release(mut self) {
        self.channel_events = None;
        self.upload_events = None;
        self.cancel.cancel();
        self.channel.closed().await;
        if let Some(upload) = self.upload.as_mut() {
            upload.closed().await;
        }
        tracing::debug!(job_id = %self.job_id, "Import resources released");
    }
}

enum Input {
    Channel(ChannelEvent),
    Upload(UploadEvent),
}

pub struct Orchestrator {
    store: JobStore,
    backend: Arc<dyn IngestBackend>,
    uploads: UploadController,
    channels: ProgressChannelManager,
    analyzer: SamplingAnalyzer,
    notifier: Arc<dyn Notifier>,
    submit_policy: SubmitPolicy,
    active: Option<ActiveImport>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn IngestBackend>,
        transport: Arc<dyn ProgressTransport>,
        notifier: Arc<dyn Notifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store: JobStore::new(),
            uploads: UploadController::new(Arc::clone(&backend)),
            backend,
            channels: ProgressChannelManager::new(transport, config.channel),
            analyzer: SamplingAnalyzer::new(config.analyzer),
            notifier,
            submit_policy: config.submit,
            active: None,
        }
    }

    pub fn state(&self) -> &JobState {
        self.store.state()
    }

    pub fn phase(&self) -> JobPhase {
        self.store.phase()
    }

    /// Whether an upload or progress channel is still owned by this
    /// orchestrator.
    pub fn has_active_import(&self) -> bool {
        self.active.is_some()
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Reload the target collections. Allowed in every phase.
    pub async fn refresh_collections(&mut self) -> Result<&[Collection], PipelineError> {
        match self.backend.list_collections().await {
            Ok(collections) => {
                tracing::info!(count = collections.len(), "Collections refreshed");
                self.dispatch(JobEvent::CollectionsLoaded(collections));
                Ok(&self.state().collections)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load collections");
                self.notifier
                    .notify(Notice::warning(format!("Could not load collections: {e}")));
                Err(e.into())
            }
        }
    }

    /// Start a new job for the file at `path`. The format is taken from
    /// the extension unless given. The batch size is advised from the
    /// file size.
    pub async fn select_file(
        &mut self,
        path: impl AsRef<Path>,
        format: Option<SourceFormat>,
    ) -> Result<JobId, PipelineError> {
        let path = path.as_ref();
        self.ensure_phase(
            "select a file",
            &[JobPhase::Idle, JobPhase::Configuring, JobPhase::Previewed],
        )?;

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| PipelineError::config(format!("Cannot read {}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(PipelineError::config(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let format = format
            .or_else(|| SourceFormat::from_path(path))
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "Cannot tell the format of {}; choose csv or json",
                    path.display()
                ))
            })?;

        let size = metadata.len();
        let mut parsing = ParsingConfig::for_file(format, path);
        apply_advice(&mut parsing, size);

        let job = ImportJob::new(new_job_id(), SourceFile::new(path, size), parsing);
        let job_id = job.id;
        tracing::info!(
            %job_id,
            file = %job.source.file_name,
            size,
            %format,
            batch_size = job.parsing.batch_size,
            "File selected",
        );
        self.dispatch(JobEvent::FileSelected(job));
        Ok(job_id)
    }

    /// Replace the parsing options. The batch size is re-advised unless
    /// the operator set one explicitly. Clears the preview.
    pub fn set_parsing(&mut self, mut parsing: ParsingConfig) -> Result<(), PipelineError> {
        let size = self.editable_job("change parsing options")?.source.size_bytes;
        apply_advice(&mut parsing, size);
        self.dispatch(JobEvent::ParsingChanged(parsing));
        Ok(())
    }

    /// Record an operator-chosen batch size; the adviser will not touch it
    /// again.
    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), PipelineError> {
        let parsing = self
            .editable_job("change the batch size")?
            .parsing
            .clone()
            .with_explicit_batch_size(batch_size);
        self.set_parsing(parsing)
    }

    pub fn select_target(&mut self, collection: impl Into<String>) -> Result<(), PipelineError> {
        let collection = collection.into();
        self.editable_job("select a target")?;

        let known = &self.state().collections;
        if !known.is_empty() && !known.iter().any(|c| c.collection_name == collection) {
            return Err(PipelineError::config(format!(
                "Unknown collection '{collection}'"
            )));
        }

        self.dispatch(JobEvent::TargetSelected(collection));
        Ok(())
    }

    pub fn set_mappings(&mut self, mappings: FieldMappings) -> Result<(), PipelineError> {
        self.editable_job("change field mappings")?;
        self.dispatch(JobEvent::MappingsChanged(mappings));
        Ok(())
    }

    /// Analyze the selected file with the current parsing options.
    ///
    /// Analysis problems are not fatal: an unparseable file yields an
    /// opaque preview with a warning, and an I/O failure returns the job
    /// to `configuring` with the warning recorded.
    pub async fn preview(&mut self) -> Result<PreviewReport, PipelineError> {
        let job = self.editable_job("preview")?.clone();
        self.dispatch(JobEvent::AnalysisStarted);

        match self.analyzer.analyze(&job.source.path, &job.parsing).await {
            Ok(report) => {
                if let Some(warning) = &report.warning {
                    self.notifier
                        .notify(Notice::warning(warning.clone()).for_job(job.id));
                }
                self.dispatch(JobEvent::AnalysisCompleted(report.clone()));
                Ok(report)
            }
            Err(e) => {
                let warning = format!("Preview unavailable: {e}");
                self.notifier
                    .notify(Notice::warning(warning.clone()).for_job(job.id));
                self.dispatch(JobEvent::AnalysisFailed(warning));
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Import lifecycle
    // -----------------------------------------------------------------------

    /// Submit the current job.
    ///
    /// Every check runs before anything changes: a rejected call leaves
    /// the state untouched and makes no network call. The progress
    /// channel is opened before the upload starts.
    pub async fn submit(&mut self, confirm_oversize: bool) -> Result<JobId, PipelineError> {
        if let Some(active) = &self.active {
            return Err(PipelineError::Busy(active.job_id));
        }
        if self.phase().is_active() {
            return Err(PipelineError::InvalidPhase {
                operation: "submit",
                phase: self.phase(),
            });
        }

        let job = self
            .state()
            .job
            .as_ref()
            .ok_or_else(|| PipelineError::config("No file selected"))?;
        self.ensure_phase("submit", &[JobPhase::Configuring, JobPhase::Previewed])?;

        let request = UploadRequest::from_job(job)?;
        self.submit_policy
            .check_size(request.source.size_bytes, confirm_oversize)?;
        let job_id = job.id;

        if !self.dispatch(JobEvent::SubmitStarted) {
            return Err(PipelineError::InvalidPhase {
                operation: "submit",
                phase: self.phase(),
            });
        }

        tracing::info!(
            %job_id,
            collection = %request.collection,
            bytes = request.source.size_bytes,
            batch_size = request.parsing.batch_size,
            "Submitting import",
        );
        self.notifier.notify(
            Notice::info(format!(
                "Uploading {} to {}",
                request.source.file_name, request.collection
            ))
            .for_job(job_id),
        );

        let cancel = CancellationToken::new();
        let target = ChannelTarget {
            format: request.format(),
            collection: request.collection.clone(),
        };
        let (mut channel, channel_events) = self.channels.open(target, cancel.clone());
        let ready = channel.take_ready();
        let (upload, upload_events) = self.uploads.start(request, cancel.clone(), ready);

        self.active = Some(ActiveImport {
            job_id,
            cancel,
            channel,
            channel_events: Some(channel_events),
            upload: Some(upload),
            upload_events: Some(upload_events),
        });

        Ok(job_id)
    }

    /// Abort the in-flight upload and close the progress channel. Both
    /// tasks have exited when this returns.
    pub async fn cancel(&mut self) -> Result<(), PipelineError> {
        if !self.phase().is_active() {
            return Err(PipelineError::InvalidPhase {
                operation: "cancel",
                phase: self.phase(),
            });
        }

        if let Some(active) = self.active.take() {
            tracing::info!(job_id = %active.job_id, "Cancelling import");
            active.release().await;
        }
        self.dispatch(JobEvent::Cancelled);
        self.notify_terminal();
        Ok(())
    }

    /// Reopen the progress channel after exhaustion or timeout. The file
    /// is not uploaded again, so this is refused when the service never
    /// accepted it.
    pub fn retry_progress(&mut self) -> Result<(), PipelineError> {
        let state = self.state();
        if state.phase == JobPhase::CompletedWithError && !state.upload.accepted {
            if let Some(job) = &state.job {
                return Err(PipelineError::NotAccepted(job.id));
            }
        }
        if !state.can_retry_progress() {
            return Err(PipelineError::InvalidPhase {
                operation: "retry progress",
                phase: self.phase(),
            });
        }
        let Some(job) = self.state().job.clone() else {
            return Err(PipelineError::config("No file selected"));
        };
        let request = UploadRequest::from_job(&job)?;
        let job_id = job.id;

        // Leftovers of the previous attempt are already closed.
        self.active = None;
        self.dispatch(JobEvent::RetryRequested);

        let cancel = CancellationToken::new();
        let target = ChannelTarget {
            format: request.format(),
            collection: request.collection.clone(),
        };
        let (channel, channel_events) = self.channels.open(target, cancel.clone());
        self.active = Some(ActiveImport {
            job_id,
            cancel,
            channel,
            channel_events: Some(channel_events),
            upload: None,
            upload_events: None,
        });

        tracing::info!(%job_id, "Retrying progress channel");
        self.notifier
            .notify(Notice::info("Reconnecting to the progress stream").for_job(job_id));
        Ok(())
    }

    /// Discard the job and return to idle, keeping the collection list.
    pub async fn reset(&mut self) -> Result<(), PipelineError> {
        match self.phase() {
            JobPhase::Idle => return Ok(()),
            phase if phase.is_active() || phase == JobPhase::Analyzing => {
                return Err(PipelineError::InvalidPhase {
                    operation: "reset",
                    phase,
                });
            }
            _ => {}
        }
        if let Some(active) = self.active.take() {
            active.release().await;
        }
        self.dispatch(JobEvent::Reset);
        tracing::info!("Job reset");
        Ok(())
    }

    /// Wait for the next report from the active import and apply it.
    ///
    /// Returns the applied event, or `None` once nothing is active. On a
    /// terminal transition the import's resources are released before
    /// this returns.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        loop {
            let input = {
                let active = self.active.as_mut()?;
                tokio::select! {
                    biased;
                    Some(event) = recv(&mut active.channel_events) => Some(Input::Channel(event)),
                    Some(event) = recv(&mut active.upload_events) => Some(Input::Upload(event)),
                    else => None,
                }
            };
            let Some(input) = input else {
                if let Some(active) = self.active.take() {
                    active.release().await;
                }
                return None;
            };

            let Some(event) = self.translate(input) else {
                continue;
            };
            if !self.dispatch(event.clone()) {
                continue;
            }

            if self.phase().is_terminal() {
                if let Some(active) = self.active.take() {
                    active.release().await;
                }
                self.notify_terminal();
            }
            return Some(event);
        }
    }

    /// Drive the active import until it reaches a terminal phase.
    pub async fn run_to_completion(&mut self) -> JobPhase {
        while self.next_event().await.is_some() {}
        self.phase()
    }

    // ---- private helpers ----

    fn dispatch(&mut self, event: JobEvent) -> bool {
        let from = self.phase();
        let applied = self.store.dispatch(&event);
        if applied {
            tracing::debug!(event = event.name(), %from, to = %self.phase(), "Job event applied");
        } else {
            tracing::debug!(event = event.name(), phase = %from, "Job event ignored");
        }
        applied
    }

    fn translate(&self, input: Input) -> Option<JobEvent> {
        let job_id = self.active.as_ref().map(|a| a.job_id);
        match input {
            Input::Channel(event) => {
                if let ChannelEvent::ReconnectScheduled { delay, reason, .. } = &event {
                    let mut notice = Notice::warning(format!(
                        "Progress stream interrupted ({reason}); reconnecting in {:.1}s",
                        delay.as_secs_f64()
                    ));
                    notice.job_id = job_id;
                    self.notifier.notify(notice);
                }
                Some(event.into())
            }
            Input::Upload(UploadEvent::Transfer(percent)) => Some(JobEvent::TransferProgress(percent)),
            Input::Upload(UploadEvent::Settled(outcome)) => {
                let event = outcome.job_event()?;
                if let JobEvent::NetworkOffline(reason) = &event {
                    let mut notice = Notice::warning(format!(
                        "Ingestion service unreachable ({reason}); waiting for the progress stream"
                    ));
                    notice.job_id = job_id;
                    self.notifier.notify(notice);
                }
                Some(event)
            }
        }
    }

    /// Tell the operator how the import ended.
    fn notify_terminal(&self) {
        let state = self.state();
        let message = state.message.clone().unwrap_or_default();
        let notice = match state.phase {
            JobPhase::Succeeded | JobPhase::PartiallyFailed => {
                let Some(outcome) = &state.outcome else {
                    return;
                };
                if outcome.has_failures() {
                    Notice::warning(format!(
                        "Imported {} of {} records; {} failed",
                        outcome.success_count, outcome.total_count, outcome.failed_count
                    ))
                } else {
                    Notice::success(format!(
                        "Imported {} records in {} ms",
                        outcome.success_count, outcome.processing_time_ms
                    ))
                }
            }
            JobPhase::Failed => Notice::error(message),
            JobPhase::CompletedWithError if state.can_retry_progress() => {
                Notice::warning(format!("{message}. Retry to reconnect to the progress stream."))
            }
            JobPhase::CompletedWithError => Notice::error(format!(
                "{message}. The file never reached the ingestion service; reset and submit it again."
            )),
            JobPhase::Cancelled => Notice::info(message),
            _ => return,
        };
        let notice = match state.job.as_ref() {
            Some(job) => notice.for_job(job.id),
            None => notice,
        };
        self.notifier.notify(notice);
    }

    fn ensure_phase(&self, operation: &'static str, allowed: &[JobPhase]) -> Result<(), PipelineError> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(PipelineError::InvalidPhase { operation, phase })
        }
    }

    fn editable_job(&self, operation: &'static str) -> Result<&ImportJob, PipelineError> {
        self.ensure_phase(operation, &[JobPhase::Configuring, JobPhase::Previewed])?;
        self.state()
            .job
            .as_ref()
            .ok_or_else(|| PipelineError::config("No file selected"))
    }
}

/// Receive from an optional receiver, dropping it once it is closed.
async fn recv<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    let item = match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => None,
    };
    if item.is_none() {
        *rx = None;
    }
    item
}
