//! Job state store: the single source of truth for one import.
//!
//! State changes only through [`apply`], a total and pure function of
//! `(state, event)`. Legal moves are listed in [`next_phase`]; any pair
//! not listed there leaves the state untouched, so an out-of-order or
//! stale event can never corrupt the store.
//!
//! ```text
//! idle -> configuring -> analyzing -> previewed -> transferring
//!      -> awaiting_server_ack -> succeeded | partially_failed | failed
//!                               | cancelled | completed_with_error -> idle
//! ```

use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::job::{FieldMappings, ImportJob, ParsingConfig};
use crate::outcome::ImportOutcome;
use crate::preview::PreviewReport;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Lifecycle phase of the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Idle,
    Configuring,
    Analyzing,
    Previewed,
    Transferring,
    AwaitingServerAck,
    Succeeded,
    PartiallyFailed,
    Failed,
    Cancelled,
    /// The remote process may have finished but the progress channel gave
    /// up (retry budget exhausted or absolute timeout).
    CompletedWithError,
}

impl JobPhase {
    pub const ALL: [JobPhase; 11] = [
        Self::Idle,
        Self::Configuring,
        Self::Analyzing,
        Self::Previewed,
        Self::Transferring,
        Self::AwaitingServerAck,
        Self::Succeeded,
        Self::PartiallyFailed,
        Self::Failed,
        Self::Cancelled,
        Self::CompletedWithError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Analyzing => "analyzing",
            Self::Previewed => "previewed",
            Self::Transferring => "transferring",
            Self::AwaitingServerAck => "awaiting_server_ack",
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::CompletedWithError => "completed_with_error",
        }
    }

    /// An upload and a progress channel are live.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Transferring | Self::AwaitingServerAck)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::PartiallyFailed
                | Self::Failed
                | Self::Cancelled
                | Self::CompletedWithError
        )
    }

    /// The job description may still be edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Configuring | Self::Previewed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer-level phase of the upload request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    #[default]
    Idle,
    Transferring,
    AwaitingServerAck,
    Completed,
    CompletedWithError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    pub phase: UploadPhase,
    /// 0-100, never decreases while the upload is live.
    pub transfer_percent: u8,
    /// Set when the network was unreachable; cleared on the next sign of life.
    pub offline: bool,
    /// The service answered the upload with an acceptance status. Kept
    /// through terminal phases so a progress retry can tell whether there
    /// is anything on the server to follow.
    #[serde(default)]
    pub accepted: bool,
}

/// Phase of the server-push progress channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    #[default]
    Closed,
    Connecting,
    Open,
    Reconnecting,
    Exhausted,
}

/// Last processed/total counts reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub processed: u64,
    pub total: u64,
}

impl ProgressCounts {
    /// Processed share in percent, when the total is known.
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let pct = (self.processed as f64 / self.total as f64 * 100.0).round();
        Some(pct.clamp(0.0, 100.0) as u8)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressChannelState {
    pub phase: ChannelPhase,
    pub retry_count: u32,
    pub last_event_at: Option<Timestamp>,
    pub last_known: ProgressCounts,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Everything the operator sees about the current import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub phase: JobPhase,
    pub job: Option<ImportJob>,
    pub preview: Option<PreviewReport>,
    pub upload: UploadState,
    pub channel: ProgressChannelState,
    pub outcome: Option<ImportOutcome>,
    /// Terminal error or warning message shown to the operator.
    pub message: Option<String>,
    /// Cached target collections; survives `reset`.
    pub collections: Vec<Collection>,
}

impl JobState {
    /// The progress channel is never open while no upload is live.
    pub fn holds_invariants(&self) -> bool {
        let channel_live = matches!(
            self.channel.phase,
            ChannelPhase::Open | ChannelPhase::Connecting | ChannelPhase::Reconnecting
        );
        !(channel_live && self.upload.phase == UploadPhase::Idle)
            && (self.phase.is_active() || !channel_live)
    }

    /// Whether the operator can ask for a manual progress retry. Only an
    /// upload the service accepted has progress worth reconnecting to.
    pub fn can_retry_progress(&self) -> bool {
        self.phase == JobPhase::CompletedWithError && self.job.is_some() && self.upload.accepted
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Every way the store can change. Components report what happened;
/// only [`apply`] decides what it means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    CollectionsLoaded(Vec<Collection>),
    FileSelected(ImportJob),
    ParsingChanged(ParsingConfig),
    TargetSelected(String),
    MappingsChanged(FieldMappings),
    AnalysisStarted,
    AnalysisCompleted(PreviewReport),
    AnalysisFailed(String),
    SubmitStarted,
    TransferProgress(u8),
    NetworkOffline(String),
    ServerAccepted,
    SubmitRejected(String),
    ChannelOpened,
    ChannelReconnecting {
        retry_count: u32,
    },
    ProgressReceived {
        processed: Option<u64>,
        total: Option<u64>,
        at: Timestamp,
    },
    ImportFinished(ImportOutcome),
    RemoteFailed(String),
    ChannelExhausted(String),
    TimedOut(String),
    Cancelled,
    RetryRequested,
    Reset,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CollectionsLoaded(_) => "collections_loaded",
            Self::FileSelected(_) => "file_selected",
            Self::ParsingChanged(_) => "parsing_changed",
            Self::TargetSelected(_) => "target_selected",
            Self::MappingsChanged(_) => "mappings_changed",
            Self::AnalysisStarted => "analysis_started",
            Self::AnalysisCompleted(_) => "analysis_completed",
            Self::AnalysisFailed(_) => "analysis_failed",
            Self::SubmitStarted => "submit_started",
            Self::TransferProgress(_) => "transfer_progress",
            Self::NetworkOffline(_) => "network_offline",
            Self::ServerAccepted => "server_accepted",
            Self::SubmitRejected(_) => "submit_rejected",
            Self::ChannelOpened => "channel_opened",
            Self::ChannelReconnecting { .. } => "channel_reconnecting",
            Self::ProgressReceived { .. } => "progress_received",
            Self::ImportFinished(_) => "import_finished",
            Self::RemoteFailed(_) => "remote_failed",
            Self::ChannelExhausted(_) => "channel_exhausted",
            Self::TimedOut(_) => "timed_out",
            Self::Cancelled => "cancelled",
            Self::RetryRequested => "retry_requested",
            Self::Reset => "reset",
        }
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// The phase `event` moves `state` into, or `None` when the event is not
/// legal in the current state.
pub fn next_phase(state: &JobState, event: &JobEvent) -> Option<JobPhase> {
    use JobPhase::*;

    let phase = state.phase;
    let has_job = state.job.is_some();
    let accepted = state.upload.accepted;
    let has_target = state
        .job
        .as_ref()
        .and_then(|j| j.target_collection.as_deref())
        .is_some_and(|t| !t.trim().is_empty());

    match (phase, event) {
        (_, JobEvent::CollectionsLoaded(_)) => Some(phase),

        (Idle | Configuring | Previewed, JobEvent::FileSelected(_)) => Some(Configuring),
        (Configuring | Previewed, JobEvent::ParsingChanged(_)) if has_job => Some(Configuring),
        (Configuring | Previewed, JobEvent::TargetSelected(_) | JobEvent::MappingsChanged(_))
            if has_job =>
        {
            Some(phase)
        }

        (Configuring | Previewed, JobEvent::AnalysisStarted) if has_job => Some(Analyzing),
        (Analyzing, JobEvent::AnalysisCompleted(_)) => Some(Previewed),
        (Analyzing, JobEvent::AnalysisFailed(_)) => Some(Configuring),

        (Configuring | Previewed, JobEvent::SubmitStarted) if has_target => Some(Transferring),
        (Transferring, JobEvent::TransferProgress(_)) => Some(Transferring),
        (Transferring, JobEvent::ServerAccepted) => Some(AwaitingServerAck),

        (
            Transferring | AwaitingServerAck,
            JobEvent::NetworkOffline(_)
            | JobEvent::ChannelOpened
            | JobEvent::ChannelReconnecting { .. }
            | JobEvent::ProgressReceived { .. },
        ) => Some(phase),

        (Transferring | AwaitingServerAck, JobEvent::ImportFinished(outcome)) => {
            Some(if outcome.has_failures() {
                PartiallyFailed
            } else {
                Succeeded
            })
        }
        (Transferring | AwaitingServerAck, JobEvent::SubmitRejected(_) | JobEvent::RemoteFailed(_)) => {
            Some(Failed)
        }
        (Transferring | AwaitingServerAck, JobEvent::ChannelExhausted(_) | JobEvent::TimedOut(_)) => {
            Some(CompletedWithError)
        }
        (Transferring | AwaitingServerAck, JobEvent::Cancelled) => Some(Cancelled),

        (CompletedWithError, JobEvent::RetryRequested) if has_job && accepted => {
            Some(AwaitingServerAck)
        }

        (
            Configuring | Previewed | Succeeded | PartiallyFailed | Failed | Cancelled
            | CompletedWithError,
            JobEvent::Reset,
        ) => Some(Idle),

        _ => None,
    }
}

/// Apply `event` to `state`, returning the new state.
///
/// Illegal events return an unchanged clone of `state`.
pub fn apply(state: &JobState, event: &JobEvent) -> JobState {
    let Some(phase) = next_phase(state, event) else {
        return state.clone();
    };

    let mut next = state.clone();
    next.phase = phase;

    match event {
        JobEvent::CollectionsLoaded(collections) => {
            next.collections = collections.clone();
        }
        JobEvent::FileSelected(job) => {
            next.job = Some(job.clone());
            next.preview = None;
            next.message = None;
        }
        JobEvent::ParsingChanged(parsing) => {
            if let Some(job) = next.job.as_mut() {
                job.parsing = parsing.clone();
            }
            next.preview = None;
        }
        JobEvent::TargetSelected(target) => {
            if let Some(job) = next.job.as_mut() {
                job.target_collection = Some(target.clone());
            }
        }
        JobEvent::MappingsChanged(mappings) => {
            if let Some(job) = next.job.as_mut() {
                job.field_mappings = mappings.clone();
            }
        }
        JobEvent::AnalysisStarted => {
            next.preview = None;
            next.message = None;
        }
        JobEvent::AnalysisCompleted(report) => {
            next.preview = Some(report.clone());
        }
        JobEvent::AnalysisFailed(warning) => {
            next.preview = Some(PreviewReport {
                warning: Some(warning.clone()),
                ..Default::default()
            });
        }
        JobEvent::SubmitStarted => {
            next.upload = UploadState {
                phase: UploadPhase::Transferring,
                ..Default::default()
            };
            next.channel = ProgressChannelState {
                phase: ChannelPhase::Connecting,
                ..Default::default()
            };
            next.outcome = None;
            next.message = None;
        }
        JobEvent::TransferProgress(percent) => {
            let percent = (*percent).min(100);
            next.upload.transfer_percent = next.upload.transfer_percent.max(percent);
            next.upload.offline = false;
        }
        JobEvent::NetworkOffline(_) => {
            next.upload.offline = true;
        }
        JobEvent::ServerAccepted => {
            next.upload.phase = UploadPhase::AwaitingServerAck;
            next.upload.transfer_percent = 100;
            next.upload.offline = false;
            next.upload.accepted = true;
        }
        JobEvent::ChannelOpened => {
            if next.channel.phase == ChannelPhase::Connecting {
                next.channel.phase = ChannelPhase::Open;
            }
        }
        JobEvent::ChannelReconnecting { retry_count } => {
            next.channel.phase = ChannelPhase::Reconnecting;
            next.channel.retry_count = *retry_count;
        }
        JobEvent::ProgressReceived {
            processed,
            total,
            at,
        } => {
            let counts = &mut next.channel.last_known;
            counts.processed = processed.unwrap_or(counts.processed);
            counts.total = total.unwrap_or(counts.total);
            next.channel.last_event_at = Some(*at);
            next.channel.phase = ChannelPhase::Open;
            next.channel.retry_count = 0;
            next.upload.offline = false;
        }
        JobEvent::ImportFinished(outcome) => {
            next.channel.phase = ChannelPhase::Closed;
            next.channel.last_known.processed = outcome.success_count;
            next.upload.phase = UploadPhase::Completed;
            next.upload.offline = false;
            next.outcome = Some(outcome.clone());
        }
        JobEvent::SubmitRejected(message) | JobEvent::RemoteFailed(message) => {
            next.channel.phase = ChannelPhase::Closed;
            next.upload.phase = UploadPhase::CompletedWithError;
            next.message = Some(message.clone());
        }
        JobEvent::ChannelExhausted(message) => {
            next.channel.phase = ChannelPhase::Exhausted;
            next.upload.phase = UploadPhase::CompletedWithError;
            next.message = Some(message.clone());
        }
        JobEvent::TimedOut(message) => {
            next.channel.phase = ChannelPhase::Closed;
            next.upload.phase = UploadPhase::CompletedWithError;
            next.message = Some(message.clone());
        }
        JobEvent::Cancelled => {
            next.upload = UploadState::default();
            next.channel.phase = ChannelPhase::Closed;
            next.message = Some("Import cancelled".to_string());
        }
        JobEvent::RetryRequested => {
            next.upload.phase = UploadPhase::AwaitingServerAck;
            next.channel.phase = ChannelPhase::Connecting;
            next.channel.retry_count = 0;
            next.message = None;
        }
        JobEvent::Reset => {
            next = JobState {
                collections: std::mem::take(&mut next.collections),
                ..Default::default()
            };
        }
    }

    next
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owner of the current [`JobState`]; the only place it is mutated.
#[derive(Debug, Default)]
pub struct JobStore {
    state: JobState,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn phase(&self) -> JobPhase {
        self.state.phase
    }

    /// Apply an event. Returns `false` when the event was ignored.
    pub fn dispatch(&mut self, event: &JobEvent) -> bool {
        if next_phase(&self.state, event).is_none() {
            return false;
        }
        self.state = apply(&self.state, event);
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ParsingConfig, SourceFile, SourceFormat};
    use crate::types::new_job_id;

    fn job_with_target() -> ImportJob {
        let mut job = ImportJob::new(
            new_job_id(),
            SourceFile::new("/tmp/a.csv", 2048),
            ParsingConfig::for_format(SourceFormat::Csv),
        );
        job.target_collection = Some("people".into());
        job
    }

    fn drive(events: &[JobEvent]) -> JobState {
        events
            .iter()
            .fold(JobState::default(), |state, event| apply(&state, event))
    }

    fn now() -> Timestamp {
        chrono::Utc::now()
    }

    /// A reachable state for every phase.
    fn state_in(phase: JobPhase) -> JobState {
        let job = job_with_target();
        let path: Vec<JobEvent> = match phase {
            JobPhase::Idle => vec![],
            JobPhase::Configuring => vec![JobEvent::FileSelected(job)],
            JobPhase::Analyzing => vec![JobEvent::FileSelected(job), JobEvent::AnalysisStarted],
            JobPhase::Previewed => vec![
                JobEvent::FileSelected(job),
                JobEvent::AnalysisStarted,
                JobEvent::AnalysisCompleted(PreviewReport::default()),
            ],
            JobPhase::Transferring => vec![JobEvent::FileSelected(job), JobEvent::SubmitStarted],
            JobPhase::AwaitingServerAck => vec![
                JobEvent::FileSelected(job),
                JobEvent::SubmitStarted,
                JobEvent::ServerAccepted,
            ],
            JobPhase::Succeeded => vec![
                JobEvent::FileSelected(job),
                JobEvent::SubmitStarted,
                JobEvent::ImportFinished(ImportOutcome::new(10, 0, 5, vec![])),
            ],
            JobPhase::PartiallyFailed => vec![
                JobEvent::FileSelected(job),
                JobEvent::SubmitStarted,
                JobEvent::ImportFinished(ImportOutcome::new(10, 1, 5, vec![])),
            ],
            JobPhase::Failed => vec![
                JobEvent::FileSelected(job),
                JobEvent::SubmitStarted,
                JobEvent::SubmitRejected("400".into()),
            ],
            JobPhase::Cancelled => vec![
                JobEvent::FileSelected(job),
                JobEvent::SubmitStarted,
                JobEvent::Cancelled,
            ],
            JobPhase::CompletedWithError => vec![
                JobEvent::FileSelected(job),
                JobEvent::SubmitStarted,
                JobEvent::ServerAccepted,
                JobEvent::ChannelExhausted("gave up".into()),
            ],
        };
        let state = drive(&path);
        assert_eq!(state.phase, phase, "fixture for {phase} is wrong");
        state
    }

    fn sample_events() -> Vec<JobEvent> {
        vec![
            JobEvent::CollectionsLoaded(vec![]),
            JobEvent::FileSelected(job_with_target()),
            JobEvent::ParsingChanged(ParsingConfig::for_format(SourceFormat::Json)),
            JobEvent::TargetSelected("other".into()),
            JobEvent::MappingsChanged(FieldMappings::new()),
            JobEvent::AnalysisStarted,
            JobEvent::AnalysisCompleted(PreviewReport::default()),
            JobEvent::AnalysisFailed("bad".into()),
            JobEvent::SubmitStarted,
            JobEvent::TransferProgress(50),
            JobEvent::NetworkOffline("down".into()),
            JobEvent::ServerAccepted,
            JobEvent::SubmitRejected("422".into()),
            JobEvent::ChannelOpened,
            JobEvent::ChannelReconnecting { retry_count: 1 },
            JobEvent::ProgressReceived {
                processed: Some(1),
                total: Some(2),
                at: now(),
            },
            JobEvent::ImportFinished(ImportOutcome::new(1, 0, 1, vec![])),
            JobEvent::RemoteFailed("boom".into()),
            JobEvent::ChannelExhausted("gave up".into()),
            JobEvent::TimedOut("slow".into()),
            JobEvent::Cancelled,
            JobEvent::RetryRequested,
            JobEvent::Reset,
        ]
    }

    #[test]
    fn illegal_events_leave_state_unchanged() {
        for phase in JobPhase::ALL {
            let state = state_in(phase);
            for event in sample_events() {
                if next_phase(&state, &event).is_none() {
                    assert_eq!(
                        apply(&state, &event),
                        state,
                        "{} in {phase} must be a no-op",
                        event.name()
                    );
                }
            }
        }
    }

    #[test]
    fn every_reachable_state_holds_invariants() {
        for phase in JobPhase::ALL {
            let state = state_in(phase);
            assert!(state.holds_invariants(), "{phase} fixture");
            for event in sample_events() {
                let next = apply(&state, &event);
                assert!(
                    next.holds_invariants(),
                    "{} from {phase} broke invariants: {next:?}",
                    event.name()
                );
            }
        }
    }

    #[test]
    fn submit_while_active_is_ignored() {
        for phase in [JobPhase::Transferring, JobPhase::AwaitingServerAck] {
            let state = state_in(phase);
            assert_eq!(apply(&state, &JobEvent::SubmitStarted), state);
        }
    }

    #[test]
    fn submit_requires_target() {
        let mut job = job_with_target();
        job.target_collection = None;
        let state = drive(&[JobEvent::FileSelected(job)]);
        assert!(next_phase(&state, &JobEvent::SubmitStarted).is_none());
    }

    #[test]
    fn job_is_frozen_once_submission_begins() {
        let state = state_in(JobPhase::Transferring);
        let changed = apply(
            &state,
            &JobEvent::ParsingChanged(ParsingConfig::for_format(SourceFormat::Json)),
        );
        assert_eq!(changed, state);
        assert_eq!(
            apply(&state, &JobEvent::TargetSelected("x".into())),
            state
        );
    }

    #[test]
    fn parsing_change_invalidates_preview() {
        let state = state_in(JobPhase::Previewed);
        assert!(state.preview.is_some());
        let next = apply(
            &state,
            &JobEvent::ParsingChanged(ParsingConfig::for_format(SourceFormat::Json)),
        );
        assert_eq!(next.phase, JobPhase::Configuring);
        assert!(next.preview.is_none());
    }

    #[test]
    fn analysis_failure_is_a_warning_not_a_failure() {
        let state = state_in(JobPhase::Analyzing);
        let next = apply(&state, &JobEvent::AnalysisFailed("unreadable".into()));
        assert_eq!(next.phase, JobPhase::Configuring);
        assert_eq!(
            next.preview.and_then(|p| p.warning).as_deref(),
            Some("unreadable")
        );
    }

    #[test]
    fn transfer_percent_never_decreases() {
        let state = state_in(JobPhase::Transferring);
        let state = apply(&state, &JobEvent::TransferProgress(60));
        let state = apply(&state, &JobEvent::TransferProgress(40));
        assert_eq!(state.upload.transfer_percent, 60);
        let state = apply(&state, &JobEvent::TransferProgress(250));
        assert_eq!(state.upload.transfer_percent, 100);
    }

    #[test]
    fn acceptance_is_not_completion() {
        let state = state_in(JobPhase::AwaitingServerAck);
        assert_eq!(state.upload.phase, UploadPhase::AwaitingServerAck);
        assert!(state.outcome.is_none());
        assert!(!state.phase.is_terminal());
    }

    #[test]
    fn progress_event_reopens_channel_and_resets_retries() {
        let state = state_in(JobPhase::AwaitingServerAck);
        let state = apply(&state, &JobEvent::ChannelReconnecting { retry_count: 2 });
        assert_eq!(state.channel.phase, ChannelPhase::Reconnecting);
        assert_eq!(state.channel.retry_count, 2);

        let state = apply(
            &state,
            &JobEvent::ProgressReceived {
                processed: Some(40),
                total: None,
                at: now(),
            },
        );
        assert_eq!(state.channel.phase, ChannelPhase::Open);
        assert_eq!(state.channel.retry_count, 0);
        assert_eq!(state.channel.last_known.processed, 40);
        assert!(state.channel.last_event_at.is_some());
    }

    #[test]
    fn absent_counts_keep_prior_values() {
        let state = state_in(JobPhase::AwaitingServerAck);
        let state = apply(
            &state,
            &JobEvent::ProgressReceived {
                processed: Some(10),
                total: Some(100),
                at: now(),
            },
        );
        let state = apply(
            &state,
            &JobEvent::ProgressReceived {
                processed: None,
                total: None,
                at: now(),
            },
        );
        assert_eq!(
            state.channel.last_known,
            ProgressCounts {
                processed: 10,
                total: 100
            }
        );
        assert_eq!(state.channel.last_known.percent(), Some(10));
    }

    #[test]
    fn channel_opened_does_not_override_reconnecting() {
        let state = state_in(JobPhase::AwaitingServerAck);
        let state = apply(&state, &JobEvent::ChannelOpened);
        assert_eq!(state.channel.phase, ChannelPhase::Open);

        let state = apply(&state, &JobEvent::ChannelReconnecting { retry_count: 1 });
        let state = apply(&state, &JobEvent::ChannelOpened);
        assert_eq!(state.channel.phase, ChannelPhase::Reconnecting);
    }

    #[test]
    fn finished_with_failures_is_partial() {
        let state = state_in(JobPhase::AwaitingServerAck);
        let outcome = ImportOutcome::new(900, 10, 100, vec![]);
        let next = apply(&state, &JobEvent::ImportFinished(outcome.clone()));
        assert_eq!(next.phase, JobPhase::PartiallyFailed);
        assert_eq!(next.outcome, Some(outcome));
        assert_eq!(next.channel.phase, ChannelPhase::Closed);
        assert_eq!(next.upload.phase, UploadPhase::Completed);
    }

    #[test]
    fn cancel_closes_channel_and_drops_upload() {
        let state = state_in(JobPhase::Transferring);
        let next = apply(&state, &JobEvent::Cancelled);
        assert_eq!(next.phase, JobPhase::Cancelled);
        assert_eq!(next.channel.phase, ChannelPhase::Closed);
        assert_eq!(next.upload, UploadState::default());
    }

    #[test]
    fn cancel_outside_active_phase_is_ignored() {
        for phase in [JobPhase::Idle, JobPhase::Previewed, JobPhase::Succeeded] {
            let state = state_in(phase);
            assert_eq!(apply(&state, &JobEvent::Cancelled), state);
        }
    }

    #[test]
    fn exhaustion_allows_manual_retry() {
        let state = state_in(JobPhase::CompletedWithError);
        assert_eq!(state.channel.phase, ChannelPhase::Exhausted);
        assert!(state.can_retry_progress());

        let next = apply(&state, &JobEvent::RetryRequested);
        assert_eq!(next.phase, JobPhase::AwaitingServerAck);
        assert_eq!(next.upload.phase, UploadPhase::AwaitingServerAck);
        assert_eq!(next.channel.phase, ChannelPhase::Connecting);
        assert_eq!(next.channel.retry_count, 0);
    }

    #[test]
    fn retry_requires_an_accepted_upload() {
        // Exhaustion while the file was still in flight: the service never
        // acknowledged it, so there is no progress to reconnect to.
        let state = drive(&[
            JobEvent::FileSelected(job_with_target()),
            JobEvent::SubmitStarted,
            JobEvent::NetworkOffline("connection refused".into()),
            JobEvent::ChannelExhausted("gave up".into()),
        ]);
        assert_eq!(state.phase, JobPhase::CompletedWithError);
        assert!(!state.upload.accepted);
        assert!(!state.can_retry_progress());
        assert_eq!(next_phase(&state, &JobEvent::RetryRequested), None);
        assert_eq!(apply(&state, &JobEvent::RetryRequested), state);
    }

    #[test]
    fn acceptance_survives_terminal_phases_until_reset() {
        let accepted = state_in(JobPhase::AwaitingServerAck);
        assert!(accepted.upload.accepted);

        let timed_out = apply(&accepted, &JobEvent::TimedOut("slow".into()));
        assert!(timed_out.upload.accepted);
        assert!(timed_out.can_retry_progress());

        assert!(!apply(&timed_out, &JobEvent::Reset).upload.accepted);

        let resubmitted = apply(&state_in(JobPhase::Previewed), &JobEvent::SubmitStarted);
        assert!(!resubmitted.upload.accepted);
    }

    #[test]
    fn finished_import_reports_inserted_records_as_processed() {
        let state = apply(
            &state_in(JobPhase::AwaitingServerAck),
            &JobEvent::ImportFinished(ImportOutcome::new(900, 10, 1234, vec![])),
        );
        assert_eq!(state.channel.last_known.processed, 900);
        assert_eq!(state.outcome.as_ref().map(|o| o.total_count), Some(910));
    }

    #[test]
    fn reset_preserves_only_collections() {
        let collections = vec![Collection {
            collection_name: "people".into(),
            display_name: None,
            fields: vec![],
        }];
        let state = apply(
            &state_in(JobPhase::Succeeded),
            &JobEvent::CollectionsLoaded(collections.clone()),
        );
        let next = apply(&state, &JobEvent::Reset);
        assert_eq!(
            next,
            JobState {
                collections,
                ..Default::default()
            }
        );
    }

    #[test]
    fn reset_is_rejected_mid_flight() {
        for phase in [
            JobPhase::Analyzing,
            JobPhase::Transferring,
            JobPhase::AwaitingServerAck,
        ] {
            let state = state_in(phase);
            assert_eq!(apply(&state, &JobEvent::Reset), state);
        }
    }

    #[test]
    fn store_dispatch_reports_ignored_events() {
        let mut store = JobStore::new();
        assert!(!store.dispatch(&JobEvent::SubmitStarted));
        assert!(store.dispatch(&JobEvent::FileSelected(job_with_target())));
        assert_eq!(store.phase(), JobPhase::Configuring);
    }

    #[test]
    fn state_serializes() {
        let state = state_in(JobPhase::AwaitingServerAck);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "awaiting_server_ack");
        assert_eq!(json["upload"]["phase"], "awaiting_server_ack");
        let back: JobState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
