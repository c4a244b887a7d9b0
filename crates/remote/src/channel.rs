//! Progress channel manager.
//!
//! Each import gets one channel task. The task owns the live stream and
//! every timer attached to it (reconnect backoff, heartbeat, absolute
//! timeout); all of them are dropped together when the task exits, which
//! happens on a terminal event, on exhaustion, on timeout, or when the
//! job's [`CancellationToken`] fires.
//!
//! ```text
//! closed -> connecting -> open <-> reconnecting -> (open | exhausted) -> closed
//! ```
//!
//! The task reports what happens as [`ChannelEvent`]s over an mpsc
//! channel; it never touches job state itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use bulkload_core::outcome::ImportOutcome;
use bulkload_core::store::JobEvent;
use bulkload_core::types::Timestamp;

use crate::error::TransportError;
use crate::messages::{ProgressMessage, ProgressUpdate};
use crate::reconnect::ChannelPolicy;
use crate::transport::{ChannelTarget, ProgressStream, ProgressTransport};

/// Buffered channel events per import.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The first connection attempt succeeded.
    Opened,
    /// The connection was lost; the next attempt runs after `delay`.
    ReconnectScheduled {
        retry_count: u32,
        delay: Duration,
        reason: String,
    },
    /// A reconnect attempt is starting. `retry_count` includes it.
    Reconnecting { retry_count: u32 },
    Progress {
        processed: Option<u64>,
        total: Option<u64>,
        at: Timestamp,
    },
    Finished(ImportOutcome),
    /// The service reported that the import failed.
    RemoteFailed(String),
    /// The reconnect budget is spent.
    Exhausted(String),
    /// No terminal event arrived within the absolute timeout.
    TimedOut(String),
}

impl ChannelEvent {
    /// The channel task exits after sending this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished(_) | Self::RemoteFailed(_) | Self::Exhausted(_) | Self::TimedOut(_)
        )
    }
}

impl From<ChannelEvent> for JobEvent {
    fn from(event: ChannelEvent) -> Self {
        match event {
            ChannelEvent::Opened => JobEvent::ChannelOpened,
            ChannelEvent::ReconnectScheduled { retry_count, .. }
            | ChannelEvent::Reconnecting { retry_count } => {
                JobEvent::ChannelReconnecting { retry_count }
            }
            ChannelEvent::Progress {
                processed,
                total,
                at,
            } => JobEvent::ProgressReceived {
                processed,
                total,
                at,
            },
            ChannelEvent::Finished(outcome) => JobEvent::ImportFinished(outcome),
            ChannelEvent::RemoteFailed(message) => JobEvent::RemoteFailed(message),
            ChannelEvent::Exhausted(message) => JobEvent::ChannelExhausted(message),
            ChannelEvent::TimedOut(message) => JobEvent::TimedOut(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Opens progress channels over a shared transport.
#[derive(Clone)]
pub struct ProgressChannelManager {
    transport: Arc<dyn ProgressTransport>,
    policy: ChannelPolicy,
}

impl ProgressChannelManager {
    pub fn new(transport: Arc<dyn ProgressTransport>, policy: ChannelPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &ChannelPolicy {
        &self.policy
    }

    /// Spawn the channel task for one import.
    ///
    /// `cancel` is the job's token: cancelling it stops the task, and
    /// [`ChannelHandle::close`] cancels it for everyone sharing it.
    pub fn open(
        &self,
        target: ChannelTarget,
        cancel: CancellationToken,
    ) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        tracing::info!(
            collection = %target.collection,
            format = %target.format,
            "Opening progress channel",
        );

        let task = ChannelTask {
            transport: Arc::clone(&self.transport),
            max_retries: self.policy.max_retries_for(target.format),
            policy: self.policy.clone(),
            target,
            events: events_tx,
            ready: Some(ready_tx),
            last_processed: 0,
        };
        let handle = tokio::spawn(task.run(cancel.clone()));

        (
            ChannelHandle {
                cancel,
                ready: Some(ready_rx),
                task: handle,
            },
            events_rx,
        )
    }
}

/// Owned handle to a running channel task. Dropping it closes the
/// channel.
#[derive(Debug)]
pub struct ChannelHandle {
    cancel: CancellationToken,
    ready: Option<oneshot::Receiver<()>>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    /// Resolves once the first connection attempt has finished, whether
    /// or not it succeeded. Available once.
    pub fn take_ready(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ready.take()
    }

    /// Cancel the job token, stopping the task and its timers.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit.
    pub async fn closed(&mut self) {
        if let Err(e) = (&mut self.task).await {
            tracing::error!(error = %e, "Progress channel task panicked");
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

enum Pump {
    /// A terminal event was delivered.
    Terminal,
    /// The stream failed or stalled.
    Lost(String),
}

struct ChannelTask {
    transport: Arc<dyn ProgressTransport>,
    target: ChannelTarget,
    policy: ChannelPolicy,
    max_retries: u32,
    events: mpsc::Sender<ChannelEvent>,
    ready: Option<oneshot::Sender<()>>,
    last_processed: u64,
}

impl ChannelTask {
    async fn run(mut self, cancel: CancellationToken) {
        let events = self.events.clone();
        let timeout = self.policy.absolute_timeout;
        let collection = self.target.collection.clone();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(%collection, "Progress channel cancelled");
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(%collection, timeout_secs = timeout.as_secs(), "Import timed out");
                let message = format!(
                    "No final result within {}s; the import may still be running on the server",
                    timeout.as_secs()
                );
                let _ = events.send(ChannelEvent::TimedOut(message)).await;
            }
            _ = self.drive() => {}
        }

        tracing::debug!(%collection, "Progress channel closed");
    }

    async fn drive(&mut self) {
        let mut retry_count = 0u32;
        let mut reconnected = false;

        let mut link = self.transport.connect(&self.target).await;
        if link.is_ok() {
            self.emit(ChannelEvent::Opened).await;
        }
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }

        loop {
            let reason = match link {
                Ok(stream) => match self.pump(stream, reconnected, &mut retry_count).await {
                    Pump::Terminal => return,
                    Pump::Lost(reason) => reason,
                },
                Err(e) => e.to_string(),
            };

            if retry_count >= self.max_retries {
                tracing::warn!(
                    collection = %self.target.collection,
                    retry_count,
                    %reason,
                    "Progress channel exhausted",
                );
                let message = format!(
                    "Lost the progress stream after {retry_count} reconnect attempts ({reason}); \
                     the import may still be running on the server"
                );
                self.emit(ChannelEvent::Exhausted(message)).await;
                return;
            }

            let delay = self.policy.delay_for(retry_count);
            tracing::warn!(
                collection = %self.target.collection,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "Progress channel lost, scheduling reconnect",
            );
            self.emit(ChannelEvent::ReconnectScheduled {
                retry_count,
                delay,
                reason,
            })
            .await;
            tokio::time::sleep(delay).await;

            retry_count += 1;
            tracing::info!(
                collection = %self.target.collection,
                attempt = retry_count,
                "Reconnecting progress channel",
            );
            self.emit(ChannelEvent::Reconnecting { retry_count }).await;
            link = self.transport.connect(&self.target).await;
            reconnected = true;
        }
    }

    /// Read `stream` until it ends, stalls, or delivers a terminal event.
    async fn pump(&mut self, mut stream: ProgressStream, reconnected: bool, retry_count: &mut u32) -> Pump {
        let period = self.policy.heartbeat_interval;
        let stall = self.policy.stall_threshold;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_event = Instant::now();
        let mut awaiting_first = reconnected;

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(message)) => {
                        last_event = Instant::now();
                        if awaiting_first {
                            awaiting_first = false;
                            tracing::info!(
                                collection = %self.target.collection,
                                attempts = *retry_count,
                                "Progress channel reconnected",
                            );
                            *retry_count = 0;
                        }
                        if self.handle(message).await {
                            return Pump::Terminal;
                        }
                    }
                    Some(Err(e)) => return Pump::Lost(e.to_string()),
                    None => return Pump::Lost(TransportError::Closed.to_string()),
                },
                _ = heartbeat.tick() => {
                    let silent = last_event.elapsed();
                    if silent >= stall {
                        tracing::warn!(
                            collection = %self.target.collection,
                            silent_secs = silent.as_secs(),
                            "Progress channel stalled, forcing reconnect",
                        );
                        return Pump::Lost(format!("no progress event for {}s", silent.as_secs()));
                    }
                }
            }
        }
    }

    /// Forward one message. Returns `true` when it was terminal.
    async fn handle(&mut self, message: ProgressMessage) -> bool {
        match message.interpret(self.last_processed) {
            ProgressUpdate::Progress { processed, total } => {
                if let Some(processed) = processed {
                    self.last_processed = processed;
                }
                tracing::debug!(?processed, ?total, "Progress event");
                self.emit(ChannelEvent::Progress {
                    processed,
                    total,
                    at: Utc::now(),
                })
                .await;
                false
            }
            ProgressUpdate::Finished(outcome) => {
                tracing::info!(
                    collection = %self.target.collection,
                    success = outcome.success_count,
                    failed = outcome.failed_count,
                    processing_time_ms = outcome.processing_time_ms,
                    "Import finished",
                );
                self.emit(ChannelEvent::Finished(outcome)).await;
                true
            }
            ProgressUpdate::Failed(error) => {
                tracing::warn!(collection = %self.target.collection, %error, "Import failed remotely");
                self.emit(ChannelEvent::RemoteFailed(error)).await;
                true
            }
        }
    }

    async fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Channel event receiver dropped");
        }
    }
}
