//! Integration tests for the progress channel manager.
//!
//! A scripted transport hands out one canned stream per connection
//! attempt, and tokio's paused clock makes backoff, heartbeat and timeout
//! behaviour deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bulkload_core::job::SourceFormat;
use bulkload_remote::channel::{ChannelEvent, ChannelHandle, ProgressChannelManager};
use bulkload_remote::error::TransportError;
use bulkload_remote::messages::ProgressMessage;
use bulkload_remote::reconnect::ChannelPolicy;
use bulkload_remote::transport::{ChannelTarget, ProgressStream, ProgressTransport};

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

enum Script {
    /// The connection attempt fails.
    Refuse,
    /// Yield the items, then end the stream.
    Emit(Vec<Result<ProgressMessage, TransportError>>),
    /// Yield the messages, then stay silent forever.
    EmitThenHang(Vec<ProgressMessage>),
    /// Yield a progress message at a fixed interval, forever.
    Ticker(Duration),
}

struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            connects: AtomicUsize::new(0),
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressTransport for ScriptedTransport {
    async fn connect(&self, _target: &ChannelTarget) -> Result<ProgressStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Refuse);

        match script {
            Script::Refuse => Err(TransportError::Connect("connection refused".into())),
            Script::Emit(items) => Ok(Box::pin(stream::iter(items))),
            Script::EmitThenHang(messages) => Ok(Box::pin(
                stream::iter(messages.into_iter().map(Ok::<_, TransportError>)).chain(stream::pending()),
            )),
            Script::Ticker(every) => Ok(Box::pin(async_stream::stream! {
                let mut processed = 0;
                loop {
                    tokio::time::sleep(every).await;
                    processed += 10;
                    yield Ok::<_, TransportError>(progress(processed, 1_000_000));
                }
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn progress(processed: u64, total: u64) -> ProgressMessage {
    ProgressMessage {
        processed_count: Some(processed),
        total_count: Some(total),
        ..Default::default()
    }
}

fn done(inserted: u64, failed: u64) -> ProgressMessage {
    ProgressMessage {
        done: true,
        total_inserted: Some(inserted),
        total_failed: Some(failed),
        ..Default::default()
    }
}

fn open(
    transport: Arc<ScriptedTransport>,
    format: SourceFormat,
) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
    let manager = ProgressChannelManager::new(transport, ChannelPolicy::default());
    let target = ChannelTarget {
        format,
        collection: "people".into(),
    };
    manager.open(target, CancellationToken::new())
}

fn label(event: &ChannelEvent) -> String {
    match event {
        ChannelEvent::Opened => "opened".into(),
        ChannelEvent::ReconnectScheduled { retry_count, .. } => format!("scheduled:{retry_count}"),
        ChannelEvent::Reconnecting { retry_count } => format!("reconnecting:{retry_count}"),
        ChannelEvent::Progress { processed, .. } => format!("progress:{}", processed.unwrap_or(0)),
        ChannelEvent::Finished(o) => format!("finished:{}/{}", o.success_count, o.failed_count),
        ChannelEvent::RemoteFailed(m) => format!("failed:{m}"),
        ChannelEvent::Exhausted(_) => "exhausted".into(),
        ChannelEvent::TimedOut(_) => "timed_out".into(),
    }
}

/// Drain events until the task exits.
async fn collect(rx: &mut mpsc::Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn labels(events: &[ChannelEvent]) -> Vec<String> {
    events.iter().map(label).collect()
}

// ---------------------------------------------------------------------------
// Test: progress events then a terminal event produce an outcome
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn three_progress_events_then_done() {
    let transport = ScriptedTransport::new(vec![Script::Emit(vec![
        Ok(progress(100, 910)),
        Ok(progress(400, 910)),
        Ok(progress(800, 910)),
        Ok(done(900, 10)),
    ])]);
    let (_handle, mut rx) = open(transport.clone(), SourceFormat::Csv);

    let events = collect(&mut rx).await;
    assert_eq!(
        labels(&events),
        ["opened", "progress:100", "progress:400", "progress:800", "finished:900/10"]
    );
    let Some(ChannelEvent::Finished(outcome)) = events.last() else {
        panic!("expected a finished event");
    };
    assert_eq!(outcome.total_count, 910);
    assert_eq!(transport.connects(), 1);
}

// ---------------------------------------------------------------------------
// Test: six consecutive failures exhaust a budget of five
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn six_failures_exhaust_json_budget() {
    let transport = ScriptedTransport::new(Vec::new());
    let (_handle, mut rx) = open(transport.clone(), SourceFormat::Json);

    let events = collect(&mut rx).await;
    assert_eq!(
        labels(&events),
        [
            "scheduled:0",
            "reconnecting:1",
            "scheduled:1",
            "reconnecting:2",
            "scheduled:2",
            "reconnecting:3",
            "scheduled:3",
            "reconnecting:4",
            "scheduled:4",
            "reconnecting:5",
            "exhausted",
        ]
    );
    assert_eq!(transport.connects(), 6);

    // No automatic reconnect after exhaustion.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connects(), 6);
}

#[tokio::test(start_paused = true)]
async fn csv_budget_is_three() {
    let transport = ScriptedTransport::new(Vec::new());
    let (_handle, mut rx) = open(transport.clone(), SourceFormat::Csv);

    let events = collect(&mut rx).await;
    assert_eq!(label(events.last().unwrap()), "exhausted");
    assert_eq!(transport.connects(), 4);
}

// ---------------------------------------------------------------------------
// Test: backoff delays grow and are capped
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn backoff_delays_are_non_decreasing() {
    let transport = ScriptedTransport::new(Vec::new());
    let manager = ProgressChannelManager::new(
        transport,
        ChannelPolicy {
            max_retries: Some(10),
            ..Default::default()
        },
    );
    let target = ChannelTarget {
        format: SourceFormat::Json,
        collection: "people".into(),
    };
    let (_handle, mut rx) = manager.open(target, CancellationToken::new());

    let delays: Vec<Duration> = collect(&mut rx)
        .await
        .into_iter()
        .filter_map(|e| match e {
            ChannelEvent::ReconnectScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();

    assert_eq!(delays.len(), 10);
    assert_eq!(delays[0], Duration::from_millis(1000));
    assert_eq!(delays[1], Duration::from_millis(1500));
    for pair in delays.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    assert_eq!(*delays.last().unwrap(), Duration::from_millis(10_000));
}

// ---------------------------------------------------------------------------
// Test: the retry count resets once a reconnect delivers an event
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_retry_count() {
    let transport = ScriptedTransport::new(vec![
        Script::Refuse,
        Script::Emit(vec![
            Ok(progress(10, 100)),
            Err(TransportError::Stream("connection reset".into())),
        ]),
        Script::Emit(vec![Ok(done(100, 0))]),
    ]);
    let (_handle, mut rx) = open(transport.clone(), SourceFormat::Csv);

    let events = collect(&mut rx).await;
    assert_eq!(
        labels(&events),
        [
            "scheduled:0",
            "reconnecting:1",
            "progress:10",
            "scheduled:0",
            "reconnecting:1",
            "finished:100/0",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn remote_error_on_done_is_a_failure() {
    let transport = ScriptedTransport::new(vec![Script::Emit(vec![Ok(ProgressMessage {
        done: true,
        error: Some("collection dropped".into()),
        ..Default::default()
    })])]);
    let (_handle, mut rx) = open(transport, SourceFormat::Json);

    let events = collect(&mut rx).await;
    assert_eq!(labels(&events), ["opened", "failed:collection dropped"]);
}

// ---------------------------------------------------------------------------
// Test: heartbeat forces a reconnect on a silent channel
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stalled_channel_reconnects_once_per_window() {
    let transport = ScriptedTransport::new(vec![
        Script::EmitThenHang(vec![progress(1, 10)]),
        Script::Emit(vec![Ok(done(10, 0))]),
    ]);
    let start = Instant::now();
    let (_handle, mut rx) = open(transport.clone(), SourceFormat::Json);

    let mut stalled_at = None;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        if let ChannelEvent::ReconnectScheduled { reason, .. } = &event {
            assert!(reason.contains("no progress event"), "{reason}");
            stalled_at.get_or_insert(start.elapsed());
        }
        events.push(event);
    }

    let stalled_at = stalled_at.expect("a stall reconnect");
    assert!(stalled_at >= Duration::from_secs(30), "{stalled_at:?}");
    assert!(stalled_at < Duration::from_secs(40), "{stalled_at:?}");
    assert_eq!(
        labels(&events),
        ["opened", "progress:1", "scheduled:0", "reconnecting:1", "finished:10/0"]
    );
    assert_eq!(transport.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn steady_events_never_trigger_the_heartbeat() {
    let transport = ScriptedTransport::new(vec![Script::Ticker(Duration::from_secs(5))]);
    let (_handle, mut rx) = open(transport.clone(), SourceFormat::Json);

    let events = collect(&mut rx).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, ChannelEvent::ReconnectScheduled { .. })));
    assert_eq!(transport.connects(), 1);
}

// ---------------------------------------------------------------------------
// Test: absolute timeout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn absolute_timeout_closes_the_channel() {
    let transport = ScriptedTransport::new(vec![Script::Ticker(Duration::from_secs(5))]);
    let start = Instant::now();
    let (mut handle, mut rx) = open(transport, SourceFormat::Csv);

    let events = collect(&mut rx).await;
    assert_eq!(label(events.last().unwrap()), "timed_out");
    assert!(start.elapsed() >= Duration::from_secs(180));

    handle.closed().await;
    assert!(handle.is_finished());
}

// ---------------------------------------------------------------------------
// Test: cancellation stops the task and its timers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_closes_channel_without_terminal_event() {
    let transport = ScriptedTransport::new(vec![Script::Ticker(Duration::from_secs(5))]);
    let (mut handle, mut rx) = open(transport.clone(), SourceFormat::Csv);

    assert_eq!(rx.recv().await.as_ref().map(label).as_deref(), Some("opened"));
    handle.close();

    let rest = collect(&mut rx).await;
    assert!(rest.iter().all(|e| !e.is_terminal()));
    handle.closed().await;
    assert!(handle.is_finished());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_cancels_the_task() {
    let transport = ScriptedTransport::new(Vec::new());
    let (handle, mut rx) = open(transport.clone(), SourceFormat::Json);
    drop(handle);

    let _ = collect(&mut rx).await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(transport.connects() <= 1);
}

#[tokio::test(start_paused = true)]
async fn ready_fires_after_first_attempt() {
    let transport = ScriptedTransport::new(Vec::new());
    let (mut handle, _rx) = open(transport.clone(), SourceFormat::Json);

    let ready = handle.take_ready().expect("ready receiver");
    ready.await.expect("first attempt completes");
    assert_eq!(transport.connects(), 1);
    assert!(handle.take_ready().is_none());
}
