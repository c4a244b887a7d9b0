//! Client side of the remote ingestion service.
//!
//! Provides the REST wrapper for collection listing and file submission,
//! a server-sent-events transport for the per-collection progress stream,
//! and the [`ProgressChannelManager`](channel::ProgressChannelManager)
//! that keeps that stream alive with backoff, heartbeat and timeout
//! policy.

pub mod api;
pub mod channel;
pub mod error;
pub mod messages;
pub mod reconnect;
pub mod sse;
pub mod transport;
