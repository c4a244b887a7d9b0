//! Operator notices.
//!
//! The orchestrator reports outcomes through the [`Notifier`] trait as
//! `{severity, message}` notices; how they reach the operator is up to the
//! implementation.
//!
//! - [`EventBus`] fans notices out to any number of subscribers.
//! - [`LogNotifier`] writes them to the tracing log.

pub mod bus;
pub mod notice;

pub use bus::EventBus;
pub use notice::{LogNotifier, Notice, Notifier, Severity};
