//! Core types and pure logic for the bulkload import orchestrator.
//!
//! Nothing in this crate performs I/O. It defines the job model, preview
//! statistics, the batch size adviser, and the job state store whose
//! reducer every other crate feeds.

pub mod batch;
pub mod collection;
pub mod error;
pub mod job;
pub mod outcome;
pub mod preview;
pub mod store;
pub mod types;
