//! Batch size adviser.
//!
//! Maps a file size to a suggested ingestion batch size using a monotonic
//! step table. The suggestion is only a default: an operator-chosen value
//! is never replaced.

use crate::job::{ParsingConfig, DEFAULT_BATCH_SIZE};

const MB: u64 = 1024 * 1024;

/// `(exclusive lower bound in bytes, batch size)`, largest threshold first.
const BATCH_STEPS: &[(u64, u32)] = &[(100 * MB, 5000), (10 * MB, 2000), (MB, 1000)];

/// Suggest a batch size for a file of `file_size` bytes.
///
/// Files of 1 MB or less keep `configured_default`.
pub fn advise_batch_size(file_size: u64, configured_default: u32) -> u32 {
    BATCH_STEPS
        .iter()
        .find(|(threshold, _)| file_size > *threshold)
        .map(|(_, size)| *size)
        .unwrap_or(configured_default)
}

/// Apply the adviser to a parsing config unless the operator already
/// picked a batch size. Returns `true` when the value changed.
pub fn apply_advice(config: &mut ParsingConfig, file_size: u64) -> bool {
    if config.batch_size_explicit {
        return false;
    }
    let advised = advise_batch_size(file_size, DEFAULT_BATCH_SIZE);
    let changed = advised != config.batch_size;
    config.batch_size = advised;
    changed
}
