//! Backoff policies for the two retry layers.
//!
//! The range-level policy re-runs a whole scan→download→ingest pass; the
//! download policy re-issues a single shard's downloads. Keeping them
//! separate lets download hiccups burn their own budget before the range
//! pass is charged.

use std::time::Duration;

use tokio_retry2::strategy::{jitter, ExponentialBackoff, FixedInterval};
use tokio_retry2::RetryError;

use crate::error::ImportError;

const RANGE_RETRY_ATTEMPTS: usize = 8;
const DOWNLOAD_RETRY_ATTEMPTS: usize = 5;

/// Range-level backoff: exponential from 1s, capped at 16s.
pub(crate) fn range_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(500)
        .max_delay_millis(16_000)
        .map(jitter)
        .take(RANGE_RETRY_ATTEMPTS)
}

/// Download-specific backoff: fixed one-second interval.
pub(crate) fn download_backoff() -> impl Iterator<Item = Duration> {
    FixedInterval::from_millis(1_000)
        .map(jitter)
        .take(DOWNLOAD_RETRY_ATTEMPTS)
}

/// Splits an error into the retry engine's transient/permanent classes.
pub(crate) fn classify<T>(err: ImportError) -> Result<T, RetryError<ImportError>> {
    if err.is_permanent() {
        RetryError::to_permanent(err)
    } else {
        RetryError::to_transient(err)
    }
}
