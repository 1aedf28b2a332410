//! Success accounting for completed imports.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals of successfully ingested backup data.
#[derive(Debug, Default)]
pub struct ImportSummary {
    files: AtomicU64,
    kvs: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of the summary counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummarySnapshot {
    pub files: u64,
    pub kvs: u64,
    pub bytes: u64,
}

impl ImportSummary {
    /// Records one file's declared row and byte counts.
    pub fn collect_success(&self, kvs: u64, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.kvs.fetch_add(kvs, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SummarySnapshot {
        SummarySnapshot {
            files: self.files.load(Ordering::Relaxed),
            kvs: self.kvs.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
