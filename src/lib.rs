//! SnapImport - loads backed-up SST files into a live sharded key-value
//! cluster during a restore.
//!
//! The importer translates backup-time key ranges into the destination
//! cluster's *current* shard layout, which may differ arbitrarily from the
//! layout at backup time, places each file onto every replica of each
//! covering shard, and ingests the downloaded data on the shard leader.
//!
//! # Features
//!
//! - **Layout translation**: rewrite rules map backup-time key prefixes
//!   onto the destination key space; files are re-clipped per shard
//! - **Per-node throttling**: bounded token pools per destination node and
//!   resource class, with an aggregate backpressure signal
//! - **Fault recovery**: leader movement is followed in place, epoch
//!   changes force a fresh shard scan, transient failures retry with
//!   backoff
//! - **Idempotent delivery**: at-least-once per file; replayed ingests are
//!   deduplicated by the storage nodes
//!
//! The shard layout comes from a [`ShardLocator`] and all node RPCs go
//! through a [`TransferClient`]; both are injected at construction, so the
//! importer is independent of any concrete placement service or transport.

pub mod codec;
mod download;
pub mod error;
pub mod importer;
pub mod locator;
mod retry;
pub mod rewrite;
pub mod summary;
mod throttle;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::ImportError;
pub use importer::{
    BeforeIngestHook, CloseHook, CreateHook, DeferredHook, ImporterOptions, SnapImporter,
};
pub use locator::{ShardLocator, SCAN_SHARD_PAGE_LIMIT};
pub use rewrite::{RewriteRule, RewriteRules, TimeRange};
pub use summary::{ImportSummary, SummarySnapshot};
pub use transfer::{
    DownloadRequest, DownloadRequestType, DownloadResponse, IngestErrorPayload, IngestResponse,
    MultiIngestRequest, ShardContext, TransferClient,
};
pub use types::{
    ApiVersion, BackupFile, CipherInfo, FileSet, KeyRange, KvMode, Node, NodeState, Peer,
    RewriteMode, Shard, ShardInfo, SstMeta, StorageBackend, CF_DEFAULT, CF_WRITE,
};
