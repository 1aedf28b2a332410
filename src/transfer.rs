//! Storage-node RPC surface consumed by the importer.

use async_trait::async_trait;

use crate::error::ImportError;
use crate::rewrite::RewriteRule;
use crate::types::{CipherInfo, KeyRange, Peer, SstMeta, StorageBackend};

/// How the storage node should interpret the rewrite rule in a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadRequestType {
    /// The node rewrites already-encoded keys in place.
    #[default]
    Legacy,
    /// The node decodes, rewrites with the plain prefix and re-encodes.
    Keyspace,
}

/// One SST download request against a peer's node: fetch the named file
/// from blob storage, rewrite it, and keep the part covered by `sst.range`.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub sst: SstMeta,
    pub backend: StorageBackend,
    /// Blob-storage name of the backup file.
    pub name: String,
    pub rewrite_rule: RewriteRule,
    pub is_raw_kv: bool,
    pub cipher: Option<CipherInfo>,
    /// Run-scoped cache key letting nodes reuse fetched blobs across
    /// retries of the same restore.
    pub storage_cache_id: String,
    pub request_type: DownloadRequestType,
}

/// Outcome of a download: the range the node actually materialized.
#[derive(Debug, Clone, Default)]
pub struct DownloadResponse {
    pub range: KeyRange,
    /// The requested range contained no data on this node.
    pub is_empty: bool,
    pub crc32: u32,
}

/// Identity of the shard an ingest batch targets, fencing the call against
/// splits and leader movement.
#[derive(Debug, Clone)]
pub struct ShardContext {
    pub shard_id: u64,
    pub shard_epoch: u64,
    pub peer: Peer,
}

/// Batched ingest of downloaded SSTs into one shard.
#[derive(Debug, Clone)]
pub struct MultiIngestRequest {
    pub context: ShardContext,
    pub ssts: Vec<SstMeta>,
}

/// Error payload a storage node embeds in an ingest response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestErrorPayload {
    /// The addressed peer is not the shard leader; the payload may name
    /// the current one.
    NotLeader { leader: Option<Peer> },
    /// The shard's epoch moved past the descriptor's.
    EpochNotMatch,
    /// The batch's range is not covered by the shard.
    KeyNotInShard,
    /// Transient node-side condition (busy, not found, ...).
    Other(String),
}

/// Response to a multi-ingest call; `error: None` means the batch is in.
#[derive(Debug, Clone, Default)]
pub struct IngestResponse {
    pub error: Option<IngestErrorPayload>,
}

/// Per-destination-node transfer RPCs.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Downloads one SST payload onto `node_id`.
    async fn download_sst(
        &self,
        node_id: u64,
        req: &DownloadRequest,
    ) -> Result<DownloadResponse, ImportError>;

    /// Ingests a batch of downloaded SSTs into one shard on `node_id`.
    async fn multi_ingest(
        &self,
        node_id: u64,
        req: &MultiIngestRequest,
    ) -> Result<IngestResponse, ImportError>;

    /// Verifies that every listed node supports batched ingest.
    async fn check_multi_ingest_support(&self, node_ids: &[u64]) -> Result<(), ImportError>;

    /// Caps the download bandwidth of `node_id`, in bytes per second.
    async fn set_download_speed_limit(&self, node_id: u64, rate: u64) -> Result<(), ImportError>;

    /// Tears down the underlying connections.
    async fn close(&self) -> Result<(), ImportError>;
}
