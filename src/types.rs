//! Data model for the import pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rewrite::RewriteRules;

/// Key-value mode the restore operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvMode {
    /// Table data: keys are rewritten through rewrite rules and carry the
    /// transactional encoding. This is the default mode.
    Table,
    /// Raw key-value data, restored byte-for-byte within configured bounds.
    Raw,
    /// Transactional key-value data without table rewriting; boundary keys
    /// are byte-encoded before use.
    Txn,
}

/// How storage nodes are told to apply rewrite rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMode {
    /// Old nodes rewrite already-encoded keys; prefixes must be handed to
    /// them pre-encoded.
    Legacy,
    /// Keyspace-aware nodes decode, rewrite with plain prefixes and
    /// re-encode themselves.
    Keyspace,
}

/// API version tag carried opaquely into transfer descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiVersion {
    #[default]
    V1,
    V1Ttl,
    V2,
}

/// Column family holding ordinary data keys.
pub const CF_DEFAULT: &str = "default";
/// Column family holding transactional write records.
pub const CF_WRITE: &str = "write";

/// Backup-time descriptor of one SST file.
///
/// The payload bytes live in external blob storage addressed by `name`;
/// the importer never touches them directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    /// Column family recorded at backup time; may be overridden by the
    /// family inferred from the file name.
    pub cf: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    /// Physical file size in bytes.
    pub size: u64,
    pub total_kvs: u64,
    pub total_bytes: u64,
    /// Initialization vector when the file was encrypted at backup time.
    #[serde(default)]
    pub cipher_iv: Vec<u8>,
}

/// A group of backup files sharing one rewrite-rule set, typically one
/// logical table or range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSet {
    pub files: Vec<BackupFile>,
    pub rewrite_rules: RewriteRules,
}

/// State of a destination storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Up,
    Offline,
    Tombstone,
}

/// A destination storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub address: String,
    pub state: NodeState,
}

/// One replica of a shard, resident on a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub node_id: u64,
}

/// A contiguous key-range partition of the destination cluster.
///
/// An empty `end_key` means the shard is unbounded above. The epoch is a
/// fencing token bumped on splits and merges; any descriptor holding an
/// old epoch is stale.
#[derive(Debug, Clone, Default)]
pub struct Shard {
    pub id: u64,
    pub epoch: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub peers: Vec<Peer>,
}

/// Point-in-time shard descriptor with its current leader.
#[derive(Debug, Clone, Default)]
pub struct ShardInfo {
    pub shard: Shard,
    pub leader: Option<Peer>,
}

/// A byte-key range; an empty `end` means "unbounded above".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

/// Transfer descriptor handed to the storage layer's download and ingest
/// RPCs: one physical payload's placement and byte range.
///
/// Constructed fresh per download attempt and discarded once the owning
/// shard's ingest succeeds or the attempt is abandoned.
#[derive(Debug, Clone)]
pub struct SstMeta {
    pub uuid: Uuid,
    pub cf_name: String,
    /// Post-rewrite, post-shard-clip byte range. Always `start <= end`.
    pub range: KeyRange,
    /// Declared payload length in bytes.
    pub length: u64,
    pub shard_id: u64,
    pub shard_epoch: u64,
    pub cipher_iv: Vec<u8>,
    pub api_version: ApiVersion,
    /// Set when the range end was clipped to a raw-mode restore bound.
    pub end_key_exclusive: bool,
}

/// Cipher configuration for encrypted backup files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CipherInfo {
    pub cipher_type: String,
    pub cipher_key: Vec<u8>,
}

/// Descriptor of the external blob storage holding the backup files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageBackend {
    pub provider: String,
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
}
