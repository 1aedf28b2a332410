//! Error types for import operations.

use thiserror::Error;

/// Errors that can occur while importing backup files into the cluster.
#[derive(Error, Debug)]
pub enum ImportError {
    /// Invalid importer configuration, rejected before any work begins.
    #[error("invalid importer configuration: {0}")]
    InvalidConfig(String),

    /// The importer is not in the key-value mode the operation requires.
    #[error("restore mode mismatch: {0}")]
    ModeMismatch(String),

    /// Shard scan against the placement service failed or returned an
    /// unusable layout.
    #[error("shard scan failed: {0}")]
    ShardScan(String),

    /// A download could not be completed on a storage node.
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// The storage node rejected an ingest with a generic error payload.
    #[error("ingest failed: {0}")]
    IngestFailed(String),

    /// The shard's epoch moved past the one the data was downloaded for.
    #[error("shard epoch not match: {0}")]
    EpochNotMatch(String),

    /// The ingested range is no longer covered by the target shard.
    #[error("key not in shard: {0}")]
    KeyNotInShard(String),

    /// The shard has no leader to ingest into.
    #[error("shard {0} has no leader")]
    NoLeader(u64),

    /// A boundary key could not be decoded.
    #[error("key codec error: {0}")]
    Codec(String),

    /// A lifecycle hook failed; the index identifies which one.
    #[error("hook #{index} failed: {source}")]
    Hook {
        index: usize,
        #[source]
        source: Box<ImportError>,
    },

    /// RPC transport failure talking to a storage node.
    #[error("transfer rpc to node {node_id} failed: {message}")]
    Transfer { node_id: u64, message: String },
}

impl ImportError {
    /// Whether retrying cannot help.
    ///
    /// Epoch and placement errors are deliberately *not* permanent: the
    /// range-level retry recovers from them by rediscovering the shard
    /// layout from scratch.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ImportError::InvalidConfig(_)
                | ImportError::ModeMismatch(_)
                | ImportError::NoLeader(_)
                | ImportError::Codec(_)
                | ImportError::Hook { .. }
        )
    }
}
