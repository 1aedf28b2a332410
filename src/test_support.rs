//! Scripted collaborators and fixtures shared by the importer tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::ImportError;
use crate::importer::{ImporterOptions, SnapImporter};
use crate::locator::ShardLocator;
use crate::rewrite::{RewriteRule, RewriteRules};
use crate::transfer::{
    DownloadRequest, DownloadResponse, IngestResponse, MultiIngestRequest, TransferClient,
};
use crate::types::{
    ApiVersion, BackupFile, CipherInfo, FileSet, KvMode, Node, NodeState, Peer, RewriteMode,
    Shard, ShardInfo, StorageBackend,
};

/// Installs a test subscriber so `RUST_LOG` works under `cargo test`;
/// repeated calls are fine.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a shard spanning `[start, end)` with one peer per listed node;
/// the first peer is the leader.
pub(crate) fn shard_info(id: u64, epoch: u64, start: &[u8], end: &[u8], node_ids: &[u64]) -> ShardInfo {
    let peers: Vec<Peer> = node_ids
        .iter()
        .enumerate()
        .map(|(i, &node_id)| Peer {
            id: id * 100 + i as u64 + 1,
            node_id,
        })
        .collect();
    ShardInfo {
        leader: peers.first().copied(),
        shard: Shard {
            id,
            epoch,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            peers,
        },
    }
}

/// A backup file declaring 10 rows and 999 bytes.
pub(crate) fn backup_file(name: &str, start: &[u8], end: &[u8]) -> BackupFile {
    BackupFile {
        name: name.to_string(),
        cf: "default".to_string(),
        start_key: start.to_vec(),
        end_key: end.to_vec(),
        size: 4096,
        total_kvs: 10,
        total_bytes: 999,
        cipher_iv: Vec::new(),
    }
}

/// One file set with a single `old_prefix -> new_prefix` rule.
pub(crate) fn file_set(
    old_prefix: &[u8],
    new_prefix: &[u8],
    files: &[(&str, &[u8], &[u8])],
) -> FileSet {
    FileSet {
        files: files
            .iter()
            .map(|(name, start, end)| backup_file(name, start, end))
            .collect(),
        rewrite_rules: RewriteRules {
            data: vec![RewriteRule {
                old_key_prefix: old_prefix.to_vec(),
                new_key_prefix: new_prefix.to_vec(),
                ..Default::default()
            }],
            time_range: None,
        },
    }
}

pub(crate) fn node(id: u64) -> Node {
    Node {
        id,
        address: format!("node-{id}:20160"),
        state: NodeState::Up,
    }
}

/// An importer over nodes 1 and 2 with two tokens per node and no hooks.
pub(crate) fn importer_with(
    kv_mode: KvMode,
    rewrite_mode: RewriteMode,
    cipher: Option<CipherInfo>,
    locator: Arc<MockLocator>,
    transfer: Arc<MockTransferClient>,
) -> SnapImporter {
    SnapImporter::new(
        ApiVersion::V1,
        kv_mode,
        ImporterOptions {
            cipher,
            locator,
            transfer,
            backend: StorageBackend::default(),
            rewrite_mode,
            nodes: vec![node(1), node(2)],
            concurrency_per_node: 2,
            create_hooks: Vec::new(),
            before_ingest_hooks: Vec::new(),
            close_hooks: Vec::new(),
        },
    )
    .expect("valid importer options")
}

/// Locator returning scripted scan pages and key resolutions, front to
/// back.
#[derive(Default)]
pub(crate) struct MockLocator {
    pub(crate) scan_pages: Mutex<VecDeque<Vec<ShardInfo>>>,
    pub(crate) resolutions: Mutex<VecDeque<Option<ShardInfo>>>,
    pub(crate) scan_calls: AtomicUsize,
    pub(crate) resolve_calls: AtomicUsize,
}

#[async_trait]
impl ShardLocator for MockLocator {
    async fn scan_shards(
        &self,
        _start: &[u8],
        _end: &[u8],
        _limit: usize,
    ) -> Result<Vec<ShardInfo>, ImportError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.scan_pages.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn resolve_shard_by_key(
        &self,
        _key: &[u8],
    ) -> Result<Option<ShardInfo>, ImportError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.resolutions.lock().unwrap().pop_front().unwrap_or(None))
    }
}

/// Transfer client with scripted failures/outcomes and full call logs.
///
/// Downloads echo the requested range back unless an override for the node
/// or a scripted failure is present; ingests consume the script front to
/// back and succeed once it runs dry.
#[derive(Default)]
pub(crate) struct MockTransferClient {
    pub(crate) download_log: Mutex<Vec<(u64, DownloadRequest)>>,
    pub(crate) download_overrides: Mutex<HashMap<u64, DownloadResponse>>,
    /// Fail ciphered downloads with the legacy-encryption corruption
    /// signature.
    pub(crate) fail_ciphered_downloads: AtomicBool,
    pub(crate) download_calls: AtomicUsize,

    pub(crate) ingest_log: Mutex<Vec<(u64, MultiIngestRequest)>>,
    pub(crate) ingest_script: Mutex<VecDeque<IngestResponse>>,
    pub(crate) ingest_calls: AtomicUsize,

    pub(crate) support_checks: Mutex<Vec<Vec<u64>>>,
    pub(crate) speed_limits: Mutex<Vec<(u64, u64)>>,
    pub(crate) closed: AtomicBool,
}

#[async_trait]
impl TransferClient for MockTransferClient {
    async fn download_sst(
        &self,
        node_id: u64,
        req: &DownloadRequest,
    ) -> Result<DownloadResponse, ImportError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.download_log.lock().unwrap().push((node_id, req.clone()));
        if self.fail_ciphered_downloads.load(Ordering::SeqCst) && req.cipher.is_some() {
            return Err(ImportError::Transfer {
                node_id,
                message: "Engine Engine(..): Corruption: Bad table magic number".into(),
            });
        }
        if let Some(response) = self.download_overrides.lock().unwrap().get(&node_id) {
            return Ok(response.clone());
        }
        Ok(DownloadResponse {
            range: req.sst.range.clone(),
            is_empty: false,
            crc32: 0,
        })
    }

    async fn multi_ingest(
        &self,
        node_id: u64,
        req: &MultiIngestRequest,
    ) -> Result<IngestResponse, ImportError> {
        self.ingest_calls.fetch_add(1, Ordering::SeqCst);
        self.ingest_log.lock().unwrap().push((node_id, req.clone()));
        Ok(self.ingest_script.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn check_multi_ingest_support(&self, node_ids: &[u64]) -> Result<(), ImportError> {
        self.support_checks.lock().unwrap().push(node_ids.to_vec());
        Ok(())
    }

    async fn set_download_speed_limit(&self, node_id: u64, rate: u64) -> Result<(), ImportError> {
        self.speed_limits.lock().unwrap().push((node_id, rate));
        Ok(())
    }

    async fn close(&self) -> Result<(), ImportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
