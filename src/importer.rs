//! The importer core: orchestration, ingest and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_retry2::Retry;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::ImportError;
use crate::locator::{check_shard_epoch, paginate_scan_shards, ShardLocator, SCAN_SHARD_PAGE_LIMIT};
use crate::retry;
use crate::rewrite;
use crate::summary::{ImportSummary, SummarySnapshot};
use crate::throttle::NodeTokenMap;
use crate::transfer::{
    IngestErrorPayload, IngestResponse, MultiIngestRequest, ShardContext, TransferClient,
};
use crate::types::{
    ApiVersion, CipherInfo, FileSet, KvMode, Node, NodeState, RewriteMode, ShardInfo, SstMeta,
    StorageBackend,
};

/// Runs right after construction, before any import starts.
pub type CreateHook = Box<dyn Fn(&mut SnapImporter) -> Result<(), ImportError> + Send + Sync>;

/// Runs at the start of every `import` call; may hand back a deferred hook
/// executed only once the whole operation has succeeded.
pub type BeforeIngestHook =
    Box<dyn Fn(&[FileSet]) -> Result<Option<DeferredHook>, ImportError> + Send + Sync>;

/// Deferred effect that must land exactly once, after durability.
pub type DeferredHook = Box<dyn FnOnce() -> Result<(), ImportError> + Send>;

/// Runs during `close`; failures are logged, not propagated.
pub type CloseHook = Box<dyn Fn(&SnapImporter) -> Result<(), ImportError> + Send + Sync>;

/// Construction-time configuration for [`SnapImporter`].
pub struct ImporterOptions {
    pub cipher: Option<CipherInfo>,
    pub locator: Arc<dyn ShardLocator>,
    pub transfer: Arc<dyn TransferClient>,
    pub backend: StorageBackend,
    pub rewrite_mode: RewriteMode,
    /// Destination node roster; token pools are pre-built for these.
    pub nodes: Vec<Node>,
    /// Token budget per (node, resource class) pair. Must be non-zero.
    pub concurrency_per_node: usize,
    pub create_hooks: Vec<CreateHook>,
    pub before_ingest_hooks: Vec<BeforeIngestHook>,
    pub close_hooks: Vec<CloseHook>,
}

/// Imports backed-up SST files into the live cluster.
///
/// The importer translates backup-time key ranges into the cluster's
/// current shard layout, downloads each file onto every replica of each
/// covering shard, and ingests the downloaded data on the shard leader.
/// Delivery is idempotent and at-least-once: a retried pass re-downloads
/// and re-ingests, and storage nodes deduplicate by range.
pub struct SnapImporter {
    pub(crate) cipher: Option<CipherInfo>,
    pub(crate) api_version: ApiVersion,

    pub(crate) locator: Arc<dyn ShardLocator>,
    pub(crate) transfer: Arc<dyn TransferClient>,
    pub(crate) backend: StorageBackend,

    pub(crate) download_tokens: NodeTokenMap,
    pub(crate) ingest_tokens: NodeTokenMap,

    before_ingest_hooks: Vec<BeforeIngestHook>,
    close_hooks: Vec<CloseHook>,

    pub(crate) kv_mode: KvMode,
    pub(crate) raw_start_key: Vec<u8>,
    pub(crate) raw_end_key: Vec<u8>,
    pub(crate) rewrite_mode: RewriteMode,

    /// Run-scoped cache key: storage nodes key their blob cache on it, so
    /// retries within one restore reuse already-fetched payloads.
    pub(crate) cache_key: String,
    token_released: Arc<Notify>,

    summary: ImportSummary,
}

impl SnapImporter {
    pub fn new(
        api_version: ApiVersion,
        kv_mode: KvMode,
        options: ImporterOptions,
    ) -> Result<Self, ImportError> {
        let ImporterOptions {
            cipher,
            locator,
            transfer,
            backend,
            rewrite_mode,
            nodes,
            concurrency_per_node,
            create_hooks,
            before_ingest_hooks,
            close_hooks,
        } = options;
        if concurrency_per_node == 0 {
            return Err(ImportError::InvalidConfig(
                "concurrency_per_node must be greater than 0".into(),
            ));
        }
        let token_released = Arc::new(Notify::new());
        let node_ids: Vec<u64> = nodes.iter().map(|node| node.id).collect();
        let mut importer = SnapImporter {
            cipher,
            api_version,
            locator,
            transfer,
            backend,
            download_tokens: NodeTokenMap::new(
                node_ids.iter().copied(),
                concurrency_per_node,
                Arc::clone(&token_released),
            ),
            ingest_tokens: NodeTokenMap::new(
                node_ids.iter().copied(),
                concurrency_per_node,
                Arc::clone(&token_released),
            ),
            before_ingest_hooks,
            close_hooks,
            kv_mode,
            raw_start_key: Vec::new(),
            raw_end_key: Vec::new(),
            rewrite_mode,
            cache_key: format!("restore-{}", Uuid::new_v4().simple()),
            token_released,
            summary: ImportSummary::default(),
        };
        for hook in &create_hooks {
            hook(&mut importer)?;
        }
        Ok(importer)
    }

    /// Imports every file in `file_sets`.
    ///
    /// The scan→download→ingest pass runs as one retried unit: any failure
    /// re-enters at the shard scan, because shard boundaries may have
    /// shifted since the previous attempt. Data already ingested before a
    /// retry is not rolled back; replayed ingests are deduplicated by the
    /// storage nodes.
    pub async fn import(&self, file_sets: &[FileSet]) -> Result<(), ImportError> {
        let mut deferred: Vec<DeferredHook> = Vec::new();
        for (index, hook) in self.before_ingest_hooks.iter().enumerate() {
            match hook(file_sets) {
                Ok(Some(hook)) => deferred.push(hook),
                Ok(None) => {}
                Err(err) => {
                    return Err(ImportError::Hook {
                        index,
                        source: Box::new(err),
                    })
                }
            }
        }

        let (start_key, end_key) = self.key_range_for_files(file_sets);

        let result = Retry::spawn(retry::range_backoff(), || {
            let attempt = self.import_attempt(&start_key, &end_key, file_sets);
            async move {
                match attempt.await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        warn!(error = %err, "import pass failed, retry later");
                        retry::classify(err)
                    }
                }
            }
        })
        .await;
        if let Err(err) = result {
            error!(
                files = ?file_set_names(file_sets),
                error = %err,
                "import failed after retries, stopping this file set"
            );
            return Err(err);
        }

        for (index, hook) in deferred.into_iter().enumerate() {
            hook().map_err(|err| ImportError::Hook {
                index,
                source: Box::new(err),
            })?;
        }

        for set in file_sets {
            for file in &set.files {
                if self.kv_mode == KvMode::Table
                    && rewrite::find_matching_rule(file, &set.rewrite_rules).is_none()
                {
                    continue;
                }
                self.summary.collect_success(file.total_kvs, file.total_bytes);
            }
        }
        Ok(())
    }

    /// One full pass: scan the covering shards, then download and ingest
    /// into each of them in ascending key order.
    async fn import_attempt(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        file_sets: &[FileSet],
    ) -> Result<(), ImportError> {
        let shard_infos = paginate_scan_shards(
            self.locator.as_ref(),
            start_key,
            end_key,
            SCAN_SHARD_PAGE_LIMIT,
        )
        .await?;
        debug!(count = shard_infos.len(), "scanned shards covering the import range");

        for shard_info in &shard_infos {
            let metas = self.download(shard_info, file_sets).await.map_err(|err| {
                warn!(shard = shard_info.shard.id, error = %err, "download into shard failed");
                err
            })?;
            self.ingest(shard_info, &metas).await.map_err(|err| {
                warn!(shard = shard_info.shard.id, error = %err, "ingest into shard failed");
                err
            })?;
        }
        Ok(())
    }

    /// Minimal bounding range across every file in every set. Files with no
    /// matching rewrite rule contribute nothing.
    fn key_range_for_files(&self, file_sets: &[FileSet]) -> (Vec<u8>, Vec<u8>) {
        let mut start_key: Vec<u8> = Vec::new();
        let mut end_key: Vec<u8> = Vec::new();
        for set in file_sets {
            for file in &set.files {
                let Some((start, end)) =
                    rewrite::file_range_by_mode(self.kv_mode, file, &set.rewrite_rules)
                else {
                    debug!(file = %file.name, "no rewrite rule matches the file, leaving it out of the scan range");
                    continue;
                };
                if start_key.is_empty() || start < start_key {
                    start_key = start;
                }
                if end_key.is_empty() || end_key < end {
                    end_key = end;
                }
            }
        }
        (start_key, end_key)
    }

    /// Ingests downloaded descriptors on the shard leader, following leader
    /// movement and fencing on epoch change.
    ///
    /// `NotLeader` responses naming a leader are followed directly; ones
    /// that do not are resolved by polling the locator once a second until
    /// it answers, then checking the generation fence. Epoch and placement
    /// rejections abort the attempt: only a fresh shard scan can recover.
    pub(crate) async fn ingest(
        &self,
        shard_info: &ShardInfo,
        metas: &[SstMeta],
    ) -> Result<(), ImportError> {
        if metas.is_empty() {
            return Ok(());
        }
        let leader = shard_info
            .leader
            .ok_or(ImportError::NoLeader(shard_info.shard.id))?;
        let _token = self.ingest_tokens.acquire(leader.node_id).await;

        let mut current = shard_info.clone();
        loop {
            let response = self.ingest_ssts(metas, &current).await?;
            match response.error {
                None => return Ok(()),
                Some(IngestErrorPayload::NotLeader { leader }) => {
                    let new_info = match leader {
                        Some(leader) => ShardInfo {
                            shard: current.shard.clone(),
                            leader: Some(leader),
                        },
                        None => self.resolve_shard_blocking(&current).await?,
                    };
                    if !check_shard_epoch(&new_info, &current) {
                        return Err(ImportError::EpochNotMatch(format!(
                            "shard {} changed generation while following its leader",
                            current.shard.id
                        )));
                    }
                    debug!(
                        shard = current.shard.id,
                        new_leader = ?new_info.leader,
                        "ingest hit a moved leader, retrying against the new one"
                    );
                    current = new_info;
                }
                Some(IngestErrorPayload::EpochNotMatch) => {
                    return Err(ImportError::EpochNotMatch(format!(
                        "shard {} rejected the ingest",
                        current.shard.id
                    )));
                }
                Some(IngestErrorPayload::KeyNotInShard) => {
                    return Err(ImportError::KeyNotInShard(format!(
                        "shard {} no longer covers the batch",
                        current.shard.id
                    )));
                }
                Some(IngestErrorPayload::Other(message)) => {
                    return Err(ImportError::IngestFailed(format!(
                        "shard {}: {message}",
                        current.shard.id
                    )));
                }
            }
        }
    }

    /// Polls the locator for the shard holding `current`'s start key until
    /// it answers. No attempt bound: the loop ends when the locator has an
    /// answer or the caller drops the import.
    async fn resolve_shard_blocking(
        &self,
        current: &ShardInfo,
    ) -> Result<ShardInfo, ImportError> {
        loop {
            match self
                .locator
                .resolve_shard_by_key(&current.shard.start_key)
                .await?
            {
                Some(info) => return Ok(info),
                None => {
                    warn!(
                        shard = current.shard.id,
                        "resolving the shard by key returned nothing, polling again"
                    );
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn ingest_ssts(
        &self,
        metas: &[SstMeta],
        shard_info: &ShardInfo,
    ) -> Result<IngestResponse, ImportError> {
        let leader = shard_info
            .leader
            .ok_or(ImportError::NoLeader(shard_info.shard.id))?;
        let request = MultiIngestRequest {
            context: ShardContext {
                shard_id: shard_info.shard.id,
                shard_epoch: shard_info.shard.epoch,
                peer: leader,
            },
            ssts: metas.to_vec(),
        };
        debug!(
            shard = shard_info.shard.id,
            leader_node = leader.node_id,
            ssts = metas.len(),
            "ingesting downloaded descriptors"
        );
        self.transfer.multi_ingest(leader.node_id, &request).await
    }

    /// Sets the restorable key bounds. Only meaningful in raw mode.
    pub fn set_raw_range(&mut self, start_key: Vec<u8>, end_key: Vec<u8>) -> Result<(), ImportError> {
        if self.kv_mode != KvMode::Raw {
            return Err(ImportError::ModeMismatch(
                "file importer is not in raw kv mode".into(),
            ));
        }
        self.raw_start_key = start_key;
        self.raw_end_key = end_key;
        Ok(())
    }

    /// Caps the download bandwidth of one node, in bytes per second.
    pub async fn set_download_speed_limit(
        &self,
        node_id: u64,
        rate: u64,
    ) -> Result<(), ImportError> {
        self.transfer.set_download_speed_limit(node_id, rate).await
    }

    /// Checks that every node of the roster that is up supports batched
    /// multi-ingest.
    pub async fn check_multi_ingest_support(&self, nodes: &[Node]) -> Result<(), ImportError> {
        let node_ids: Vec<u64> = nodes
            .iter()
            .filter(|node| node.state == NodeState::Up)
            .map(|node| node.id)
            .collect();
        self.transfer.check_multi_ingest_support(&node_ids).await
    }

    /// True when every token of every pool, in both resource classes, is
    /// out on loan.
    pub fn should_block(&self) -> bool {
        self.download_tokens.should_block() || self.ingest_tokens.should_block()
    }

    /// Waits while [`SnapImporter::should_block`] holds. Every token return
    /// wakes all waiters; each waiter re-checks the predicate before
    /// returning.
    pub async fn pause_for_backpressure(&self) {
        loop {
            let released = self.token_released.notified();
            if !self.should_block() {
                return;
            }
            released.await;
        }
    }

    /// Counters accumulated by successful imports.
    pub fn summary(&self) -> SummarySnapshot {
        self.summary.snapshot()
    }

    /// Runs the close hooks, then shuts the transfer client down.
    pub async fn close(&self) -> Result<(), ImportError> {
        for hook in &self.close_hooks {
            if let Err(err) = hook(self) {
                warn!(error = %err, "close hook failed");
            }
        }
        self.transfer.close().await
    }
}

fn file_set_names(file_sets: &[FileSet]) -> Vec<&str> {
    file_sets
        .iter()
        .flat_map(|set| set.files.iter().map(|file| file.name.as_str()))
        .collect()
}
