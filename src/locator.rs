//! Shard placement lookup boundary.

use async_trait::async_trait;
use tracing::debug;

use crate::error::ImportError;
use crate::types::ShardInfo;

/// Shards fetched per scan page.
pub const SCAN_SHARD_PAGE_LIMIT: usize = 128;

/// Placement-service surface the importer resolves shard layouts through.
///
/// Returned descriptors are point-in-time snapshots; a leader election or a
/// split can make them stale at any moment after the call returns.
#[async_trait]
pub trait ShardLocator: Send + Sync {
    /// Returns shards overlapping `[start, end)` in ascending key order, at
    /// most `limit` of them. An empty `end` means "unbounded above".
    async fn scan_shards(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<ShardInfo>, ImportError>;

    /// Point lookup of the shard currently containing `key`.
    async fn resolve_shard_by_key(&self, key: &[u8])
        -> Result<Option<ShardInfo>, ImportError>;
}

/// Scans all shards covering `[start, end)`, following pagination until the
/// range is exhausted; a single page may not cover the whole remainder.
pub(crate) async fn paginate_scan_shards(
    locator: &dyn ShardLocator,
    start: &[u8],
    end: &[u8],
    limit: usize,
) -> Result<Vec<ShardInfo>, ImportError> {
    let mut shards: Vec<ShardInfo> = Vec::new();
    let mut cursor = start.to_vec();
    loop {
        let page = locator.scan_shards(&cursor, end, limit).await?;
        if page.is_empty() {
            // A hole in the layout; likely a split in flight. The caller's
            // range-level retry rescans from scratch.
            return Err(ImportError::ShardScan(format!(
                "no shard covers the range from cursor {cursor:?}"
            )));
        }
        let page_len = page.len();
        let last_end = page
            .last()
            .map(|info| info.shard.end_key.clone())
            .unwrap_or_default();
        debug!(count = page_len, "scanned one shard page");
        shards.extend(page);
        if page_len < limit || last_end.is_empty() {
            break;
        }
        if !end.is_empty() && last_end.as_slice() >= end {
            break;
        }
        cursor = last_end;
    }
    Ok(shards)
}

/// A re-resolved shard may only stand in for the original when its
/// generation fence is unchanged.
pub(crate) fn check_shard_epoch(new: &ShardInfo, old: &ShardInfo) -> bool {
    new.shard.id == old.shard.id && new.shard.epoch == old.shard.epoch
}
