//! Download paths: transfer-descriptor construction and the per-peer
//! fan-out that places backup data onto every replica of a shard.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::try_join_all;
use tokio_retry2::Retry;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::ImportError;
use crate::importer::SnapImporter;
use crate::retry;
use crate::rewrite::{self, RewriteRule, RewriteRules};
use crate::transfer::{DownloadRequest, DownloadRequestType, DownloadResponse};
use crate::types::{
    ApiVersion, BackupFile, CipherInfo, FileSet, KeyRange, KvMode, RewriteMode, Shard, ShardInfo,
    SstMeta, CF_DEFAULT, CF_WRITE,
};

/// Suffix appended to the new key prefix to bound a descriptor from above.
/// Long enough to cover every key under the prefix; an increment-based
/// bound would trip prefix validation on some storage-node versions.
const RANGE_END_SUFFIX: [u8; 10] = [0xff; 10];

/// Builds the transfer descriptor for one file clipped to one shard.
///
/// Panics if clipping inverts the range: that signals broken rewrite or
/// shard-boundary arithmetic, which no retry can repair.
pub(crate) fn sst_meta_from_file(
    file: &BackupFile,
    shard: &Shard,
    rule: &RewriteRule,
    rewrite_mode: RewriteMode,
    api_version: ApiVersion,
) -> Result<SstMeta, ImportError> {
    // Keyspace-aware nodes compare plain boundaries, so the shard's own
    // encoded ones are decoded first.
    let (shard_start, shard_end) = if rewrite_mode == RewriteMode::Keyspace {
        let start = if shard.start_key.is_empty() {
            Vec::new()
        } else {
            codec::decode_bytes(&shard.start_key)?
        };
        let end = if shard.end_key.is_empty() {
            Vec::new()
        } else {
            codec::decode_bytes(&shard.end_key)?
        };
        (start, end)
    } else {
        (shard.start_key.clone(), shard.end_key.clone())
    };

    // The file name is more reliable than the recorded column family tag.
    let cf_name = if file.name.contains(CF_DEFAULT) {
        CF_DEFAULT
    } else if file.name.contains(CF_WRITE) {
        CF_WRITE
    } else {
        file.cf.as_str()
    };

    // range_start = max(rule.new_key_prefix, shard_start)
    let mut range_start = rule.new_key_prefix.clone();
    if range_start.as_slice() < shard_start.as_slice() {
        range_start = shard_start;
    }

    // range_end = min(rule.new_key_prefix + suffix, shard_end)
    let mut range_end = [rule.new_key_prefix.as_slice(), &RANGE_END_SUFFIX[..]].concat();
    if !shard_end.is_empty() && range_end.as_slice() > shard_end.as_slice() {
        range_end = shard_end;
    }

    if range_start > range_end {
        panic!(
            "sst range start exceeds range end, file {}, start {:?}, end {:?}",
            file.name, range_start, range_end
        );
    }

    Ok(SstMeta {
        uuid: Uuid::new_v4(),
        cf_name: cf_name.to_string(),
        range: KeyRange {
            start: range_start,
            end: range_end,
        },
        length: file.size,
        shard_id: shard.id,
        shard_epoch: shard.epoch,
        cipher_iv: file.cipher_iv.clone(),
        api_version,
        end_key_exclusive: false,
    })
}

/// Known corruption signature of a legacy-encryption mismatch; retrying the
/// download once with ciphering disabled recovers it.
fn is_decrypt_sst_err(err: &ImportError) -> bool {
    let text = err.to_string();
    text.contains("Engine Engine") && text.contains("Corruption: Bad table magic number")
}

impl SnapImporter {
    /// Downloads every relevant file onto `shard_info`'s peers and returns
    /// one descriptor per file that produced data, wrapped in the
    /// download-specific backoff.
    pub(crate) async fn download(
        &self,
        shard_info: &ShardInfo,
        file_sets: &[FileSet],
    ) -> Result<Vec<SstMeta>, ImportError> {
        Retry::spawn(retry::download_backoff(), || async move {
            let result = match self.kv_mode {
                // Txn files go down the raw path: there is no table id to
                // decode their keys with.
                KvMode::Raw | KvMode::Txn => {
                    self.download_raw_kv_sst(shard_info, file_sets, self.cipher.as_ref())
                        .await
                }
                KvMode::Table => {
                    self.download_sst(shard_info, file_sets, self.cipher.as_ref())
                        .await
                }
            };
            let result = match result {
                Err(err) if is_decrypt_sst_err(&err) => {
                    info!("failed to decrypt the downloaded file, trying again without the cipher");
                    match self.kv_mode {
                        KvMode::Raw | KvMode::Txn => {
                            self.download_raw_kv_sst(shard_info, file_sets, None).await
                        }
                        KvMode::Table => self.download_sst(shard_info, file_sets, None).await,
                    }
                }
                other => other,
            };
            match result {
                Ok(metas) => Ok(metas),
                Err(err) => {
                    warn!(shard = shard_info.shard.id, error = %err, "download failed, retry later");
                    retry::classify(err)
                }
            }
        })
        .await
    }

    /// Builds one download request for `file` against the shard, or `None`
    /// when the file is skipped: no rewrite rule matches it, or its
    /// rewritten range does not overlap the shard at all.
    fn build_download_request(
        &self,
        file: &BackupFile,
        rules: &RewriteRules,
        shard_info: &ShardInfo,
        cipher: Option<&CipherInfo>,
    ) -> Result<Option<(DownloadRequest, SstMeta)>, ImportError> {
        let Some(file_rule) = rewrite::find_matching_rule(file, rules) else {
            warn!(
                file = %file.name,
                shard = shard_info.shard.id,
                "download skipped, no rewrite rule matches the file"
            );
            return Ok(None);
        };

        let shard = &shard_info.shard;
        let encoded_start = rewrite::rewrite_and_encode_key(&file.start_key, file_rule);
        if !shard.end_key.is_empty() && encoded_start.as_slice() >= shard.end_key.as_slice() {
            return Ok(None);
        }
        let encoded_end = rewrite::rewrite_and_encode_key(&file.end_key, file_rule);
        if encoded_end.as_slice() <= shard.start_key.as_slice() {
            return Ok(None);
        }

        let mut rule = file_rule.clone();
        rewrite::apply_time_range_filter(rules, &mut rule, &file.cf);
        // Legacy nodes rewrite encoded keys in place and need the prefixes
        // pre-encoded; keyspace-aware nodes expect them plain.
        if self.rewrite_mode == RewriteMode::Legacy {
            rule.old_key_prefix = codec::encode_key_prefix(&rule.old_key_prefix);
            rule.new_key_prefix = codec::encode_key_prefix(&rule.new_key_prefix);
        }

        let sst = sst_meta_from_file(file, shard, &rule, self.rewrite_mode, self.api_version)?;
        debug!(
            file = %file.name,
            shard = shard.id,
            start = ?sst.range.start,
            end = ?sst.range.end,
            "built download request"
        );
        let request = DownloadRequest {
            sst: sst.clone(),
            backend: self.backend.clone(),
            name: file.name.clone(),
            rewrite_rule: rule,
            is_raw_kv: false,
            cipher: cipher.cloned(),
            storage_cache_id: self.cache_key.clone(),
            request_type: DownloadRequestType::Keyspace,
        };
        Ok(Some((request, sst)))
    }

    /// Default-mode download: every peer of the shard receives every
    /// overlapping file, so each replica holds the data once it becomes
    /// leader. Concurrency per destination node is token-gated; requests
    /// for one peer run sequentially.
    async fn download_sst(
        &self,
        shard_info: &ShardInfo,
        file_sets: &[FileSet],
        cipher: Option<&CipherInfo>,
    ) -> Result<Vec<SstMeta>, ImportError> {
        let mut requests: Vec<DownloadRequest> = Vec::new();
        let mut metas_by_file: HashMap<String, SstMeta> = HashMap::new();
        for set in file_sets {
            for file in &set.files {
                if let Some((request, sst)) =
                    self.build_download_request(file, &set.rewrite_rules, shard_info, cipher)?
                {
                    metas_by_file.insert(file.name.clone(), sst);
                    requests.push(request);
                }
            }
        }

        let results: Mutex<HashMap<String, SstMeta>> = Mutex::new(HashMap::new());
        let shard = &shard_info.shard;
        let requests_ref = &requests;
        let metas_ref = &metas_by_file;
        let results_ref = &results;
        try_join_all(shard.peers.iter().map(|peer| async move {
            let _token = self.download_tokens.acquire(peer.node_id).await;
            for request in requests_ref {
                let response = Retry::spawn(retry::download_backoff(), || async move {
                    match self.transfer.download_sst(peer.node_id, request).await {
                        Ok(response) => Ok(response),
                        Err(err) => retry::classify(err),
                    }
                })
                .await?;
                if response.is_empty {
                    warn!(
                        file = %request.name,
                        shard = shard.id,
                        "download returned an empty range, skipping the file"
                    );
                    continue;
                }
                let Some(mut sst) = metas_ref.get(&request.name).cloned() else {
                    return Err(ImportError::DownloadFailed(format!(
                        "no pending descriptor for file {}",
                        request.name
                    )));
                };
                sst.range = KeyRange {
                    start: codec::truncate_ts(&response.range.start),
                    end: codec::truncate_ts(&response.range.end),
                };
                debug!(
                    file = %request.name,
                    peer = peer.id,
                    node = peer.node_id,
                    crc32 = response.crc32,
                    "downloaded file onto peer"
                );
                results_ref.lock().unwrap().insert(request.name.clone(), sst);
            }
            Ok::<(), ImportError>(())
        }))
        .await?;

        Ok(results.into_inner().unwrap().into_values().collect())
    }

    /// Raw-mode download: descriptors are clipped to the configured raw
    /// bounds, and every peer is asked concurrently without token gating at
    /// this level. Whichever successful non-empty response lands last
    /// supplies the final range; replicas hold identical bytes.
    async fn download_raw_kv_sst(
        &self,
        shard_info: &ShardInfo,
        file_sets: &[FileSet],
        cipher: Option<&CipherInfo>,
    ) -> Result<Vec<SstMeta>, ImportError> {
        let shard = &shard_info.shard;
        let mut download_metas = Vec::new();
        for set in file_sets {
            for file in &set.files {
                // Raw keys move verbatim: the trivial rule.
                let rule = RewriteRule::default();
                let mut sst =
                    sst_meta_from_file(file, shard, &rule, RewriteMode::Legacy, self.api_version)?;

                // Clip the descriptor to the restorable bounds.
                if self.raw_start_key.as_slice() > sst.range.start.as_slice() {
                    sst.range.start = self.raw_start_key.clone();
                }
                if !self.raw_end_key.is_empty()
                    && (sst.range.end.is_empty()
                        || self.raw_end_key.as_slice() <= sst.range.end.as_slice())
                {
                    sst.range.end = self.raw_end_key.clone();
                    sst.end_key_exclusive = true;
                }
                if sst.range.start > sst.range.end {
                    warn!(
                        file = %file.name,
                        shard = shard.id,
                        "download skipped, the file clips to an empty range"
                    );
                    continue;
                }

                let request = DownloadRequest {
                    sst: sst.clone(),
                    backend: self.backend.clone(),
                    name: file.name.clone(),
                    rewrite_rule: rule,
                    is_raw_kv: true,
                    cipher: cipher.cloned(),
                    storage_cache_id: self.cache_key.clone(),
                    request_type: DownloadRequestType::Legacy,
                };

                let winning: Mutex<Option<DownloadResponse>> = Mutex::new(None);
                let request_ref = &request;
                let winning_ref = &winning;
                try_join_all(shard.peers.iter().map(|peer| async move {
                    let response = self.transfer.download_sst(peer.node_id, request_ref).await?;
                    if response.is_empty {
                        warn!(
                            file = %request_ref.name,
                            shard = shard.id,
                            node = peer.node_id,
                            "peer reported an empty range for the file"
                        );
                        return Ok(());
                    }
                    *winning_ref.lock().unwrap() = Some(response);
                    Ok::<(), ImportError>(())
                }))
                .await?;

                let Some(response) = winning.into_inner().unwrap() else {
                    continue;
                };
                sst.range.start = response.range.start;
                sst.range.end = response.range.end;
                download_metas.push(sst);
            }
        }
        Ok(download_metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        backup_file, file_set, importer_with, shard_info, MockLocator, MockTransferClient,
    };
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn shard(start: &[u8], end: &[u8]) -> Shard {
        Shard {
            id: 5,
            epoch: 2,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            peers: Vec::new(),
        }
    }

    fn rule(new_prefix: &[u8]) -> RewriteRule {
        RewriteRule {
            old_key_prefix: b"t1".to_vec(),
            new_key_prefix: new_prefix.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn descriptor_is_bounded_by_prefix_and_shard() {
        let meta = sst_meta_from_file(
            &backup_file("a_default.sst", b"t1a", b"t1z"),
            &shard(b"", b""),
            &rule(b"t9"),
            RewriteMode::Legacy,
            ApiVersion::V1,
        )
        .unwrap();
        assert_eq!(meta.cf_name, CF_DEFAULT);
        assert_eq!(meta.range.start, b"t9");
        let mut expected_end = b"t9".to_vec();
        expected_end.extend_from_slice(&[0xff; 10]);
        assert_eq!(meta.range.end, expected_end);
        assert_eq!((meta.shard_id, meta.shard_epoch), (5, 2));

        // A shard that ends inside the prefix cover clips the end.
        let meta = sst_meta_from_file(
            &backup_file("a_default.sst", b"t1a", b"t1z"),
            &shard(b"t9b", b"t9x"),
            &rule(b"t9"),
            RewriteMode::Legacy,
            ApiVersion::V1,
        )
        .unwrap();
        assert_eq!(meta.range.start, b"t9b");
        assert_eq!(meta.range.end, b"t9x");
    }

    #[test]
    fn keyspace_mode_decodes_shard_bounds_before_clipping() {
        let meta = sst_meta_from_file(
            &backup_file("a_default.sst", b"t1a", b"t1z"),
            &shard(
                &codec::encode_bytes(b"t9a"),
                &codec::encode_bytes(b"t9x"),
            ),
            &rule(b"t9"),
            RewriteMode::Keyspace,
            ApiVersion::V1,
        )
        .unwrap();
        assert_eq!(meta.range.start, b"t9a");
        assert_eq!(meta.range.end, b"t9x");
    }

    #[test]
    fn column_family_comes_from_the_file_name_first() {
        let meta = |name: &str, cf: &str| {
            let mut file = backup_file(name, b"t1a", b"t1z");
            file.cf = cf.to_string();
            sst_meta_from_file(&file, &shard(b"", b""), &rule(b"t9"), RewriteMode::Legacy, ApiVersion::V1)
                .unwrap()
                .cf_name
        };
        assert_eq!(meta("1_default.sst", "write"), CF_DEFAULT);
        assert_eq!(meta("1_write.sst", "default"), CF_WRITE);
        assert_eq!(meta("1.sst", "lock"), "lock");
    }

    #[test]
    #[should_panic(expected = "range start exceeds range end")]
    fn inverted_descriptor_range_is_fatal() {
        let _ = sst_meta_from_file(
            &backup_file("a_default.sst", b"t1a", b"t1z"),
            &shard(b"u", b"v"),
            &rule(b"t9"),
            RewriteMode::Legacy,
            ApiVersion::V1,
        );
    }

    #[tokio::test]
    async fn files_outside_the_shard_are_not_requested() {
        let locator = Arc::new(MockLocator::default());
        let transfer = Arc::new(MockTransferClient::default());
        let importer = importer_with(
            KvMode::Table,
            RewriteMode::Legacy,
            None,
            locator,
            Arc::clone(&transfer),
        );

        // Shard ends before the rewritten file range starts.
        let info = shard_info(1, 1, b"", &codec::encode_bytes(b"t5"), &[1]);
        let metas = importer
            .download(&info, &[file_set(b"t1", b"t9", &[("f_default.sst", b"t1a", b"t1z")])])
            .await
            .unwrap();
        assert!(metas.is_empty());
        assert_eq!(transfer.download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_download_responses_are_skipped_not_failed() {
        let locator = Arc::new(MockLocator::default());
        let transfer = Arc::new(MockTransferClient::default());
        transfer.download_overrides.lock().unwrap().insert(
            1,
            DownloadResponse {
                is_empty: true,
                ..Default::default()
            },
        );
        let importer = importer_with(
            KvMode::Table,
            RewriteMode::Legacy,
            None,
            locator,
            Arc::clone(&transfer),
        );

        let info = shard_info(1, 1, b"", b"", &[1]);
        let metas = importer
            .download(&info, &[file_set(b"t1", b"t9", &[("f_default.sst", b"t1a", b"t1z")])])
            .await
            .unwrap();
        assert!(metas.is_empty());
        assert_eq!(transfer.download_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn raw_merge_keeps_one_complete_response() {
        let locator = Arc::new(MockLocator::default());
        let transfer = Arc::new(MockTransferClient::default());
        // Two replicas disagree; the result must be one of their responses,
        // never a mix.
        transfer.download_overrides.lock().unwrap().insert(
            1,
            DownloadResponse {
                range: KeyRange {
                    start: b"k1".to_vec(),
                    end: b"k5".to_vec(),
                },
                ..Default::default()
            },
        );
        transfer.download_overrides.lock().unwrap().insert(
            2,
            DownloadResponse {
                range: KeyRange {
                    start: b"k1".to_vec(),
                    end: b"k7".to_vec(),
                },
                ..Default::default()
            },
        );
        let importer = importer_with(
            KvMode::Raw,
            RewriteMode::Legacy,
            None,
            locator,
            Arc::clone(&transfer),
        );

        let info = shard_info(1, 1, b"", b"", &[1, 2]);
        let metas = importer
            .download(&info, &[file_set(b"", b"", &[("f.sst", b"k0", b"k9")])])
            .await
            .unwrap();
        assert_eq!(metas.len(), 1);
        let range = (&metas[0].range.start[..], &metas[0].range.end[..]);
        assert!(
            range == (&b"k1"[..], &b"k5"[..]) || range == (&b"k1"[..], &b"k7"[..]),
            "torn merge: {range:?}"
        );
        assert_eq!(transfer.download_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_failures_fall_back_to_plaintext_download() {
        let locator = Arc::new(MockLocator::default());
        let transfer = Arc::new(MockTransferClient::default());
        // Every ciphered download hits the corruption signature; only the
        // plaintext fallback can succeed.
        transfer.fail_ciphered_downloads.store(true, Ordering::SeqCst);
        let importer = importer_with(
            KvMode::Table,
            RewriteMode::Legacy,
            Some(CipherInfo {
                cipher_type: "aes256-ctr".into(),
                cipher_key: vec![7; 32],
            }),
            locator,
            Arc::clone(&transfer),
        );

        let info = shard_info(1, 1, b"", b"", &[1]);
        let metas = importer
            .download(&info, &[file_set(b"t1", b"t9", &[("f_default.sst", b"t1a", b"t1z")])])
            .await
            .unwrap();
        assert_eq!(metas.len(), 1);

        let log = transfer.download_log.lock().unwrap();
        assert!(log.len() >= 2);
        assert!(log[0].1.cipher.is_some());
        assert!(log.last().unwrap().1.cipher.is_none());
    }
}
