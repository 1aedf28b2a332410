//! Rewrite rules: mapping backup-time key prefixes into the destination
//! cluster's current key space.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::types::{BackupFile, KvMode, CF_WRITE};

/// A mapping from one backup-time key prefix to the corresponding prefix in
/// the destination cluster, with an optional commit-timestamp window the
/// storage node filters entries through (0 disables a bound).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub old_key_prefix: Vec<u8>,
    pub new_key_prefix: Vec<u8>,
    #[serde(default)]
    pub ignore_before_ts: u64,
    #[serde(default)]
    pub ignore_after_ts: u64,
}

/// Commit-timestamp window restored data must fall into.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ts: u64,
    /// Start bound for the write column family, shifted back so that
    /// transactions straddling the backup start survive.
    pub shift_start_ts: u64,
    pub restored_ts: u64,
}

/// The rewrite-rule set attached to one file set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteRules {
    pub data: Vec<RewriteRule>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

/// Finds the rule whose old prefix matches both boundary keys of `file`.
/// Files matching no rule are skipped by every caller, never failed.
pub fn find_matching_rule<'a>(
    file: &BackupFile,
    rules: &'a RewriteRules,
) -> Option<&'a RewriteRule> {
    rules.data.iter().find(|rule| {
        file.start_key.starts_with(&rule.old_key_prefix)
            && file.end_key.starts_with(&rule.old_key_prefix)
    })
}

/// Replaces the rule's old prefix on `key` with the new prefix. Keys that
/// do not carry the old prefix come back unchanged.
pub fn rewrite_raw_key(key: &[u8], rule: &RewriteRule) -> Vec<u8> {
    match key.strip_prefix(rule.old_key_prefix.as_slice()) {
        Some(suffix) => {
            let mut out = Vec::with_capacity(rule.new_key_prefix.len() + suffix.len());
            out.extend_from_slice(&rule.new_key_prefix);
            out.extend_from_slice(suffix);
            out
        }
        None => key.to_vec(),
    }
}

/// Rewrites `key` and applies the memcomparable encoding, producing a key
/// comparable against shard boundaries.
pub fn rewrite_and_encode_key(key: &[u8], rule: &RewriteRule) -> Vec<u8> {
    codec::encode_bytes(&rewrite_raw_key(key, rule))
}

/// Copies the file set's time window onto a matched rule. The write column
/// family takes the shifted start bound; every other family takes the plain
/// one.
pub fn apply_time_range_filter(rules: &RewriteRules, rule: &mut RewriteRule, cf: &str) {
    if let Some(time_range) = rules.time_range {
        rule.ignore_before_ts = if cf == CF_WRITE {
            time_range.shift_start_ts
        } else {
            time_range.start_ts
        };
        rule.ignore_after_ts = time_range.restored_ts;
    }
}

/// Computes a file's effective scan range for the given key-value mode:
/// raw mode takes the literal bytes, txn mode byte-encodes them, table
/// mode rewrites and encodes through the matching rule. Returns `None`
/// when table mode finds no matching rule.
pub fn file_range_by_mode(
    mode: KvMode,
    file: &BackupFile,
    rules: &RewriteRules,
) -> Option<(Vec<u8>, Vec<u8>)> {
    match mode {
        KvMode::Raw => Some((file.start_key.clone(), file.end_key.clone())),
        KvMode::Txn => {
            let start = if file.start_key.is_empty() {
                Vec::new()
            } else {
                codec::encode_bytes(&file.start_key)
            };
            let end = if file.end_key.is_empty() {
                Vec::new()
            } else {
                codec::encode_bytes(&file.end_key)
            };
            Some((start, end))
        }
        KvMode::Table => {
            let rule = find_matching_rule(file, rules)?;
            Some((
                rewrite_and_encode_key(&file.start_key, rule),
                rewrite_and_encode_key(&file.end_key, rule),
            ))
        }
    }
}
