//! Memcomparable byte-key encoding.
//!
//! Transactional keys are stored in the group-of-8 padded form: each group
//! of eight key bytes is followed by a marker recording how many padding
//! bytes the group carries. Encoded keys compare bytewise in the same order
//! as the raw keys they encode.

use crate::error::ImportError;

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xff;
const ENC_PADDING: u8 = 0x00;

/// Length of the commit-timestamp suffix on versioned data keys.
const TS_LEN: usize = 8;

/// Encodes `key` into its memcomparable form.
pub fn encode_bytes(key: &[u8]) -> Vec<u8> {
    let groups = key.len() / ENC_GROUP_SIZE + 1;
    let mut out = Vec::with_capacity(groups * (ENC_GROUP_SIZE + 1));
    for chunk in key.chunks(ENC_GROUP_SIZE) {
        let pad = ENC_GROUP_SIZE - chunk.len();
        out.extend_from_slice(chunk);
        out.extend(std::iter::repeat(ENC_PADDING).take(pad));
        out.push(ENC_MARKER - pad as u8);
    }
    // A key that fills its groups exactly still needs a terminating
    // all-padding group, or it would compare equal to its own prefix.
    if key.len() % ENC_GROUP_SIZE == 0 {
        out.extend(std::iter::repeat(ENC_PADDING).take(ENC_GROUP_SIZE));
        out.push(ENC_MARKER - ENC_GROUP_SIZE as u8);
    }
    out
}

/// Decodes a memcomparable-encoded key back to its raw bytes.
pub fn decode_bytes(data: &[u8]) -> Result<Vec<u8>, ImportError> {
    let mut key = Vec::with_capacity(data.len() / (ENC_GROUP_SIZE + 1) * ENC_GROUP_SIZE);
    let mut offset = 0;
    loop {
        let group = data
            .get(offset..offset + ENC_GROUP_SIZE + 1)
            .ok_or_else(|| {
                ImportError::Codec(format!(
                    "insufficient bytes to decode key group at offset {offset} (len {})",
                    data.len()
                ))
            })?;
        let marker = group[ENC_GROUP_SIZE];
        let pad = ENC_MARKER.wrapping_sub(marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(ImportError::Codec(format!(
                "invalid group marker {marker:#x} at offset {offset}"
            )));
        }
        let real = ENC_GROUP_SIZE - pad;
        key.extend_from_slice(&group[..real]);
        if group[real..ENC_GROUP_SIZE].iter().any(|&b| b != ENC_PADDING) {
            return Err(ImportError::Codec(format!(
                "non-zero padding in key group at offset {offset}"
            )));
        }
        offset += ENC_GROUP_SIZE + 1;
        if pad != 0 {
            return Ok(key);
        }
    }
}

/// Encodes a key prefix so that it remains a byte prefix of any fully
/// encoded key it prefixes: complete groups are encoded, the ragged tail
/// is appended raw without a terminating group.
pub fn encode_key_prefix(prefix: &[u8]) -> Vec<u8> {
    let grouped = prefix.len() - prefix.len() % ENC_GROUP_SIZE;
    let mut out = encode_bytes(&prefix[..grouped]);
    out.truncate(out.len() - (ENC_GROUP_SIZE + 1));
    out.extend_from_slice(&prefix[grouped..]);
    out
}

/// Strips the commit-timestamp suffix off a versioned data key. Keys too
/// short to carry one are returned unchanged.
pub fn truncate_ts(key: &[u8]) -> Vec<u8> {
    if key.len() < TS_LEN {
        return key.to_vec();
    }
    key[..key.len() - TS_LEN].to_vec()
}
