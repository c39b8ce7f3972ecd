//! Store key construction.
//!
//! A clustered store routes every key to one of 16384 hash slots. When a key
//! contains a non-empty `{...}` section only that section is hashed, so keys
//! sharing a hashtag live on the same node and can be touched by a single
//! atomic script. The auxiliary ERL keys are derived from the bucket key with
//! [`replicate_hashtag`] so they always share its slot.

pub const HASH_SLOTS: u16 = 16384;

/// `{type}:{key}`, the logical bucket key before the store prefix is applied.
pub fn bucket_key(bucket_type: &str, key: &str) -> String {
    format!("{bucket_type}:{key}")
}

/// Strips one pair of outer braces when the key both starts with `{` and ends
/// with `}`. Used for exact override lookups.
pub fn remove_hashtag(key: &str) -> &str {
    if key.len() >= 2 && key.starts_with('{') && key.ends_with('}') {
        &key[1..key.len() - 1]
    } else {
        key
    }
}

/// The section of `key` the cluster hashes, if any.
///
/// Follows the cluster rule: the first `{`, then the first `}` after it, and
/// the content between them must be non-empty.
pub fn hashtag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let rest = &key[open + 1..];
    let close = rest.find('}')?;
    if close == 0 {
        None
    } else {
        Some(&rest[..close])
    }
}

/// Builds an auxiliary key that lands in the same slot as `prefix + base_key`.
///
/// If `base_key` already carries a hashtag it is reused, otherwise the whole
/// prefixed key becomes the hashtag.
pub fn replicate_hashtag(base_key: &str, prefix: &str, aux_name: &str) -> String {
    match hashtag(base_key) {
        Some(tag) => format!("{aux_name}:{{{tag}}}"),
        None => format!("{aux_name}:{{{prefix}{base_key}}}"),
    }
}

/// CRC16 (XMODEM) slot of a key, honouring hashtags.
pub fn hash_slot(key: &str) -> u16 {
    let hashed = hashtag(key).unwrap_or(key);
    crc16(hashed.as_bytes()) % HASH_SLOTS
}

fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in bytes {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}
