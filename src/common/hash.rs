//! Hashing utilities for beanproxy
//!
//! - BLAKE3 for key → bucket partitioning
//! - CRC32 for value content hashes reported in metadata lines

use std::collections::BTreeMap;

/// Compute the bucket for a key
///
/// Stable across calls and restarts for a fixed `numbucket`.
pub fn bucket_of(key: &str, numbucket: usize) -> usize {
    let hash = blake3::hash(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[0..8]);
    (u64::from_le_bytes(head) % numbucket.max(1) as u64) as usize
}

/// Group keys by bucket, preserving the caller's order inside each group
pub fn divide_keys_by_bucket(keys: &[String], numbucket: usize) -> BTreeMap<usize, Vec<String>> {
    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for key in keys {
        groups
            .entry(bucket_of(key, numbucket))
            .or_default()
            .push(key.clone());
    }
    groups
}

/// Content hash of a value, as shown in metadata lines
pub fn content_hash(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
