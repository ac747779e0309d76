//! In-memory record store
//!
//! Each key maps to its latest record. Records are laid out as if appended to
//! a single log chunk: every stored version takes a 256-byte-aligned slot and
//! its offset is where that slot starts. A rewrite of identical content under
//! a higher revision only bumps the revision and keeps the slot.

use crate::common::{content_hash, timestamp_now, Error, Item, RecordMeta, Result};
use crate::proxy::version::{self, SetOutcome};
use bytes::Bytes;
use std::collections::HashMap;

/// Fixed per-record header size in the log layout
const RECORD_HEADER: u64 = 24;

/// Slot size of a record: header + key + value, rounded up past the next 256 boundary
pub fn record_size(key_len: usize, value_len: usize) -> u64 {
    (((value_len as u64 + key_len as u64 + RECORD_HEADER) >> 8) + 1) << 8
}

/// Stored version of a key
#[derive(Debug, Clone)]
pub struct Record {
    pub flags: u32,
    pub value: Bytes,
    pub rev: i64,
    pub hash: u32,
    pub timestamp: u64,
    pub offset: u64,
}

impl Record {
    pub fn is_live(&self) -> bool {
        !version::is_tombstone(self.rev)
    }

    pub fn item(&self) -> Item {
        Item::new(self.flags, self.value.clone()).with_rev(self.rev)
    }

    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            rev: self.rev,
            hash: self.hash,
            flags: self.flags,
            size: self.value.len() as u64,
            timestamp: self.timestamp,
            chunk_id: 0,
            offset: self.offset,
        }
    }
}

/// Record store statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub live_keys: usize,
    pub tombstones: usize,
    pub live_bytes: u64,
    pub log_position: u64,
}

#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<String, Record>,
    /// Next free log position
    tail: u64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value with its revision
    pub fn get(&self, key: &str) -> Option<Item> {
        self.records
            .get(key)
            .filter(|r| r.is_live())
            .map(Record::item)
    }

    /// Latest version for revision-aware reads; a tombstone comes back with
    /// an empty value and its negative revision
    pub fn get_versioned(&self, key: &str) -> Option<Item> {
        self.records.get(key).map(|r| {
            if r.is_live() {
                r.item()
            } else {
                Item::new(r.flags, Bytes::new()).with_rev(r.rev)
            }
        })
    }

    /// Metadata of the latest version, tombstones included
    pub fn get_meta(&self, key: &str) -> Option<RecordMeta> {
        self.records.get(key).map(Record::meta)
    }

    /// Store `item` under its requested revision (0 = next); returns the stored revision
    pub fn set(&mut self, key: &str, item: &Item) -> Result<i64> {
        if version::is_tombstone(item.rev) {
            return Err(Error::Protocol(format!(
                "negative revision {} on set of {}",
                item.rev, key
            )));
        }
        let stored = self.records.get(key).map(|r| r.rev);
        let rev = match version::resolve_set(stored, item.rev) {
            SetOutcome::Store(rev) => rev,
            SetOutcome::Duplicate => return Ok(item.rev),
            SetOutcome::Stale { stored } => {
                tracing::debug!(key, requested = item.rev, stored, "stale write rejected");
                return Err(Error::VersionConflict(key.to_string()));
            }
        };

        let hash = content_hash(&item.value);
        let timestamp = timestamp_now();

        if let Some(existing) = self.records.get_mut(key) {
            if existing.is_live()
                && existing.hash == hash
                && existing.flags == item.flags
                && existing.value == item.value
            {
                existing.rev = rev;
                existing.timestamp = timestamp;
                return Ok(rev);
            }
        }

        let offset = self.append(key.len(), item.len());
        self.records.insert(
            key.to_string(),
            Record {
                flags: item.flags,
                value: item.value.clone(),
                rev,
                hash,
                timestamp,
                offset,
            },
        );
        Ok(rev)
    }

    /// Tombstone a live key; `false` when there was nothing to delete
    pub fn delete(&mut self, key: &str) -> bool {
        let current = match self.records.get(key) {
            Some(record) if record.is_live() => record.rev,
            _ => return false,
        };

        let offset = self.append(key.len(), 0);
        self.records.insert(
            key.to_string(),
            Record {
                flags: 0,
                value: Bytes::new(),
                rev: version::tombstone_revision(current),
                hash: content_hash(&[]),
                timestamp: timestamp_now(),
                offset,
            },
        );
        true
    }

    fn append(&mut self, key_len: usize, value_len: usize) -> u64 {
        let offset = self.tail;
        self.tail += record_size(key_len, value_len);
        offset
    }

    pub fn stats(&self) -> StoreStats {
        let live = self.records.values().filter(|r| r.is_live());
        StoreStats {
            live_keys: live.clone().count(),
            tombstones: self.records.values().filter(|r| !r.is_live()).count(),
            live_bytes: live.map(|r| r.value.len() as u64).sum(),
            log_position: self.tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(v: &str) -> Item {
        Item::new(0, v.as_bytes().to_vec())
    }

    fn rev_and_offset(store: &RecordStore, key: &str) -> (i64, u64) {
        let meta = store.get_meta(key).unwrap();
        (meta.rev, meta.offset)
    }

    #[test]
    fn test_record_size() {
        assert_eq!(record_size(4, 3), 256);
        assert_eq!(record_size(4, 0), 256);
        assert_eq!(record_size(0, 232), 512);
        let big = 10 * 1024 * 1024;
        assert_eq!(record_size(8, big), (((big as u64 + 8 + 24) >> 8) + 1) << 8);
    }

    #[test]
    fn test_set_versions_and_offsets() {
        let mut store = RecordStore::new();
        store.set("key1", &item("aaa")).unwrap();
        assert_eq!(rev_and_offset(&store, "key1"), (1, 0));

        store.set("key1", &item("bbb").with_rev(3)).unwrap();
        assert_eq!(rev_and_offset(&store, "key1"), (3, 256));

        // Same content, newer revision: updated in place
        store.set("key1", &item("bbb").with_rev(4)).unwrap();
        assert_eq!(rev_and_offset(&store, "key1"), (4, 256));

        let err = store.set("key1", &item("ccc").with_rev(2)).unwrap_err();
        assert!(matches!(err, Error::VersionConflict(_)));
        assert_eq!(&store.get("key1").unwrap().value[..], b"bbb");
        assert_eq!(rev_and_offset(&store, "key1"), (4, 256));
    }

    #[test]
    fn test_delete_versions() {
        let mut store = RecordStore::new();
        store.set("key1", &item("aaa")).unwrap();
        assert!(store.delete("key1"));
        assert!(store.get("key1").is_none());
        assert_eq!(rev_and_offset(&store, "key1"), (-2, 256));
        assert!(!store.delete("key1"));

        store.set("key1", &item("bbb")).unwrap();
        assert_eq!(store.get("key1").unwrap().rev, 3);
        assert_eq!(rev_and_offset(&store, "key1"), (3, 512));
    }

    #[test]
    fn test_duplicate_revision_keeps_record() {
        let mut store = RecordStore::new();
        store.set("k", &item("one").with_rev(5)).unwrap();
        assert_eq!(store.set("k", &item("two").with_rev(5)).unwrap(), 5);
        assert_eq!(&store.get("k").unwrap().value[..], b"one");
    }

    #[test]
    fn test_versioned_read_sees_tombstone() {
        let mut store = RecordStore::new();
        store.set("k", &item("abc").with_rev(4)).unwrap();
        assert_eq!(store.get_versioned("k").unwrap().rev, 4);

        store.delete("k");
        let tombstone = store.get_versioned("k").unwrap();
        assert_eq!(tombstone.rev, -5);
        assert!(tombstone.is_empty());
        assert!(store.get("k").is_none());
        assert!(store.get_versioned("missing").is_none());
    }

    #[test]
    fn test_negative_revision_rejected() {
        let mut store = RecordStore::new();
        let err = store.set("k", &item("v").with_rev(-5)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(store.get_meta("k").is_none());
    }

    #[test]
    fn test_stats() {
        let mut store = RecordStore::new();
        store.set("a", &item("12345")).unwrap();
        store.set("b", &item("x")).unwrap();
        store.delete("b");
        let stats = store.stats();
        assert_eq!(stats.live_keys, 1);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.live_bytes, 5);
        assert_eq!(stats.log_position, 768);
    }
}
