//! In-flight value buffer accounting
//!
//! Every value body held in memory by the proxy is tracked in one of four
//! shards while it is held. Counters return to zero once all operations,
//! including detached replica writes, have finished.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shard {
    /// Values being returned to clients
    GetData,
    /// Client `set` bodies
    SetData,
    /// Bodies copied for the mirror backend
    MirrorData,
    /// Bodies held by per-node replica writes
    ReplicaData,
}

impl Shard {
    pub const ALL: [Shard; 4] = [
        Shard::GetData,
        Shard::SetData,
        Shard::MirrorData,
        Shard::ReplicaData,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Shard::GetData => "GetData",
            Shard::SetData => "SetData",
            Shard::MirrorData => "MirrorData",
            Shard::ReplicaData => "ReplicaData",
        }
    }
}

#[derive(Debug, Default)]
struct ShardCounter {
    count: AtomicI64,
    size: AtomicI64,
}

/// JSON shape of one shard: `{"Count": n, "Size": bytes}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BufferUsage {
    pub count: i64,
    pub size: i64,
}

#[derive(Debug, Default)]
pub struct BufferStats {
    shards: [ShardCounter; 4],
}

impl BufferStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self, shard: Shard) -> &ShardCounter {
        &self.shards[shard as usize]
    }

    /// Account `size` bytes until the guard is dropped
    pub fn hold(self: &Arc<Self>, shard: Shard, size: usize) -> BufferGuard {
        let counter = self.counter(shard);
        counter.count.fetch_add(1, Ordering::Relaxed);
        counter.size.fetch_add(size as i64, Ordering::Relaxed);
        BufferGuard {
            stats: self.clone(),
            shard,
            size: size as i64,
        }
    }

    pub fn usage(&self, shard: Shard) -> BufferUsage {
        let counter = self.counter(shard);
        BufferUsage {
            count: counter.count.load(Ordering::Relaxed),
            size: counter.size.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, BufferUsage> {
        Shard::ALL
            .iter()
            .map(|shard| (shard.name(), self.usage(*shard)))
            .collect()
    }

    pub fn is_drained(&self) -> bool {
        Shard::ALL
            .iter()
            .all(|shard| self.usage(*shard) == BufferUsage::default())
    }
}

/// Releases its accounted bytes on drop
#[derive(Debug)]
pub struct BufferGuard {
    stats: Arc<BufferStats>,
    shard: Shard,
    size: i64,
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        let counter = self.stats.counter(self.shard);
        counter.count.fetch_sub(1, Ordering::Relaxed);
        counter.size.fetch_sub(self.size, Ordering::Relaxed);
    }
}
