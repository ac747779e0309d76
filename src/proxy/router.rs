//! Bucket routing
//!
//! Keys are hashed into a fixed number of buckets; each bucket owns an
//! ordered list of main nodes and an ordered list of backup nodes.
//! A router is immutable once built. Reloads build a new one and swap it in.

use crate::common::{bucket_of, Error, Result, RouteConfig};
use serde::Serialize;
use std::collections::BTreeMap;

/// Replica addresses of one bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketReplicas {
    pub mains: Vec<String>,
    pub backups: Vec<String>,
}

/// BucketRouter maps keys to buckets and buckets to replica sets.
#[derive(Debug, Clone)]
pub struct BucketRouter {
    numbucket: usize,
    buckets: Vec<BucketReplicas>,
}

fn parse_bucket(raw: &str, numbucket: usize, addr: &str) -> Result<(usize, bool)> {
    let (id, is_backup) = match raw.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    let bucket = usize::from_str_radix(id.trim(), 16).map_err(|_| {
        Error::InvalidConfig(format!("node {}: bad bucket id {:?}", addr, raw))
    })?;
    if bucket >= numbucket {
        return Err(Error::InvalidConfig(format!(
            "node {}: bucket {:x} out of range (numbucket = {})",
            addr, bucket, numbucket
        )));
    }
    Ok((bucket, is_backup))
}

impl BucketRouter {
    /// Build and validate a router from a route document
    pub fn from_config(route: &RouteConfig) -> Result<Self> {
        let numbucket = route.numbucket;
        if numbucket == 0 {
            return Err(Error::InvalidConfig("numbucket must be positive".into()));
        }

        let mut buckets = vec![BucketReplicas::default(); numbucket];

        for entry in &route.main {
            for raw in &entry.buckets {
                let (bucket, is_backup) = parse_bucket(raw, numbucket, &entry.addr)?;
                let replicas = &mut buckets[bucket];
                if replicas.mains.contains(&entry.addr) || replicas.backups.contains(&entry.addr)
                {
                    return Err(Error::InvalidConfig(format!(
                        "node {} listed twice for bucket {:x}",
                        entry.addr, bucket
                    )));
                }
                if is_backup {
                    replicas.backups.push(entry.addr.clone());
                } else {
                    replicas.mains.push(entry.addr.clone());
                }
            }
        }

        // Global backups come after bucket-specific ones
        for addr in &route.backup {
            for replicas in buckets.iter_mut() {
                if replicas.mains.contains(addr) || replicas.backups.contains(addr) {
                    continue;
                }
                replicas.backups.push(addr.clone());
            }
        }

        if let Some(empty) = buckets.iter().position(|b| b.mains.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "bucket {:x} has no main node",
                empty
            )));
        }

        Ok(Self { numbucket, buckets })
    }

    pub fn numbucket(&self) -> usize {
        self.numbucket
    }

    pub fn bucket_of(&self, key: &str) -> usize {
        bucket_of(key, self.numbucket)
    }

    /// Replica set of a bucket
    pub fn resolve(&self, bucket: usize) -> &BucketReplicas {
        &self.buckets[bucket % self.numbucket]
    }

    pub fn resolve_key(&self, key: &str) -> (usize, &BucketReplicas) {
        let bucket = self.bucket_of(key);
        (bucket, self.resolve(bucket))
    }

    /// Every distinct node address, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .buckets
            .iter()
            .flat_map(|b| b.mains.iter().chain(b.backups.iter()).cloned())
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    /// Route table keyed by hex bucket id, for the dashboard
    pub fn snapshot(&self) -> BTreeMap<String, BucketReplicas> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| (format!("{:x}", i), b.clone()))
            .collect()
    }
}
