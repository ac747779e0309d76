//! Quorum replication over the storage nodes
//!
//! Every node call runs in its own task. The coordinator collects results
//! from a channel until the quorum is met or the phase deadline passes; tasks
//! still running at that point finish on their own, record their outcome in
//! the health monitor and return their connection to the pool.

use crate::common::{
    divide_keys_by_bucket, DStoreConfig, Error, Item, ProxyConfig, RecordMeta, Result, RouteConfig,
    SwapCell, METRICS,
};
use crate::proxy::buffer::{BufferStats, Shard};
use crate::proxy::health::{CallOutcome, HealthSettings, NodeHealth, NodeHealthMonitor, NodeStatus};
use crate::proxy::node_client::NodeClient;
use crate::proxy::pool::ConnectionPool;
use crate::proxy::router::{BucketReplicas, BucketRouter};
use crate::proxy::version::{self, Versioned};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout_at;
use tracing::{debug, warn};

/// Route table, health registry and node clients captured together
#[derive(Debug)]
pub struct Topology {
    router: BucketRouter,
    health: NodeHealthMonitor,
    clients: BTreeMap<String, Arc<NodeClient>>,
    /// Bumped on every route reload
    version: u64,
}

/// Dashboard view of one bucket
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub bucket: usize,
    pub mains: Vec<NodeStatus>,
    pub backups: Vec<NodeStatus>,
    /// Mains in the order reads try them
    pub read_order: Vec<String>,
}

impl Topology {
    fn build(
        dstore: &DStoreConfig,
        body_max: usize,
        router: BucketRouter,
        previous: Option<&Topology>,
    ) -> Self {
        let addrs = router.addresses();
        let health = NodeHealthMonitor::new(
            HealthSettings::from(dstore),
            &addrs,
            previous.map(|p| &p.health),
        );
        let clients = addrs
            .iter()
            .map(|addr| {
                let client = previous
                    .and_then(|p| p.clients.get(addr).cloned())
                    .unwrap_or_else(|| {
                        Arc::new(NodeClient::new(
                            ConnectionPool::new(
                                addr.clone(),
                                dstore.max_free_conns_per_host,
                                dstore.connect_timeout(),
                            ),
                            dstore.read_timeout(),
                            dstore.write_timeout(),
                            body_max,
                        ))
                    });
                (addr.clone(), client)
            })
            .collect();
        Self {
            router,
            health,
            clients,
            version: previous.map_or(0, |p| p.version + 1),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bucket_status(&self, bucket: usize) -> Option<BucketStatus> {
        if bucket >= self.router.numbucket() {
            return None;
        }
        let replicas = self.router.resolve(bucket);
        let status = |addrs: &[String]| -> Vec<NodeStatus> {
            addrs
                .iter()
                .filter_map(|addr| self.health.node(addr).map(|n| n.status()))
                .collect()
        };
        Some(BucketStatus {
            bucket,
            mains: status(&replicas.mains),
            backups: status(&replicas.backups),
            read_order: self
                .health
                .rank(&replicas.mains)
                .into_iter()
                .cloned()
                .collect(),
        })
    }

    pub fn router(&self) -> &BucketRouter {
        &self.router
    }

    pub fn health(&self) -> &NodeHealthMonitor {
        &self.health
    }

    pub fn client(&self, addr: &str) -> Option<&Arc<NodeClient>> {
        self.clients.get(addr)
    }

    fn target(&self, addr: &str) -> Option<Target> {
        Some(Target {
            addr: addr.to_string(),
            client: self.clients.get(addr)?.clone(),
            health: self.health.node(addr)?.clone(),
        })
    }
}

/// One node, ready to be called from a detached task
#[derive(Clone)]
struct Target {
    addr: String,
    client: Arc<NodeClient>,
    health: Arc<NodeHealth>,
}

impl Target {
    /// Run one call through the breaker; `None` outcome means it was refused
    async fn run<T, F, Fut>(&self, f: F) -> (Result<T>, Option<CallOutcome>)
    where
        F: FnOnce(Arc<NodeClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.health.admit().is_allowed() {
            return (
                Err(Error::ConnectionFailed(format!("{}: circuit open", self.addr))),
                None,
            );
        }
        let start = Instant::now();
        let result = f(self.client.clone()).await;
        let outcome = CallOutcome::of(&result, start.elapsed());
        (result, Some(outcome))
    }

    /// Call inline and record health before returning
    async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<NodeClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (result, outcome) = self.run(f).await;
        if let Some(outcome) = outcome {
            self.health.record(&outcome);
        }
        result
    }

    /// Call in a detached task; the result is sent before health is recorded
    fn spawn<T, F, Fut>(self, tx: mpsc::UnboundedSender<(String, Result<T>)>, f: F)
    where
        T: Send + 'static,
        F: FnOnce(Arc<NodeClient>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(async move {
            let (result, outcome) = self.run(f).await;
            let _ = tx.send((self.addr.clone(), result));
            if let Some(outcome) = outcome {
                self.health.record(&outcome);
            }
        });
    }
}

#[derive(Clone)]
enum WriteOp {
    Set(Item),
    Delete,
}

impl WriteOp {
    fn spawn(
        &self,
        target: Target,
        key: &str,
        buffers: &Arc<BufferStats>,
        tx: mpsc::UnboundedSender<(String, Result<bool>)>,
    ) {
        let key = key.to_string();
        match self.clone() {
            WriteOp::Set(item) => {
                let health = target.health.clone();
                let held = buffers.hold(Shard::ReplicaData, item.len());
                target.spawn(tx, move |client| async move {
                    let _held = held;
                    client.set(&key, &item).await?;
                    health.record_item_size(item.len());
                    Ok(true)
                })
            }
            WriteOp::Delete => {
                target.spawn(tx, move |client| async move { client.delete(&key).await })
            }
        }
    }
}

/// Acknowledgements gathered for one write
#[derive(Debug, Default)]
struct WriteTally {
    acked: Vec<String>,
    found: bool,
    conflicts: usize,
}

impl WriteTally {
    fn absorb(&mut self, addr: String, result: Result<bool>) {
        match result {
            Ok(found) => {
                self.found |= found;
                self.acked.push(addr);
            }
            Err(Error::VersionConflict(_)) => self.conflicts += 1,
            Err(e) => debug!(node = %addr, error = %e, "replica write failed"),
        }
    }

    fn acks(&self) -> usize {
        self.acked.len()
    }
}

/// Wait for write results until `w` acks, all calls done, or the deadline
///
/// Returns `false` when the deadline passed.
async fn collect_writes(
    rx: &mut mpsc::UnboundedReceiver<(String, Result<bool>)>,
    pending: &mut usize,
    deadline: tokio::time::Instant,
    tally: &mut WriteTally,
    w: usize,
) -> bool {
    while *pending > 0 && tally.acks() < w {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((addr, result))) => {
                *pending -= 1;
                tally.absorb(addr, result);
            }
            Ok(None) => break,
            Err(_) => return false,
        }
    }
    true
}

/// ReplicationCoordinator fans operations out to a bucket's replicas.
#[derive(Debug)]
pub struct ReplicationCoordinator {
    dstore: DStoreConfig,
    body_max: usize,
    topology: SwapCell<Topology>,
    buffers: Arc<BufferStats>,
}

impl ReplicationCoordinator {
    pub fn new(
        config: &ProxyConfig,
        route: &RouteConfig,
        buffers: Arc<BufferStats>,
    ) -> Result<Self> {
        let router = BucketRouter::from_config(route)?;
        let topology = Topology::build(&config.dstore, config.mc.body_max, router, None);
        Ok(Self {
            dstore: config.dstore.clone(),
            body_max: config.mc.body_max,
            topology: SwapCell::new(topology),
            buffers,
        })
    }

    /// Swap in a new route table; node health and pools carry over
    pub fn reload_route(&self, route: &RouteConfig) -> Result<()> {
        let router = BucketRouter::from_config(route)?;
        let current = self.topology.load();
        let next = Topology::build(&self.dstore, self.body_max, router, Some(&current));
        self.topology.store(next);
        Ok(())
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load()
    }

    pub fn node_status(&self) -> Vec<NodeStatus> {
        self.topology.load().health.status()
    }

    pub fn route_snapshot(&self) -> BTreeMap<String, BucketReplicas> {
        self.topology.load().router.snapshot()
    }

    /// Store a value on W replicas
    pub async fn write(&self, key: &str, item: &Item) -> Result<()> {
        self.replicate(key, WriteOp::Set(item.clone())).await.map(|_| ())
    }

    /// Tombstone a key on W replicas; `true` when any replica had it live
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.replicate(key, WriteOp::Delete).await
    }

    async fn replicate(&self, key: &str, op: WriteOp) -> Result<bool> {
        let topo = self.topology.load();
        let (bucket, replicas) = topo.router.resolve_key(key);
        let n = self.dstore.n;
        let w = self.dstore.w;
        let threshold = self.dstore.main_threshold();

        let mut mains: Vec<&String> = topo.health.live(&replicas.mains);
        mains.truncate(n);
        let mut backups = topo.health.live(&replicas.backups).into_iter();

        let mut targets = mains.clone();
        if mains.len() < threshold {
            targets.extend(backups.by_ref().take(n.saturating_sub(mains.len())));
            if targets.len() > mains.len() {
                METRICS.backup_writes.inc();
                warn!(
                    key,
                    bucket,
                    live_mains = mains.len(),
                    "not enough live mains, writing to backups"
                );
            }
        }
        if targets.is_empty() {
            return Err(Error::NoReachableNode(bucket));
        }

        let deadline = tokio::time::Instant::now() + self.dstore.write_timeout();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = 0;
        for addr in &targets {
            if let Some(target) = topo.target(addr) {
                op.spawn(target, key, &self.buffers, tx.clone());
                pending += 1;
            }
        }

        let mut tally = WriteTally::default();
        let in_time = collect_writes(&mut rx, &mut pending, deadline, &mut tally, w).await;

        // A node that rejected a stale revision is reachable; only failed mains fall back
        if tally.acks() < w && tally.conflicts == 0 && in_time && pending == 0 {
            let acked_mains = tally
                .acked
                .iter()
                .filter(|a| mains.iter().any(|m| *m == *a))
                .count();
            if acked_mains < threshold {
                let extra: Vec<&String> = backups
                    .take(n.saturating_sub(tally.acks()))
                    .collect();
                if !extra.is_empty() {
                    METRICS.backup_writes.inc();
                    warn!(
                        key,
                        bucket,
                        acked_mains,
                        backups = extra.len(),
                        "mains failed, retrying write on backups"
                    );
                    for addr in extra {
                        if let Some(target) = topo.target(addr) {
                            op.spawn(target, key, &self.buffers, tx.clone());
                            pending += 1;
                        }
                    }
                    collect_writes(&mut rx, &mut pending, deadline, &mut tally, w).await;
                }
            }
        }

        if tally.acks() >= w {
            return Ok(tally.found);
        }
        if tally.conflicts > 0 {
            return Err(Error::VersionConflict(key.to_string()));
        }
        warn!(key, bucket, acks = tally.acks(), needed = w, "write quorum not reached");
        Err(Error::PartialWrite {
            acks: tally.acks(),
            needed: w,
        })
    }

    /// Quorum read of a live value
    ///
    /// Tombstones take part in picking the latest version; a key whose
    /// latest version is a tombstone reads as absent.
    pub async fn read(&self, key: &str) -> Result<Option<Item>> {
        let latest = self
            .read_with(key, |client, key| async move { client.get(&key).await })
            .await?;
        Ok(latest.filter(|item| !version::is_tombstone(item.rev)))
    }

    /// Quorum read of the metadata record, tombstones included
    pub async fn read_meta(&self, key: &str) -> Result<Option<RecordMeta>> {
        self.read_with(key, |client, key| async move { client.get_meta(&key).await })
            .await
    }

    async fn read_with<T, F, Fut>(&self, key: &str, f: F) -> Result<Option<T>>
    where
        T: Versioned + Send + 'static,
        F: Fn(Arc<NodeClient>, String) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let topo = self.topology.load();
        let (bucket, replicas) = topo.router.resolve_key(key);
        let r = self.dstore.r;

        let candidates = topo.health.rank(&replicas.mains);
        let mut untried = candidates.into_iter();

        let deadline = tokio::time::Instant::now() + self.dstore.read_timeout();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut inflight = 0usize;

        let spawn_next = |untried: &mut std::vec::IntoIter<&String>| -> bool {
            for addr in untried.by_ref() {
                if let Some(target) = topo.target(addr) {
                    let f = f.clone();
                    let key = key.to_string();
                    target.spawn(tx.clone(), move |client| f(client, key));
                    return true;
                }
            }
            false
        };

        for _ in 0..r {
            if spawn_next(&mut untried) {
                inflight += 1;
            }
        }

        let mut responses: Vec<Option<T>> = Vec::with_capacity(r);
        while responses.len() < r && inflight > 0 {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((_, Ok(record)))) => {
                    inflight -= 1;
                    responses.push(record);
                }
                Ok(Some((addr, Err(e)))) => {
                    inflight -= 1;
                    debug!(node = %addr, error = %e, "replica read failed");
                    if spawn_next(&mut untried) {
                        inflight += 1;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        if responses.len() < r {
            warn!(
                key,
                bucket,
                responses = responses.len(),
                needed = r,
                "read quorum not reached"
            );
            return Err(Error::ReadQuorumFailed {
                responses: responses.len(),
                needed: r,
            });
        }

        if let Some(found) = version::latest(responses.into_iter().flatten()) {
            return Ok(Some(found));
        }

        // Every quorum member missed: ask the rest one by one. A tombstone
        // counts as a hit, so a deleted key never falls through to a stale copy.
        let backups = topo.health.live(&replicas.backups);
        for addr in untried.chain(backups) {
            let Some(target) = topo.target(addr) else {
                continue;
            };
            let f = f.clone();
            let key = key.to_string();
            match target.call(move |client| f(client, key)).await {
                Ok(Some(record)) => {
                    debug!(node = %addr, "miss read-through hit");
                    return Ok(Some(record));
                }
                Ok(None) => {}
                Err(e) => debug!(node = %addr, error = %e, "read-through failed"),
            }
        }
        Ok(None)
    }

    /// Fetch several keys; each bucket group is served by its best live main
    pub async fn get_multi(&self, keys: &[String]) -> Result<Vec<(String, Item)>> {
        let topo = self.topology.load();
        let groups = divide_keys_by_bucket(keys, topo.router.numbucket());

        let mut tasks: FuturesUnordered<_> = groups
            .into_iter()
            .map(|(bucket, group)| {
                let topo = topo.clone();
                async move { Self::get_group(&topo, bucket, group).await }
            })
            .collect();

        let mut found: HashMap<String, Item> = HashMap::new();
        while let Some(group) = tasks.next().await {
            found.extend(group);
        }

        let mut out = Vec::with_capacity(found.len());
        for key in keys {
            if let Some(item) = found.remove(key) {
                out.push((key.clone(), item));
            }
        }
        Ok(out)
    }

    async fn get_group(
        topo: &Topology,
        bucket: usize,
        mut missing: Vec<String>,
    ) -> Vec<(String, Item)> {
        let replicas = topo.router.resolve(bucket);
        let mut found = Vec::new();
        for addr in topo.health.rank(&replicas.mains) {
            if missing.is_empty() {
                break;
            }
            let Some(target) = topo.target(addr) else {
                continue;
            };
            let keys = missing.clone();
            let result = target
                .call(|client| async move {
                    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                    client.get_multi(&refs).await
                })
                .await;
            match result {
                Ok(values) => {
                    for (key, item) in values {
                        if let Some(pos) = missing.iter().position(|k| *k == key) {
                            missing.swap_remove(pos);
                            if version::is_tombstone(item.rev) {
                                continue;
                            }
                            target.health.record_item_size(item.len());
                            found.push((key, item));
                        }
                    }
                }
                Err(e) => debug!(node = %addr, bucket, error = %e, "multi-get failed"),
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RouteEntry;

    fn coordinator(addrs: &[&str]) -> ReplicationCoordinator {
        let route = RouteConfig {
            numbucket: 1,
            main: addrs
                .iter()
                .map(|a| RouteEntry {
                    addr: a.to_string(),
                    buckets: vec!["0".into()],
                })
                .collect(),
            backup: vec![],
        };
        ReplicationCoordinator::new(&ProxyConfig::default(), &route, BufferStats::new()).unwrap()
    }

    #[test]
    fn test_reload_keeps_node_state() {
        let coord = coordinator(&["127.0.0.1:1", "127.0.0.1:2"]);
        let before = coord.topology();

        let route = RouteConfig {
            numbucket: 1,
            main: vec![RouteEntry {
                addr: "127.0.0.1:1".into(),
                buckets: vec!["0".into()],
            }],
            backup: vec!["127.0.0.1:3".into()],
        };
        coord.reload_route(&route).unwrap();
        let after = coord.topology();

        assert!(Arc::ptr_eq(
            before.health().node("127.0.0.1:1").unwrap(),
            after.health().node("127.0.0.1:1").unwrap()
        ));
        assert!(after.health().node("127.0.0.1:2").is_none());
        assert_eq!(coord.route_snapshot()["0"].backups, vec!["127.0.0.1:3"]);
        assert_eq!(before.version(), 0);
        assert_eq!(after.version(), 1);
    }

    #[test]
    fn test_bucket_status() {
        let coord = coordinator(&["127.0.0.1:2", "127.0.0.1:1"]);
        let topology = coord.topology();
        let status = topology.bucket_status(0).unwrap();
        let mains: Vec<&str> = status.mains.iter().map(|n| n.addr.as_str()).collect();
        assert_eq!(mains, vec!["127.0.0.1:2", "127.0.0.1:1"]);
        assert_eq!(status.read_order, vec!["127.0.0.1:1", "127.0.0.1:2"]);
        assert!(status.backups.is_empty());
        assert!(topology.bucket_status(1).is_none());
    }

    #[test]
    fn test_reload_rejects_bad_route() {
        let coord = coordinator(&["127.0.0.1:1"]);
        let bad = RouteConfig {
            numbucket: 0,
            main: vec![],
            backup: vec![],
        };
        assert!(coord.reload_route(&bad).is_err());
        assert_eq!(coord.route_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_nodes_fail_quorum() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let coord = coordinator(&[addr.as_str()]);
        let err = coord
            .write("k", &Item::new(0, &b"v"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartialWrite { acks: 0, .. }));

        let err = coord.read("k").await.unwrap_err();
        assert!(matches!(err, Error::ReadQuorumFailed { responses: 0, .. }));
    }
}
