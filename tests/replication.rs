//! Quorum writes and backup failover against in-process nodes

mod common;

use beanproxy::node::lock;
use common::{eventually, spawn_slow_node, Cluster};
use std::time::{Duration, Instant};

fn stored_on(node: &beanproxy::node::NodeHandle, key: &str) -> Option<Vec<u8>> {
    lock(node.store()).get(key).map(|item| item.value.to_vec())
}

#[tokio::test]
async fn test_all_mains_up() {
    let cluster = Cluster::start("").await;
    let mut client = cluster.client().await;

    assert_eq!(client.set("/test/up", b"value").await, "STORED");
    assert_eq!(client.get("/test/up").await.unwrap().unwrap(), b"value");

    assert!(cluster.wait_drained().await);
    for node in cluster.mains.iter().flatten() {
        assert_eq!(stored_on(node, "/test/up").unwrap(), b"value");
    }
    assert!(stored_on(&cluster.backup, "/test/up").is_none());
}

#[tokio::test]
async fn test_one_main_down() {
    let mut cluster = Cluster::start("").await;
    cluster.stop_main(0).await;
    let mut client = cluster.client().await;

    assert_eq!(client.set("/test/one", b"v1").await, "STORED");
    assert_eq!(client.get("/test/one").await.unwrap().unwrap(), b"v1");

    assert!(cluster.wait_drained().await);
    assert!(stored_on(&cluster.backup, "/test/one").is_none());
}

#[tokio::test]
async fn test_two_mains_down_uses_backup() {
    let mut cluster = Cluster::start("").await;
    cluster.stop_main(0).await;
    cluster.stop_main(1).await;
    let mut client = cluster.client().await;

    assert_eq!(client.set("/test/two", b"v2").await, "STORED");
    assert_eq!(client.get("/test/two").await.unwrap().unwrap(), b"v2");

    assert!(cluster.wait_drained().await);
    assert_eq!(stored_on(&cluster.backup, "/test/two").unwrap(), b"v2");
}

#[tokio::test]
async fn test_three_mains_down() {
    let mut cluster = Cluster::start("").await;
    for idx in 0..3 {
        cluster.stop_main(idx).await;
    }
    let mut client = cluster.client().await;

    assert_eq!(
        client.set("/test/three", b"v3").await,
        "SERVER_ERROR write failed"
    );
    // The backup took the write even though the quorum was missed
    assert!(cluster.wait_drained().await);
    assert_eq!(stored_on(&cluster.backup, "/test/three").unwrap(), b"v3");

    assert_eq!(
        client.get("/test/three").await.unwrap_err(),
        "SERVER_ERROR read failed"
    );
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_failures() {
    let mut cluster = Cluster::start("[dstore]\nmax_connect_errors = 2\n").await;
    cluster.stop_main(0).await;
    let mut client = cluster.client().await;

    for i in 0..6 {
        let key = format!("/test/breaker/{}", i);
        assert_eq!(client.set(&key, b"x").await, "STORED");
    }
    assert!(cluster.wait_drained().await);

    let status = cluster.proxy.coordinator().node_status();
    let open = status.iter().filter(|node| node.state == "open").count();
    assert_eq!(open, 1);
}

#[tokio::test]
async fn test_multi_get_keeps_request_order() {
    let cluster = Cluster::start("").await;
    let mut client = cluster.client().await;

    assert_eq!(client.set("/m/a", b"1").await, "STORED");
    assert_eq!(client.set("/m/b", b"2").await, "STORED");

    let values = client.get_multi(&["/m/b", "/m/missing", "/m/a"]).await.unwrap();
    let keys: Vec<&str> = values.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["/m/b", "/m/a"]);
    assert_eq!(values[0].1, b"2");
}

#[tokio::test]
async fn test_slow_replica_completes_after_quorum() {
    let slow = spawn_slow_node(Duration::from_millis(500)).await;
    let cluster =
        Cluster::start_with("[dstore]\nwrite_timeout_ms = 2000\n", 2, &[slow.clone()]).await;
    let mut client = cluster.client().await;
    let topology = cluster.proxy.coordinator().topology();
    let pool = topology.client(&slow).unwrap().pool();
    let health = topology.health().node(&slow).unwrap().clone();

    let start = Instant::now();
    assert_eq!(client.set("/slow/k", b"v").await, "STORED");
    assert!(start.elapsed() < Duration::from_millis(400));
    assert_eq!(pool.idle_count(), 0);

    // The detached call still finishes, hands its connection back and records its latency
    assert!(eventually(|| pool.idle_count() == 1).await);
    assert!(eventually(|| health.avg_response_time_us() >= 400_000.0).await);
    assert_eq!(health.consecutive_failures(), 0);
    assert_eq!(health.recent_errors(), 0);
}

#[tokio::test]
async fn test_replica_past_write_timeout_is_connection_failure() {
    let slow = spawn_slow_node(Duration::from_millis(1500)).await;
    let cluster =
        Cluster::start_with("[dstore]\nwrite_timeout_ms = 300\n", 2, &[slow.clone()]).await;
    let mut client = cluster.client().await;
    let topology = cluster.proxy.coordinator().topology();
    let pool = topology.client(&slow).unwrap().pool();
    let health = topology.health().node(&slow).unwrap().clone();

    assert_eq!(client.set("/slow/t", b"v").await, "STORED");
    assert!(eventually(|| health.consecutive_failures() == 1).await);
    assert_eq!(health.recent_errors(), 1);
    assert_eq!(health.state().to_string(), "closed");
    assert_eq!(pool.idle_count(), 0);

    // The siblings were not held back by the timed out call
    assert!(cluster.wait_drained().await);
    for node in cluster.mains.iter().flatten() {
        assert_eq!(stored_on(node, "/slow/t").unwrap(), b"v");
    }
}
