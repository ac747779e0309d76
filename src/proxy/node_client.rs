//! Memcache client for a single storage node

use crate::common::protocol::{self, Item, RecordMeta};
use crate::common::{Error, Result};
use crate::proxy::pool::{Connection, ConnectionPool};
use std::time::Duration;
use tokio::time::error::Elapsed;

/// Client for one storage node
#[derive(Debug)]
pub struct NodeClient {
    pool: ConnectionPool,
    read_timeout: Duration,
    write_timeout: Duration,
    body_max: usize,
}

impl NodeClient {
    pub fn new(
        pool: ConnectionPool,
        read_timeout: Duration,
        write_timeout: Duration,
        body_max: usize,
    ) -> Self {
        Self {
            pool,
            read_timeout,
            write_timeout,
            body_max,
        }
    }

    pub fn addr(&self) -> &str {
        self.pool.addr()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Hand the connection back if the exchange finished cleanly
    fn finish<T>(
        &self,
        conn: Connection,
        outcome: std::result::Result<Result<T>, Elapsed>,
        timeout: Duration,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(value)) => {
                self.pool.release(conn);
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!("{} after {:?}", self.addr(), timeout))),
        }
    }

    fn node_error(&self, line: &str) -> Error {
        Error::NodeError {
            node: self.addr().to_string(),
            message: line.to_string(),
        }
    }

    /// Fetch the latest version with its revision
    ///
    /// A tombstone comes back as an empty item carrying its negative revision.
    pub async fn get(&self, key: &str) -> Result<Option<Item>> {
        let values = self.get_multi(&[key]).await?;
        Ok(values.into_iter().find(|(k, _)| k == key).map(|(_, item)| item))
    }

    /// Fetch several keys in one round trip, tombstones included
    pub async fn get_multi(&self, keys: &[&str]) -> Result<Vec<(String, Item)>> {
        let mut conn = self.pool.acquire().await?;
        let timeout = self.read_timeout;
        let body_max = self.body_max;
        let outcome = tokio::time::timeout(timeout, async {
            protocol::send_get(&mut conn, keys, true).await?;
            protocol::read_values(&mut conn, body_max).await
        })
        .await;
        self.finish(conn, outcome, timeout)
    }

    /// Fetch the metadata record, tombstones included
    pub async fn get_meta(&self, key: &str) -> Result<Option<RecordMeta>> {
        let mut conn = self.pool.acquire().await?;
        let timeout = self.read_timeout;
        let query = format!("?{}", key);
        let outcome = tokio::time::timeout(timeout, async {
            protocol::send_get(&mut conn, &[query.as_str()], false).await?;
            protocol::read_values(&mut conn, 4096).await
        })
        .await;
        let values = self.finish(conn, outcome, timeout)?;
        match values.into_iter().next() {
            Some((_, item)) => {
                let line = String::from_utf8_lossy(&item.value);
                Ok(Some(line.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Store a value; `item.rev` is the requested revision (0 = auto)
    pub async fn set(&self, key: &str, item: &Item) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let timeout = self.write_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            protocol::send_set(&mut conn, key, item).await?;
            protocol::read_line(&mut conn).await
        })
        .await;
        let line = self.finish(conn, outcome, timeout)?;
        match line.as_str() {
            "STORED" => Ok(()),
            "EXISTS" => Err(Error::VersionConflict(key.to_string())),
            _ => Err(self.node_error(&line)),
        }
    }

    /// Write a tombstone; returns whether the key was live
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let timeout = self.write_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            protocol::send_delete(&mut conn, key).await?;
            protocol::read_line(&mut conn).await
        })
        .await;
        let line = self.finish(conn, outcome, timeout)?;
        match line.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            _ => Err(self.node_error(&line)),
        }
    }
}
