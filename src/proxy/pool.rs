//! Per-node connection pool
//!
//! Idle connections are kept in a bounded free list. A connection is checked
//! out for exactly one request/response exchange and handed back with
//! [`ConnectionPool::release`] only if that exchange completed cleanly.

use crate::common::{Error, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tracing::debug;

pub type Connection = BufStream<TcpStream>;

#[derive(Debug)]
pub struct ConnectionPool {
    addr: String,
    max_idle: usize,
    connect_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, max_idle: usize, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            max_idle,
            connect_timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn take_idle(&self) -> Option<Connection> {
        match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }

    /// Reuse an idle connection or dial a new one
    pub async fn acquire(&self) -> Result<Connection> {
        if let Some(conn) = self.take_idle() {
            return Ok(conn);
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "connect to {} after {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        debug!(node = %self.addr, "dialed new connection");
        Ok(BufStream::new(stream))
    }

    /// Return a healthy connection; beyond the cap it is closed
    pub fn release(&self, conn: Connection) {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    pub fn idle_count(&self) -> usize {
        match self.idle.lock() {
            Ok(idle) => idle.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reuse_and_cap() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let pool = ConnectionPool::new(addr, 1, Duration::from_millis(300));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 1);

        let _c = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = ConnectionPool::new(addr, 4, Duration::from_millis(300));
        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_connection_failure());
    }
}
