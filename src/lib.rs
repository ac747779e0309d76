//! # beanproxy
//!
//! A key-value proxy in front of a cluster of storage nodes:
//! - Bucket routing with main and backup replicas per bucket
//! - Quorum replication (N/W/R) with backup failover
//! - Per-node circuit breaking and latency/error health scoring
//! - Revision-based conflict resolution with tombstones
//! - Prefix-scoped migration between the legacy cluster and a new backend
//! - Memcache text protocol for clients, HTTP for the dashboard and reloads
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            memcache clients
//!                   │
//! ┌─────────────────▼───────────────────┐
//! │              beanproxy              │
//! │  BackendSwitcher (prefix → stage)   │
//! │    ├─ legacy: ReplicationCoordinator│
//! │    └─ new:    HttpBackend           │
//! └───────┬───────────────┬─────────────┘
//!         │ memcache      │ REST
//!   ┌─────┴─────┐    ┌────▼────────┐
//!   │ nodes     │    │ new storage │
//!   │ (buckets) │    └─────────────┘
//!   └───────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start storage nodes
//! ```bash
//! beanproxy-node serve --bind 0.0.0.0:7980 --web 0.0.0.0:7990
//! ```
//!
//! ### Start the proxy
//! ```bash
//! beanproxy serve --confdir ./conf
//! ```
//!
//! `conf/proxy.toml` holds listener, quorum and switch settings and
//! `conf/route.toml` the bucket layout. Both can be reloaded at runtime:
//!
//! ```bash
//! curl -X POST 'http://localhost:7908/reload?config=rwswitcher'
//! curl -X POST 'http://localhost:7908/reload?config=route'
//! ```

pub mod common;
pub mod node;
pub mod proxy;

// Re-export commonly used types
pub use common::{Error, ProxyConfig, Result};
pub use node::NodeServer;
pub use proxy::{Proxy, ProxyServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
