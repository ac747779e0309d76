//! The key-value proxy
//!
//! The proxy is responsible for:
//! - Bucket routing (key → bucket → main/backup nodes)
//! - Quorum replication with backup failover
//! - Per-node circuit breaking and health scoring
//! - Prefix-scoped migration between the legacy and the new backend
//! - The memcache listener and the dashboard/reload HTTP API

pub mod backend;
pub mod buffer;
pub mod dispatch;
pub mod health;
pub mod http;
pub mod node_client;
pub mod pool;
pub mod replication;
pub mod router;
pub mod server;
pub mod switcher;
pub mod version;

pub use server::ProxyServer;

use crate::common::{ProxyConfig, Result, RouteConfig};
use backend::{Backend, HttpBackend, LegacyBackend};
use buffer::BufferStats;
use dispatch::Dispatcher;
use replication::ReplicationCoordinator;
use std::path::Path;
use std::sync::Arc;
use switcher::{BackendSwitcher, SwitchTable};
use tracing::info;

/// Shared state of a running proxy
pub struct Proxy {
    config: ProxyConfig,
    coordinator: Arc<ReplicationCoordinator>,
    dispatcher: Dispatcher,
    buffers: Arc<BufferStats>,
    /// Serializes reloads
    reload_lock: tokio::sync::Mutex<()>,
}

impl Proxy {
    /// Wire up backends and tables from parsed documents
    pub fn build(config: ProxyConfig, route: &RouteConfig) -> Result<Arc<Self>> {
        let buffers = BufferStats::new();
        let coordinator = Arc::new(ReplicationCoordinator::new(
            &config,
            route,
            buffers.clone(),
        )?);

        let legacy: Arc<dyn Backend> = Arc::new(LegacyBackend::new(
            coordinator.clone(),
            config.dstore.enable_read,
            config.dstore.enable_write,
        ));
        let new: Option<Arc<dyn Backend>> = match &config.new_backend {
            Some(c) => Some(Arc::new(HttpBackend::new(c)?)),
            None => None,
        };

        let table = SwitchTable::from_config(&config.switch)?;
        let dispatcher = Dispatcher::new(
            Arc::new(BackendSwitcher::new(table.clone())),
            legacy,
            new,
            buffers.clone(),
        );
        dispatcher.check_table(&table)?;

        Ok(Arc::new(Self {
            config,
            coordinator,
            dispatcher,
            buffers,
            reload_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Load `proxy.toml` and `route.toml` from a config directory
    pub fn from_confdir(confdir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let config = ProxyConfig::load(confdir)?;
        let route = config.load_route()?;
        Self::build(config, &route)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn buffers(&self) -> &Arc<BufferStats> {
        &self.buffers
    }

    /// Install a switch table; the previous one stays on error
    pub async fn install_switch(&self, table: SwitchTable) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        self.dispatcher.check_table(&table)?;
        self.dispatcher.switcher().reload(table);
        Ok(())
    }

    /// Re-read the switch table from `proxy.toml`
    pub async fn reload_switch(&self) -> Result<()> {
        let switch = self.config.reload_switch()?;
        let table = SwitchTable::from_config(&switch)?;
        self.install_switch(table).await
    }

    /// Re-read `route.toml`
    pub async fn reload_route(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        let route = self.config.load_route()?;
        self.coordinator.reload_route(&route)?;
        info!(numbucket = route.numbucket, nodes = route.addresses().len(), "route table reloaded");
        Ok(())
    }
}
