//! Configuration for beanproxy components
//!
//! Two documents are read from the config directory:
//! - `proxy.toml`: listener, protocol limits, replication tuning, switch table
//! - `route.toml`: bucket count and the main/backup node layout
//!
//! Every value in `proxy.toml` may be overridden from the environment with
//! the `BEANPROXY_` prefix, e.g. `BEANPROXY_DSTORE__W=1`.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROXY_CONFIG_FILE: &str = "proxy.toml";
pub const ROUTE_CONFIG_FILE: &str = "route.toml";

/// Global proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub proxy: ServerConfig,

    #[serde(default)]
    pub mc: ProtocolConfig,

    #[serde(default)]
    pub dstore: DStoreConfig,

    #[serde(default)]
    pub switch: SwitchConfig,

    /// New storage backend, required once any prefix leaves `BRW`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_backend: Option<HttpBackendConfig>,

    /// Directory the documents were read from
    #[serde(skip)]
    pub confdir: Option<PathBuf>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Client protocol port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Dashboard / reload port
    #[serde(default = "default_webport")]
    pub webport: u16,

    /// Runtime worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7905
}
fn default_webport() -> u16 {
    7908
}
fn default_threads() -> usize {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            webport: default_webport(),
            threads: default_threads(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }

    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.listen, self.webport)
    }
}

/// Client protocol limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,

    /// Largest accepted value body in bytes
    #[serde(default = "default_body_max")]
    pub body_max: usize,
}

fn default_max_key_len() -> usize {
    250
}
fn default_body_max() -> usize {
    50 * 1024 * 1024
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_key_len: default_max_key_len(),
            body_max: default_body_max(),
        }
    }
}

/// Replication, pooling and health-scoring parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DStoreConfig {
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default = "default_w")]
    pub w: usize,
    #[serde(default = "default_r")]
    pub r: usize,

    #[serde(default = "default_max_free_conns")]
    pub max_free_conns_per_host: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_dial_fail_silence")]
    pub dial_fail_silence_ms: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Window of the response-time moving average
    #[serde(default = "default_window_seconds")]
    pub response_time_seconds: u64,
    /// Window for counting errors and connect-failure streaks
    #[serde(default = "default_window_seconds")]
    pub error_seconds: u64,
    #[serde(default = "default_max_connect_errors")]
    pub max_connect_errors: u32,
    /// Response-time quantum (microseconds) below which nodes score equal
    #[serde(default = "default_score_deviation")]
    pub score_deviation: f64,
    /// Item-size sample window length
    #[serde(default = "default_item_size_stats")]
    pub item_size_stats: usize,
    /// Response-time floor (microseconds)
    #[serde(default = "default_response_time_min")]
    pub response_time_min: f64,

    #[serde(default = "default_true")]
    pub enable_read: bool,
    #[serde(default = "default_true")]
    pub enable_write: bool,
}

fn default_n() -> usize {
    3
}
fn default_w() -> usize {
    2
}
fn default_r() -> usize {
    1
}
fn default_max_free_conns() -> usize {
    20
}
fn default_connect_timeout() -> u64 {
    300
}
fn default_dial_fail_silence() -> u64 {
    5000
}
fn default_write_timeout() -> u64 {
    2000
}
fn default_read_timeout() -> u64 {
    2000
}
fn default_window_seconds() -> u64 {
    10
}
fn default_max_connect_errors() -> u32 {
    10
}
fn default_score_deviation() -> f64 {
    10_000.0
}
fn default_item_size_stats() -> usize {
    4096
}
fn default_response_time_min() -> f64 {
    4000.0
}
fn default_true() -> bool {
    true
}

impl Default for DStoreConfig {
    fn default() -> Self {
        Self {
            n: default_n(),
            w: default_w(),
            r: default_r(),
            max_free_conns_per_host: default_max_free_conns(),
            connect_timeout_ms: default_connect_timeout(),
            dial_fail_silence_ms: default_dial_fail_silence(),
            write_timeout_ms: default_write_timeout(),
            read_timeout_ms: default_read_timeout(),
            response_time_seconds: default_window_seconds(),
            error_seconds: default_window_seconds(),
            max_connect_errors: default_max_connect_errors(),
            score_deviation: default_score_deviation(),
            item_size_stats: default_item_size_stats(),
            response_time_min: default_response_time_min(),
            enable_read: true,
            enable_write: true,
        }
    }
}

impl DStoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn dial_fail_silence(&self) -> Duration {
        Duration::from_millis(self.dial_fail_silence_ms)
    }

    /// Live mains needed before a write may skip the backups
    pub fn main_threshold(&self) -> usize {
        self.n - self.w + 1
    }
}

/// Prefix switch table as written in `proxy.toml`
///
/// ```toml
/// [switch]
/// default_storage = "BRW"
///
/// [switch.prefixes]
/// BRW_CW = ["/user/", "/feed/"]
/// CRW = ["/archive/"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default = "default_storage")]
    pub default_storage: String,

    /// Stage name → key prefixes
    #[serde(default)]
    pub prefixes: BTreeMap<String, Vec<String>>,
}

fn default_storage() -> String {
    "BRW".to_string()
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            default_storage: default_storage(),
            prefixes: BTreeMap::new(),
        }
    }
}

/// REST endpoint of the new storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub endpoint: String,

    #[serde(default = "default_http_timeout")]
    pub timeout_ms: u64,
}

fn default_http_timeout() -> u64 {
    1000
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Memcache listener
    #[serde(default = "default_node_bind")]
    pub bind: String,

    /// REST listener, disabled when unset
    #[serde(default)]
    pub web: Option<String>,

    #[serde(default)]
    pub mc: ProtocolConfig,
}

fn default_node_bind() -> String {
    "0.0.0.0:7980".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: default_node_bind(),
            web: None,
            mc: ProtocolConfig::default(),
        }
    }
}

/// Route table as written in `route.toml`
///
/// Bucket ids are hex strings. A bucket id prefixed with `-` makes the node a
/// backup for that bucket; addresses in the top-level `backup` list back up
/// every bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    pub numbucket: usize,

    #[serde(default)]
    pub main: Vec<RouteEntry>,

    #[serde(default)]
    pub backup: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub addr: String,
    #[serde(default)]
    pub buckets: Vec<String>,
}

impl ProxyConfig {
    /// Load `proxy.toml` from a config directory
    pub fn load(confdir: impl AsRef<Path>) -> Result<Self> {
        let confdir = confdir.as_ref();
        let path = confdir.join(PROXY_CONFIG_FILE);
        let mut config: ProxyConfig = config::Config::builder()
            .add_source(config::File::from(path.as_path()).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("BEANPROXY").separator("__"))
            .build()?
            .try_deserialize()?;
        config.confdir = Some(confdir.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ProxyConfig = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check quorum sanity
    pub fn validate(&self) -> Result<()> {
        let d = &self.dstore;
        if d.n == 0 {
            return Err(Error::InvalidConfig("n must be at least 1".into()));
        }
        if d.w == 0 || d.w > d.n {
            return Err(Error::InvalidConfig(format!(
                "w must be in 1..={}, got {}",
                d.n, d.w
            )));
        }
        if d.r == 0 || d.r > d.n {
            return Err(Error::InvalidConfig(format!(
                "r must be in 1..={}, got {}",
                d.n, d.r
            )));
        }
        if d.score_deviation <= 0.0 {
            return Err(Error::InvalidConfig("score_deviation must be positive".into()));
        }
        if self.mc.max_key_len == 0 {
            return Err(Error::InvalidConfig("max_key_len must be positive".into()));
        }
        Ok(())
    }

    /// Re-read only the switch table from the config directory
    pub fn reload_switch(&self) -> Result<SwitchConfig> {
        let confdir = self
            .confdir
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no config directory".into()))?;
        Ok(ProxyConfig::load(confdir)?.switch)
    }

    /// Read `route.toml` next to `proxy.toml`
    pub fn load_route(&self) -> Result<RouteConfig> {
        let confdir = self
            .confdir
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no config directory".into()))?;
        RouteConfig::load(confdir.join(ROUTE_CONFIG_FILE))
    }
}

impl RouteConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Every address mentioned by the table
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .main
            .iter()
            .map(|e| e.addr.clone())
            .chain(self.backup.iter().cloned())
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::from_toml("").unwrap();
        assert_eq!(config.dstore.n, 3);
        assert_eq!(config.dstore.w, 2);
        assert_eq!(config.dstore.r, 1);
        assert_eq!(config.dstore.main_threshold(), 2);
        assert_eq!(config.mc.max_key_len, 250);
        assert_eq!(config.switch.default_storage, "BRW");
        assert!(config.new_backend.is_none());
    }

    #[test]
    fn test_parse_full_document() {
        let doc = r#"
            [proxy]
            port = 17905
            webport = 17908

            [dstore]
            n = 3
            w = 2
            r = 1
            read_timeout_ms = 500
            max_connect_errors = 3

            [switch]
            default_storage = "BRW"

            [switch.prefixes]
            BRW_CW = ["/user/"]

            [new_backend]
            endpoint = "http://127.0.0.1:7990"
        "#;
        let config = ProxyConfig::from_toml(doc).unwrap();
        assert_eq!(config.proxy.port, 17905);
        assert_eq!(config.dstore.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.dstore.max_connect_errors, 3);
        assert_eq!(config.switch.prefixes.len(), 1);
        assert_eq!(config.new_backend.unwrap().timeout_ms, 1000);
    }

    #[test]
    fn test_invalid_quorum() {
        assert!(ProxyConfig::from_toml("[dstore]\nn = 3\nw = 4").is_err());
        assert!(ProxyConfig::from_toml("[dstore]\nn = 3\nr = 0").is_err());
    }

    #[test]
    fn test_route_document() {
        let doc = r#"
            numbucket = 16
            backup = ["127.0.0.1:7983"]

            [[main]]
            addr = "127.0.0.1:7980"
            buckets = ["0", "1", "-2"]

            [[main]]
            addr = "127.0.0.1:7981"
            buckets = ["0", "1", "2"]
        "#;
        let route = RouteConfig::from_toml(doc).unwrap();
        assert_eq!(route.numbucket, 16);
        assert_eq!(route.main.len(), 2);
        assert_eq!(route.addresses().len(), 3);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROXY_CONFIG_FILE), "[dstore]\nw = 1\n").unwrap();
        std::fs::write(
            dir.path().join(ROUTE_CONFIG_FILE),
            "numbucket = 1\n[[main]]\naddr = \"127.0.0.1:1\"\nbuckets = [\"0\"]\n",
        )
        .unwrap();

        let config = ProxyConfig::load(dir.path()).unwrap();
        assert_eq!(config.dstore.w, 1);
        assert_eq!(config.confdir.as_deref(), Some(dir.path()));
        assert_eq!(config.load_route().unwrap().numbucket, 1);
    }
}
