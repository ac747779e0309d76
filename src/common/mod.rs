//! Common utilities and types shared across beanproxy

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod protocol;
pub mod utils;

pub use config::{
    DStoreConfig, HttpBackendConfig, NodeConfig, ProtocolConfig, ProxyConfig, RouteConfig,
    RouteEntry, ServerConfig, SwitchConfig,
};
pub use error::{Error, Result};
pub use hash::{bucket_of, content_hash, divide_keys_by_bucket};
pub use metrics::METRICS;
pub use protocol::{Item, RecordMeta};
pub use utils::{encode_key, format_bytes, timestamp_now, validate_key, SwapCell};
