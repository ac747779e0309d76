//! Storage backends behind the switcher
//!
//! - [`LegacyBackend`]: the replicated memcache node cluster
//! - [`HttpBackend`]: a REST key-value service (`/kv/{key}`)

use crate::common::{encode_key, Error, HttpBackendConfig, Item, RecordMeta, Result};
use crate::proxy::replication::ReplicationCoordinator;
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

pub const HEADER_FLAGS: &str = "x-flags";
pub const HEADER_REVISION: &str = "x-revision";

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in metrics and logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Item>>;

    async fn get_meta(&self, key: &str) -> Result<Option<RecordMeta>>;

    async fn set(&self, key: &str, item: &Item) -> Result<()>;

    /// `true` when the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Found keys only, in request order
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<(String, Item)>>;
}

/// The replicated node cluster
pub struct LegacyBackend {
    coordinator: Arc<ReplicationCoordinator>,
    enable_read: bool,
    enable_write: bool,
}

impl LegacyBackend {
    pub fn new(
        coordinator: Arc<ReplicationCoordinator>,
        enable_read: bool,
        enable_write: bool,
    ) -> Self {
        Self {
            coordinator,
            enable_read,
            enable_write,
        }
    }

    fn check_read(&self) -> Result<()> {
        if self.enable_read {
            Ok(())
        } else {
            Err(Error::BackendDisabled("legacy reads"))
        }
    }

    fn check_write(&self) -> Result<()> {
        if self.enable_write {
            Ok(())
        } else {
            Err(Error::BackendDisabled("legacy writes"))
        }
    }
}

#[async_trait]
impl Backend for LegacyBackend {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>> {
        self.check_read()?;
        self.coordinator.read(key).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<RecordMeta>> {
        self.check_read()?;
        self.coordinator.read_meta(key).await
    }

    async fn set(&self, key: &str, item: &Item) -> Result<()> {
        self.check_write()?;
        self.coordinator.write(key, item).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_write()?;
        self.coordinator.delete(key).await
    }

    async fn get_multi(&self, keys: &[String]) -> Result<Vec<(String, Item)>> {
        self.check_read()?;
        self.coordinator.get_multi(keys).await
    }
}

/// REST client for the new storage family
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBackend {
    pub fn new(config: &HttpBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.endpoint, encode_key(key))
    }

    fn unexpected(&self, status: StatusCode, key: &str) -> Error {
        Error::Http(format!("{} for key {} from {}", status, key, self.endpoint))
    }
}

fn header_value<T: std::str::FromStr>(
    headers: &reqwest::header::HeaderMap,
    name: &str,
) -> Option<T> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "new"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>> {
        let response = self.client.get(self.url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let headers = response.headers().clone();
                let flags = header_value(&headers, HEADER_FLAGS).unwrap_or(0);
                let rev = header_value(&headers, HEADER_REVISION).unwrap_or(0);
                let body = response.bytes().await?;
                Ok(Some(Item::new(flags, body).with_rev(rev)))
            }
            status => Err(self.unexpected(status, key)),
        }
    }

    async fn get_meta(&self, key: &str) -> Result<Option<RecordMeta>> {
        let url = format!("{}/meta", self.url(key));
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(self.unexpected(status, key)),
        }
    }

    async fn set(&self, key: &str, item: &Item) -> Result<()> {
        let response = self
            .client
            .put(self.url(key))
            .header(HEADER_FLAGS, item.flags.to_string())
            .header(HEADER_REVISION, item.rev.to_string())
            .body(item.value.clone())
            .send()
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Err(Error::VersionConflict(key.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(self.unexpected(status, key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response = self.client.delete(self.url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(self.unexpected(status, key)),
        }
    }

    async fn get_multi(&self, keys: &[String]) -> Result<Vec<(String, Item)>> {
        let mut fetches: FuturesUnordered<_> = keys
            .iter()
            .enumerate()
            .map(|(idx, key)| async move { (idx, self.get(key).await) })
            .collect();

        let mut found = Vec::new();
        while let Some((idx, result)) = fetches.next().await {
            if let Some(item) = result? {
                found.push((idx, item));
            }
        }
        found.sort_by_key(|(idx, _)| *idx);
        Ok(found
            .into_iter()
            .map(|(idx, item)| (keys[idx].clone(), item))
            .collect())
    }
}
