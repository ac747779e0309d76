//! Per-request backend composition
//!
//! The switch table snapshot taken at the start of a request decides which
//! backend serves it. Reads go to the stage's primary; in `BW_CRW` a primary
//! miss is retried on the legacy store, which still holds keys that were
//! never rewritten since mirroring began. Writes go to the primary and, when
//! it succeeded, to the mirror; a mirror failure is logged on the
//! `dual_write` target and never reaches the client.

use crate::common::{Error, Item, RecordMeta, Result, METRICS};
use crate::proxy::backend::Backend;
use crate::proxy::buffer::{BufferStats, Shard};
use crate::proxy::switcher::{BackendSwitcher, Stage, Store, SwitchTable};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

pub struct Dispatcher {
    switcher: Arc<BackendSwitcher>,
    legacy: Arc<dyn Backend>,
    new: Option<Arc<dyn Backend>>,
    buffers: Arc<BufferStats>,
}

/// Time a backend call and count it per command and store
async fn timed<T, Fut>(cmd: &str, backend: &dyn Backend, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = fut.await;
    METRICS.record(cmd, backend.name(), start.elapsed(), result.is_ok());
    result
}

impl Dispatcher {
    pub fn new(
        switcher: Arc<BackendSwitcher>,
        legacy: Arc<dyn Backend>,
        new: Option<Arc<dyn Backend>>,
        buffers: Arc<BufferStats>,
    ) -> Self {
        Self {
            switcher,
            legacy,
            new,
            buffers,
        }
    }

    pub fn switcher(&self) -> &Arc<BackendSwitcher> {
        &self.switcher
    }

    pub fn buffers(&self) -> &Arc<BufferStats> {
        &self.buffers
    }

    /// A table may only be installed if every store it names is available
    pub fn check_table(&self, table: &SwitchTable) -> Result<()> {
        if self.new.is_none() && table.uses(Store::New) {
            return Err(Error::InvalidConfig(
                "switch table routes keys to the new backend, but none is configured".into(),
            ));
        }
        Ok(())
    }

    fn backend(&self, store: Store) -> Result<&dyn Backend> {
        match store {
            Store::Legacy => Ok(self.legacy.as_ref()),
            Store::New => self
                .new
                .as_deref()
                .ok_or(Error::BackendDisabled("new backend not configured")),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Item>> {
        let stage = self.switcher.route(key);
        let backend = self.backend(stage.primary())?;
        let found = timed("get", backend, backend.get(key)).await?;
        match (found, stage.fallback()) {
            (None, Some(fallback)) => {
                let backend = self.backend(fallback)?;
                timed("get", backend, backend.get(key)).await
            }
            (found, _) => Ok(found),
        }
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<RecordMeta>> {
        let stage = self.switcher.route(key);
        let backend = self.backend(stage.primary())?;
        let found = timed("getm", backend, backend.get_meta(key)).await?;
        match (found, stage.fallback()) {
            (None, Some(fallback)) => {
                let backend = self.backend(fallback)?;
                timed("getm", backend, backend.get_meta(key)).await
            }
            (found, _) => Ok(found),
        }
    }

    /// Keys are grouped by the primary store of their stage; misses in a
    /// stage with a fallback get a second round on that store
    pub async fn get_multi(&self, keys: &[String]) -> Result<Vec<(String, Item)>> {
        let table = self.switcher.snapshot();
        let mut groups: BTreeMap<Store, Vec<String>> = BTreeMap::new();
        for key in keys {
            groups
                .entry(table.route(key).primary())
                .or_default()
                .push(key.clone());
        }

        let mut found: BTreeMap<String, Item> = BTreeMap::new();
        for (store, group) in groups {
            let backend = self.backend(store)?;
            let values = timed("gets", backend, backend.get_multi(&group)).await?;
            found.extend(values);
        }

        let mut retries: BTreeMap<Store, Vec<String>> = BTreeMap::new();
        for key in keys {
            if found.contains_key(key) {
                continue;
            }
            if let Some(fallback) = table.route(key).fallback() {
                retries.entry(fallback).or_default().push(key.clone());
            }
        }
        for (store, group) in retries {
            let backend = self.backend(store)?;
            let values = timed("gets", backend, backend.get_multi(&group)).await?;
            found.extend(values);
        }

        Ok(keys
            .iter()
            .filter_map(|key| found.remove(key).map(|item| (key.clone(), item)))
            .collect())
    }

    pub async fn set(&self, key: &str, item: &Item) -> Result<()> {
        let _held = self.buffers.hold(Shard::SetData, item.len());
        let stage = self.switcher.route(key);
        let primary = self.backend(stage.primary())?;
        timed("set", primary, primary.set(key, item)).await?;

        if let Some(mirror) = stage.mirror() {
            let _mirrored = self.buffers.hold(Shard::MirrorData, item.len());
            let result = match self.backend(mirror) {
                Ok(backend) => timed("set", backend, backend.set(key, item)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.mirror_failed("set", key, stage, mirror, &e);
            }
        }
        Ok(())
    }

    /// In `BW_CRW` a key that only the legacy store held still reports as found
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let stage = self.switcher.route(key);
        let primary = self.backend(stage.primary())?;
        let mut found = timed("delete", primary, primary.delete(key)).await?;

        if let Some(mirror) = stage.mirror() {
            let result = match self.backend(mirror) {
                Ok(backend) => timed("delete", backend, backend.delete(key)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(mirror_found) if stage.fallback() == Some(mirror) => found |= mirror_found,
                Ok(_) => {}
                Err(e) => self.mirror_failed("delete", key, stage, mirror, &e),
            }
        }
        Ok(found)
    }

    fn mirror_failed(&self, cmd: &str, key: &str, stage: Stage, mirror: Store, err: &Error) {
        METRICS.dual_write_errors.inc();
        warn!(
            target: "dual_write",
            cmd,
            key,
            stage = %stage,
            store = mirror.name(),
            error = %err,
            "mirror write failed"
        );
    }
}
