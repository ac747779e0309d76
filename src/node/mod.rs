//! Storage node
//!
//! A single-process record store speaking the memcache subset the proxy uses
//! for its legacy cluster, plus a REST API (`/kv/{key}`) that serves as the
//! new storage family in tests and local setups.

pub mod http;
pub mod server;
pub mod store;

pub use server::{NodeHandle, NodeServer};
pub use store::RecordStore;

use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedStore = Arc<Mutex<RecordStore>>;

/// Lock the store; a poisoned lock still holds consistent records
pub fn lock(store: &SharedStore) -> MutexGuard<'_, RecordStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
