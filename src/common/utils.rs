//! Utility functions for beanproxy

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encoding set for keys placed in URL paths
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a key for URL usage
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Validate a client key: non-empty, bounded, no whitespace or control chars
pub fn validate_key(key: &str, max_len: usize) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidKey("key cannot be empty".into()));
    }

    if key.len() > max_len {
        return Err(crate::Error::InvalidKey(format!(
            "key too long (max {} bytes)",
            max_len
        )));
    }

    if key
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || c == char::REPLACEMENT_CHARACTER)
    {
        return Err(crate::Error::InvalidKey(
            "key contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Cell holding an immutable snapshot that is replaced as a whole.
///
/// Readers clone the `Arc` once and keep using that snapshot for the rest of
/// the request; a writer swaps the pointer without touching the old value.
#[derive(Debug)]
pub struct SwapCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T> SwapCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// Capture the current snapshot
    pub fn load(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the snapshot, returning the previous one
    pub fn store(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}
