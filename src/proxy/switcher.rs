//! Prefix-scoped migration between the legacy and the new backend
//!
//! Each key prefix sits at one stage of the migration:
//!
//! | stage    | code         | reads  | writes            |
//! |----------|--------------|--------|-------------------|
//! | `BRW`    | `br1w1cr0w0` | legacy | legacy            |
//! | `BRW_CW` | `br1w1cr0w1` | legacy | legacy, then new  |
//! | `BW_CRW` | `br0w1cr1w1` | new    | new, then legacy  |
//! | `CRW`    | `br0w0cr1w1` | new    | new               |

use crate::common::{Error, Result, SwapCell, SwitchConfig};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Store {
    Legacy,
    New,
}

impl Store {
    pub fn name(self) -> &'static str {
        match self {
            Store::Legacy => "legacy",
            Store::New => "new",
        }
    }
}

/// Migration stage, in forward order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Brw,
    BrwCw,
    BwCrw,
    Crw,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Brw, Stage::BrwCw, Stage::BwCrw, Stage::Crw];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Brw => "BRW",
            Stage::BrwCw => "BRW_CW",
            Stage::BwCrw => "BW_CRW",
            Stage::Crw => "CRW",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Stage::Brw => "br1w1cr0w0",
            Stage::BrwCw => "br1w1cr0w1",
            Stage::BwCrw => "br0w1cr1w1",
            Stage::Crw => "br0w0cr1w1",
        }
    }

    /// Serves reads and takes writes first
    pub fn primary(self) -> Store {
        match self {
            Stage::Brw | Stage::BrwCw => Store::Legacy,
            Stage::BwCrw | Stage::Crw => Store::New,
        }
    }

    /// Receives a copy of every successful write
    pub fn mirror(self) -> Option<Store> {
        match self {
            Stage::BrwCw => Some(Store::New),
            Stage::BwCrw => Some(Store::Legacy),
            Stage::Brw | Stage::Crw => None,
        }
    }

    /// Asked when the primary misses; it still holds keys written before
    /// the new store started receiving copies
    pub fn fallback(self) -> Option<Store> {
        match self {
            Stage::BwCrw => Some(Store::Legacy),
            Stage::Brw | Stage::BrwCw | Stage::Crw => None,
        }
    }

    pub fn uses(self, store: Store) -> bool {
        self.primary() == store || self.mirror() == Some(store)
    }

    /// Jumping straight between the two ends skips the mirrored stages
    pub fn is_unsafe_jump(self, to: Stage) -> bool {
        matches!(
            (self, to),
            (Stage::Brw, Stage::Crw) | (Stage::Crw, Stage::Brw)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| {
                stage.name().eq_ignore_ascii_case(s) || stage.code().eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| Error::InvalidConfig(format!("unknown storage stage {:?}", s)))
    }
}

impl Serialize for Stage {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

/// Immutable prefix → stage table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTable {
    default: Stage,
    /// Longest prefix first
    prefixes: Vec<(String, Stage)>,
}

impl SwitchTable {
    pub fn new(default: Stage) -> Self {
        Self {
            default,
            prefixes: Vec::new(),
        }
    }

    pub fn from_config(config: &SwitchConfig) -> Result<Self> {
        let default: Stage = config.default_storage.parse()?;
        let mut seen = BTreeSet::new();
        let mut prefixes = Vec::new();

        for (stage, list) in &config.prefixes {
            let stage: Stage = stage.parse()?;
            for prefix in list {
                if prefix.is_empty() {
                    return Err(Error::InvalidConfig("empty switch prefix".into()));
                }
                if !seen.insert(prefix.clone()) {
                    return Err(Error::InvalidConfig(format!(
                        "prefix {:?} assigned more than once",
                        prefix
                    )));
                }
                prefixes.push((prefix.clone(), stage));
            }
        }

        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Ok(Self { default, prefixes })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, stage: Stage) -> Self {
        let prefix = prefix.into();
        self.prefixes.retain(|(p, _)| *p != prefix);
        self.prefixes.push((prefix, stage));
        self.prefixes
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        self
    }

    pub fn default_stage(&self) -> Stage {
        self.default
    }

    /// Stage of the longest matching prefix, or the default
    pub fn route(&self, key: &str) -> Stage {
        self.prefixes
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, stage)| *stage)
            .unwrap_or(self.default)
    }

    /// Does any stage in the table touch `store`?
    pub fn uses(&self, store: Store) -> bool {
        self.default.uses(store)
            || self
                .prefixes
                .iter()
                .any(|(_, stage)| stage.uses(store))
    }

    /// Back to the document shape: stage name → prefixes
    pub fn to_config(&self) -> SwitchConfig {
        let mut prefixes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (prefix, stage) in &self.prefixes {
            prefixes
                .entry(stage.name().to_string())
                .or_default()
                .push(prefix.clone());
        }
        for list in prefixes.values_mut() {
            list.sort();
        }
        SwitchConfig {
            default_storage: self.default.name().to_string(),
            prefixes,
        }
    }
}

/// BackendSwitcher holds the live switch table.
#[derive(Debug)]
pub struct BackendSwitcher {
    table: SwapCell<SwitchTable>,
}

impl BackendSwitcher {
    pub fn new(table: SwitchTable) -> Self {
        Self {
            table: SwapCell::new(table),
        }
    }

    /// Snapshot to use for the whole of one request
    pub fn snapshot(&self) -> Arc<SwitchTable> {
        self.table.load()
    }

    pub fn route(&self, key: &str) -> Stage {
        self.table.load().route(key)
    }

    /// Replace the table; in-flight requests keep their snapshot
    pub fn reload(&self, next: SwitchTable) {
        let previous = self.table.load();

        if previous.default.is_unsafe_jump(next.default) {
            warn!(
                from = %previous.default,
                to = %next.default,
                "default storage jumps between BRW and CRW without a mirrored stage"
            );
        }
        let prefixes: BTreeSet<&str> = previous
            .prefixes
            .iter()
            .chain(next.prefixes.iter())
            .map(|(p, _)| p.as_str())
            .collect();
        for prefix in prefixes {
            let (from, to) = (previous.route(prefix), next.route(prefix));
            if from.is_unsafe_jump(to) {
                warn!(
                    prefix,
                    from = %from,
                    to = %to,
                    "prefix jumps between BRW and CRW without a mirrored stage"
                );
            }
        }

        info!(
            default = %next.default,
            prefixes = next.prefixes.len(),
            "switch table reloaded"
        );
        self.table.store(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(default: &str, entries: &[(&str, &[&str])]) -> SwitchConfig {
        SwitchConfig {
            default_storage: default.to_string(),
            prefixes: entries
                .iter()
                .map(|(stage, list)| {
                    (
                        stage.to_string(),
                        list.iter().map(|p| p.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_names_and_codes() {
        assert_eq!("BRW".parse::<Stage>().unwrap(), Stage::Brw);
        assert_eq!("brw_cw".parse::<Stage>().unwrap(), Stage::BrwCw);
        assert_eq!("br0w1cr1w1".parse::<Stage>().unwrap(), Stage::BwCrw);
        assert_eq!("BR0W0CR1W1".parse::<Stage>().unwrap(), Stage::Crw);
        assert!("BRWX".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_backends() {
        assert_eq!(Stage::Brw.primary(), Store::Legacy);
        assert_eq!(Stage::Brw.mirror(), None);
        assert_eq!(Stage::BrwCw.mirror(), Some(Store::New));
        assert_eq!(Stage::BwCrw.primary(), Store::New);
        assert_eq!(Stage::BwCrw.mirror(), Some(Store::Legacy));
        assert_eq!(Stage::Crw.mirror(), None);
        assert_eq!(Stage::BwCrw.fallback(), Some(Store::Legacy));
        assert_eq!(Stage::BrwCw.fallback(), None);
        assert_eq!(Stage::Crw.fallback(), None);
        assert!(Stage::Brw.is_unsafe_jump(Stage::Crw));
        assert!(!Stage::Brw.is_unsafe_jump(Stage::BrwCw));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = SwitchTable::from_config(&config(
            "BRW",
            &[("BRW_CW", &["/user/"]), ("CRW", &["/user/archive/"])],
        ))
        .unwrap();
        assert_eq!(table.route("/user/archive/1"), Stage::Crw);
        assert_eq!(table.route("/user/42"), Stage::BrwCw);
        assert_eq!(table.route("/feed/1"), Stage::Brw);
        assert!(table.uses(Store::New));
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let err = SwitchTable::from_config(&config(
            "BRW",
            &[("BRW_CW", &["/a/"]), ("CRW", &["/a/"])],
        ))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        assert!(SwitchTable::from_config(&config("NOPE", &[])).is_err());
        assert!(SwitchTable::from_config(&config("BRW", &[("BAD", &["/x/"])])).is_err());
    }

    #[test]
    fn test_to_config_roundtrip() {
        let original = config("br1w1cr0w0", &[("BW_CRW", &["/b/", "/a/"])]);
        let table = SwitchTable::from_config(&original).unwrap();
        let back = table.to_config();
        assert_eq!(back.default_storage, "BRW");
        assert_eq!(back.prefixes["BW_CRW"], vec!["/a/", "/b/"]);
        assert_eq!(SwitchTable::from_config(&back).unwrap(), table);
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let switcher = BackendSwitcher::new(SwitchTable::new(Stage::Brw));
        let before = switcher.snapshot();
        switcher.reload(SwitchTable::new(Stage::Brw).with_prefix("/m/", Stage::BrwCw));
        assert_eq!(before.route("/m/1"), Stage::Brw);
        assert_eq!(switcher.route("/m/1"), Stage::BrwCw);

        // Unsafe jumps are allowed, only logged
        switcher.reload(SwitchTable::new(Stage::Crw));
        assert_eq!(switcher.route("/m/1"), Stage::Crw);
    }
}
