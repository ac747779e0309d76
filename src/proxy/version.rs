//! Revision rules
//!
//! Revisions are signed: positive for live records, negative for tombstones.
//! Ordering is by magnitude, so a tombstone at `-4` is newer than a value at
//! `3`. Both the storage node and the coordinator use these rules.

use crate::common::{Item, RecordMeta};
use std::cmp::Ordering;

/// Anything carrying a revision
pub trait Versioned {
    fn revision(&self) -> i64;
}

impl Versioned for Item {
    fn revision(&self) -> i64 {
        self.rev
    }
}

impl Versioned for RecordMeta {
    fn revision(&self) -> i64 {
        self.rev
    }
}

impl<T: Versioned> Versioned for (String, T) {
    fn revision(&self) -> i64 {
        self.1.revision()
    }
}

pub fn is_tombstone(rev: i64) -> bool {
    rev < 0
}

/// Greater magnitude wins
pub fn compare(a: i64, b: i64) -> Ordering {
    a.unsigned_abs().cmp(&b.unsigned_abs())
}

/// Revision assigned to an auto-revisioned write
pub fn next_revision(stored: Option<i64>) -> i64 {
    match stored {
        Some(rev) => rev.saturating_abs().saturating_add(1),
        None => 1,
    }
}

/// Revision written by a delete of a record at `current`
pub fn tombstone_revision(current: i64) -> i64 {
    -(current.saturating_abs().max(1).saturating_add(1))
}

/// What a node does with a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Store under this revision
    Store(i64),
    /// Same revision already stored; keep the existing record
    Duplicate,
    /// Older than what is stored
    Stale { stored: i64 },
}

/// Decide a write of `requested` (0 = auto) against the stored revision
pub fn resolve_set(stored: Option<i64>, requested: i64) -> SetOutcome {
    if requested == 0 {
        return SetOutcome::Store(next_revision(stored));
    }
    let Some(stored) = stored else {
        return SetOutcome::Store(requested);
    };
    match compare(requested, stored) {
        Ordering::Greater => SetOutcome::Store(requested),
        Ordering::Equal => SetOutcome::Duplicate,
        Ordering::Less => SetOutcome::Stale { stored },
    }
}

/// The record with the strictly highest revision; the first seen wins ties
pub fn latest<T: Versioned>(records: impl IntoIterator<Item = T>) -> Option<T> {
    let mut best: Option<T> = None;
    for record in records {
        match &best {
            Some(current) if compare(record.revision(), current.revision()) != Ordering::Greater => {}
            _ => best = Some(record),
        }
    }
    best
}
