//! Per-record version history: an undo stack and a redo stack of snapshots.
//!
//! The ledger only moves snapshots between the two stacks; the caller (the
//! [`crate::store::RecordStore`]) supplies the record's current visible state and
//! installs whatever snapshot the ledger hands back. Swapping the current state
//! into the opposite stack makes every undo exactly reversible by a redo and
//! vice versa.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{FieldMap, Record, RecordId};

/// Visible state of a record at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "fields", rename_all = "snake_case")]
pub enum Snapshot {
    /// The record did not exist.
    Absent,
    Active(FieldMap),
    /// The record sat in the tombstone set with these fields.
    Deleted(FieldMap),
}

impl Snapshot {
    /// Materialises the snapshot as a record, or `None` for [`Snapshot::Absent`].
    pub fn to_record(&self, id: &str) -> Option<Record> {
        match self {
            Snapshot::Absent => None,
            Snapshot::Active(fields) => Some(Record::active(id, fields.clone())),
            Snapshot::Deleted(fields) => Some(Record::tombstone(id, fields.clone())),
        }
    }
}

/// Undo and redo stacks of a single record, oldest entry first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub undo: Vec<Snapshot>,
    pub redo: Vec<Snapshot>,
}

impl History {
    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.redo.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct VersionLedger {
    entries: BTreeMap<RecordId, History>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes the pre-mutation state and discards any redo history for `id`.
    ///
    /// Called for every fresh write: create (`Absent`), update and delete
    /// (both with the pre-change `Active` fields).
    pub fn record_mutation(&mut self, id: &str, before: Snapshot) {
        let history = self.entries.entry(id.to_string()).or_default();
        history.undo.push(before);
        history.redo.clear();
    }

    /// Pops the latest undo snapshot and parks `current` on the redo stack.
    ///
    /// Returns the snapshot the caller must install as the new visible state.
    pub fn undo(&mut self, id: &str, current: Snapshot) -> Result<Snapshot> {
        let history = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NothingToUndo { id: id.to_string() })?;
        let latest = history
            .undo
            .pop()
            .ok_or_else(|| Error::NothingToUndo { id: id.to_string() })?;
        history.redo.push(current);
        Ok(latest)
    }

    /// Pops the latest redo snapshot and pushes `current` back onto the undo stack.
    pub fn redo(&mut self, id: &str, current: Snapshot) -> Result<Snapshot> {
        let history = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NothingToRedo { id: id.to_string() })?;
        let item = history
            .redo
            .pop()
            .ok_or_else(|| Error::NothingToRedo { id: id.to_string() })?;
        history.undo.push(current);
        Ok(item)
    }

    /// Undo stack for `id`, oldest first. Empty for unknown ids.
    pub fn history(&self, id: &str) -> &[Snapshot] {
        self.entries
            .get(id)
            .map(|history| history.undo.as_slice())
            .unwrap_or(&[])
    }

    pub fn entry(&self, id: &str) -> Option<&History> {
        self.entries.get(id)
    }

    /// Replaces the stored history of `id`; `None` or an empty history drops it.
    pub fn restore(&mut self, id: &str, history: Option<History>) {
        match history {
            Some(history) if !history.is_empty() => {
                self.entries.insert(id.to_string(), history);
            }
            _ => {
                self.entries.remove(id);
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.entries.keys()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
