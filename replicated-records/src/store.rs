//! Record store: active records, tombstones and their version ledger.
//!
//! The store is the node's local state machine. Every mutating call touches
//! three things for one record id (the visible record, its ledger entry and the
//! id counter) and commits them to the [`Backend`] as a single [`WriteBatch`].
//! If the commit fails, the in-memory state is rolled back so memory and disk
//! never disagree.
//!
//! The store itself is not synchronised; [`crate::node::NodeService`] serialises
//! access to it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::backend::{Backend, MemoryBackend, WriteBatch};
use crate::error::{Error, Result, StorageError};
use crate::ledger::{History, Snapshot, VersionLedger};
use crate::record::{self, FieldMap, Record, RecordId};

const RECORD_PREFIX: &str = "record/";
const LEDGER_PREFIX: &str = "ledger/";
const NEXT_SEQ_KEY: &str = "meta/next_seq";

pub struct RecordStore {
    backend: Box<dyn Backend>,
    active: BTreeMap<RecordId, FieldMap>,
    tombstones: BTreeMap<RecordId, FieldMap>,
    ledger: VersionLedger,
    next_seq: u64,
}

impl RecordStore {
    /// Empty store without durable persistence.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            active: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            ledger: VersionLedger::new(),
            next_seq: 1,
        }
    }

    /// Rebuilds records, tombstones and undo/redo history from `backend`.
    pub fn open(backend: Box<dyn Backend>) -> Result<Self> {
        let mut store = Self {
            backend,
            active: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            ledger: VersionLedger::new(),
            next_seq: 1,
        };

        for (key, value) in store.backend.iterate(RECORD_PREFIX)? {
            let record: Record =
                serde_json::from_value(value).map_err(|err| StorageError::codec(&key, err))?;
            store.bump_sequence(&record.id)?;
            if record.deleted {
                store.tombstones.insert(record.id, record.fields);
            } else {
                store.active.insert(record.id, record.fields);
            }
        }

        for (key, value) in store.backend.iterate(LEDGER_PREFIX)? {
            let history: History =
                serde_json::from_value(value).map_err(|err| StorageError::codec(&key, err))?;
            let id = &key[LEDGER_PREFIX.len()..];
            store.bump_sequence(id)?;
            store.ledger.restore(id, Some(history));
        }

        if let Some(value) = store.backend.get(NEXT_SEQ_KEY)? {
            let persisted: u64 = serde_json::from_value(value)
                .map_err(|err| StorageError::codec(NEXT_SEQ_KEY, err))?;
            store.next_seq = store.next_seq.max(persisted);
        }

        debug!(
            active = store.active.len(),
            tombstones = store.tombstones.len(),
            next_seq = store.next_seq,
            "record store loaded"
        );
        Ok(store)
    }

    /// Inserts a new active record under a freshly allocated `p<n>` id.
    pub fn create(&mut self, fields: FieldMap) -> Result<Record> {
        record::validate_new(&fields)?;
        let id = format!("p{}", self.next_seq);

        self.transact(&id, |store| {
            store.next_seq = store
                .next_seq
                .checked_add(1)
                .ok_or_else(|| Error::malformed("record id sequence exhausted"))?;
            store.ledger.record_mutation(&id, Snapshot::Absent);
            store.install(&id, Snapshot::Active(fields.clone()));
            Ok(Record::active(id.clone(), fields))
        })
    }

    /// Returns an active record. Tombstoned ids are reported as not found.
    pub fn get(&self, id: &str) -> Result<Record> {
        self.active
            .get(id)
            .map(|fields| Record::active(id, fields.clone()))
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    /// Merges `patch` into an active record.
    pub fn update(&mut self, id: &str, patch: FieldMap) -> Result<Record> {
        record::validate_patch(&patch)?;

        self.transact(id, |store| {
            let before = store.active_fields(id)?;
            let merged = record::merge(&before, patch);
            store.ledger.record_mutation(id, Snapshot::Active(before));
            store.install(id, Snapshot::Active(merged.clone()));
            Ok(Record::active(id, merged))
        })
    }

    /// Soft-deletes an active record into the tombstone set.
    pub fn delete(&mut self, id: &str) -> Result<Record> {
        self.transact(id, |store| {
            let before = store.active_fields(id)?;
            store.ledger.record_mutation(id, Snapshot::Active(before.clone()));
            store.install(id, Snapshot::Deleted(before.clone()));
            Ok(Record::tombstone(id, before))
        })
    }

    /// Reverts the latest change to `id`. `None` means the record no longer exists.
    pub fn undo(&mut self, id: &str) -> Result<Option<Record>> {
        self.transact(id, |store| {
            let current = store.visible(id);
            let target = store.ledger.undo(id, current)?;
            store.install(id, target.clone());
            Ok(target.to_record(id))
        })
    }

    /// Re-applies the most recently undone change to `id`.
    pub fn redo(&mut self, id: &str) -> Result<Option<Record>> {
        self.transact(id, |store| {
            let current = store.visible(id);
            let target = store.ledger.redo(id, current)?;
            store.install(id, target.clone());
            Ok(target.to_record(id))
        })
    }

    pub fn history(&self, id: &str) -> Vec<Snapshot> {
        self.ledger.history(id).to_vec()
    }

    pub fn list_active(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .active
            .iter()
            .map(|(id, fields)| Record::active(id.clone(), fields.clone()))
            .collect();
        records.sort_by(|a, b| compare_ids(&a.id, &b.id));
        records
    }

    /// Active and tombstoned records, each carrying its `deleted` flag.
    pub fn list_all(&self) -> Vec<Record> {
        let mut records = self.list_active();
        records.extend(
            self.tombstones
                .iter()
                .map(|(id, fields)| Record::tombstone(id.clone(), fields.clone())),
        );
        records.sort_by(|a, b| compare_ids(&a.id, &b.id));
        records
    }

    /// Replaces the whole record set with `records` and drops all version history.
    ///
    /// Used when ingesting a replication push: the incoming snapshot wins
    /// wholesale, no merge is attempted. Returns the number of records installed.
    pub fn replace_all(&mut self, records: Vec<Record>) -> Result<usize> {
        let mut active = BTreeMap::new();
        let mut tombstones = BTreeMap::new();
        let mut next_seq = self.next_seq;

        for record in records {
            if record.id.trim().is_empty() {
                return Err(Error::malformed("replicated record without an id"));
            }
            record::validate_new(&record.fields)?;
            if let Some(seq) = sequence_of(&record.id) {
                let after = seq
                    .checked_add(1)
                    .ok_or_else(|| Error::malformed("record id sequence out of range"))?;
                next_seq = next_seq.max(after);
            }
            // Later duplicates win, matching a map insert on the sending side.
            active.remove(&record.id);
            tombstones.remove(&record.id);
            if record.deleted {
                tombstones.insert(record.id, record.fields);
            } else {
                active.insert(record.id, record.fields);
            }
        }

        let mut batch = WriteBatch::new();
        for id in self
            .active
            .keys()
            .chain(self.tombstones.keys())
            .filter(|id| !active.contains_key(*id) && !tombstones.contains_key(*id))
        {
            batch.delete(record_key(id));
        }
        for id in self.ledger.ids() {
            batch.delete(ledger_key(id));
        }
        for (id, fields) in &active {
            batch.put_json(record_key(id), &Record::active(id.clone(), fields.clone()))?;
        }
        for (id, fields) in &tombstones {
            batch.put_json(record_key(id), &Record::tombstone(id.clone(), fields.clone()))?;
        }
        batch.put_json(NEXT_SEQ_KEY, &next_seq)?;
        self.backend.commit(batch)?;

        let installed = active.len() + tombstones.len();
        self.active = active;
        self.tombstones = tombstones;
        self.ledger.clear();
        self.next_seq = next_seq;
        debug!(records = installed, next_seq, "record set replaced");
        Ok(installed)
    }

    fn active_fields(&self, id: &str) -> Result<FieldMap> {
        self.active
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    fn visible(&self, id: &str) -> Snapshot {
        if let Some(fields) = self.active.get(id) {
            Snapshot::Active(fields.clone())
        } else if let Some(fields) = self.tombstones.get(id) {
            Snapshot::Deleted(fields.clone())
        } else {
            Snapshot::Absent
        }
    }

    fn install(&mut self, id: &str, snapshot: Snapshot) {
        self.active.remove(id);
        self.tombstones.remove(id);
        match snapshot {
            Snapshot::Absent => {}
            Snapshot::Active(fields) => {
                self.active.insert(id.to_string(), fields);
            }
            Snapshot::Deleted(fields) => {
                self.tombstones.insert(id.to_string(), fields);
            }
        }
    }

    /// Runs `op` against the state of `id` and commits the result as one batch.
    ///
    /// On any error, from `op` or from the backend, the record, its history and
    /// the id counter are restored to what they were before the call.
    fn transact<T>(&mut self, id: &str, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved_visible = self.visible(id);
        let saved_history = self.ledger.entry(id).cloned();
        let saved_seq = self.next_seq;

        let outcome = op(self).and_then(|value| {
            self.commit_id(id)?;
            Ok(value)
        });

        if outcome.is_err() {
            self.install(id, saved_visible);
            self.ledger.restore(id, saved_history);
            self.next_seq = saved_seq;
        }
        outcome
    }

    fn commit_id(&mut self, id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        match self.visible(id).to_record(id) {
            Some(record) => batch.put_json(record_key(id), &record)?,
            None => batch.delete(record_key(id)),
        }
        match self.ledger.entry(id) {
            Some(history) => batch.put_json(ledger_key(id), history)?,
            None => batch.delete(ledger_key(id)),
        }
        batch.put_json(NEXT_SEQ_KEY, &self.next_seq)?;
        self.backend.commit(batch)?;
        Ok(())
    }

    fn bump_sequence(&mut self, id: &str) -> Result<(), StorageError> {
        if let Some(seq) = sequence_of(id) {
            let after = seq.checked_add(1).ok_or_else(|| {
                StorageError::codec(
                    id,
                    serde::de::Error::custom("record id sequence out of range"),
                )
            })?;
            self.next_seq = self.next_seq.max(after);
        }
        Ok(())
    }
}

fn record_key(id: &str) -> String {
    format!("{RECORD_PREFIX}{id}")
}

fn ledger_key(id: &str) -> String {
    format!("{LEDGER_PREFIX}{id}")
}

/// Numeric part of a store-allocated `p<n>` id.
fn sequence_of(id: &str) -> Option<u64> {
    id.strip_prefix('p')?.parse().ok()
}

/// Orders `p2` before `p10`; ids not allocated by a store sort after, by text.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (sequence_of(a), sequence_of(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use crate::record::{fields, Scalar};

    fn alice() -> FieldMap {
        fields([("name", Scalar::from("Alice")), ("age", Scalar::from(25i64))])
    }

    fn age_of(record: &Record) -> Option<&Scalar> {
        record.field("age")
    }

    #[test]
    fn create_allocates_sequential_ids() {
        let mut store = RecordStore::in_memory();
        let first = store.create(alice()).expect("create");
        let second = store.create(fields([("name", "Bob")])).expect("create");
        assert_eq!(first.id, "p1");
        assert_eq!(second.id, "p2");
        assert!(!first.deleted);
    }

    #[test]
    fn create_rejects_missing_name() {
        let mut store = RecordStore::in_memory();
        let result = store.create(fields([("age", 3i64)]));
        assert!(matches!(result, Err(Error::MalformedInput { .. })));
        assert!(store.list_all().is_empty());
        assert_eq!(store.create(alice()).expect("create").id, "p1");
    }

    #[test]
    fn update_merges_fields() {
        let mut store = RecordStore::in_memory();
        let id = store.create(alice()).expect("create").id;
        let updated = store.update(&id, fields([("age", 26i64)])).expect("update");
        assert_eq!(updated.field("name"), Some(&Scalar::from("Alice")));
        assert_eq!(age_of(&updated), Some(&Scalar::Int(26)));
    }

    #[test]
    fn update_and_delete_unknown_ids_are_not_found() {
        let mut store = RecordStore::in_memory();
        assert!(matches!(
            store.update("p9", fields([("age", 1i64)])),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(store.delete("p9"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn update_then_undo_then_redo_is_inverse() {
        let mut store = RecordStore::in_memory();
        let id = store.create(alice()).expect("create").id;
        store.update(&id, fields([("age", 26i64)])).expect("update");

        let undone = store.undo(&id).expect("undo").expect("record still exists");
        assert_eq!(undone.fields, alice());
        assert_eq!(store.get(&id).expect("get").fields, alice());

        let redone = store.redo(&id).expect("redo").expect("record still exists");
        assert_eq!(age_of(&redone), Some(&Scalar::Int(26)));
        assert_eq!(store.get(&id).expect("get"), redone);
    }

    #[test]
    fn fresh_update_after_undo_invalidates_redo() {
        let mut store = RecordStore::in_memory();
        let id = store.create(alice()).expect("create").id;
        store.update(&id, fields([("age", 26i64)])).expect("update");
        store.undo(&id).expect("undo");
        store.update(&id, fields([("age", 40i64)])).expect("update");

        assert!(matches!(store.redo(&id), Err(Error::NothingToRedo { .. })));
        assert_eq!(age_of(&store.get(&id).expect("get")), Some(&Scalar::Int(40)));
    }

    #[test]
    fn undoing_creation_removes_record() {
        let mut store = RecordStore::in_memory();
        let id = store.create(alice()).expect("create").id;

        assert_eq!(store.undo(&id).expect("undo"), None);
        assert!(matches!(store.get(&id), Err(Error::NotFound { .. })));
        assert!(store.list_all().is_empty());
        assert!(matches!(store.undo(&id), Err(Error::NothingToUndo { .. })));

        // Redo brings the creation back.
        let restored = store.redo(&id).expect("redo").expect("recreated");
        assert_eq!(restored.fields, alice());
    }

    #[test]
    fn delete_then_undo_twice_walks_back_through_versions() {
        let mut store = RecordStore::in_memory();
        let id = store.create(alice()).expect("create").id;
        store.update(&id, fields([("age", 26i64)])).expect("update");
        store.delete(&id).expect("delete");

        assert!(matches!(store.get(&id), Err(Error::NotFound { .. })));
        assert!(store.list_active().is_empty());
        let all = store.list_all();
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted);

        let reactivated = store.undo(&id).expect("undo").expect("record");
        assert!(!reactivated.deleted);
        assert_eq!(age_of(&reactivated), Some(&Scalar::Int(26)));
        assert_eq!(store.list_active().len(), 1);

        let original = store.undo(&id).expect("undo").expect("record");
        assert_eq!(original.fields, alice());
    }

    #[test]
    fn redo_of_delete_tombstones_again() {
        let mut store = RecordStore::in_memory();
        let id = store.create(alice()).expect("create").id;
        store.delete(&id).expect("delete");
        store.undo(&id).expect("undo");

        let redone = store.redo(&id).expect("redo").expect("record");
        assert!(redone.deleted);
        assert!(store.list_active().is_empty());
        assert!(matches!(store.delete(&id), Err(Error::NotFound { .. })));
    }

    #[test]
    fn history_lists_undo_stack_oldest_first() {
        let mut store = RecordStore::in_memory();
        let id = store.create(alice()).expect("create").id;
        store.update(&id, fields([("age", 26i64)])).expect("update");

        assert_eq!(
            store.history(&id),
            vec![Snapshot::Absent, Snapshot::Active(alice())]
        );
        assert!(store.history("p42").is_empty());
    }

    #[test]
    fn list_all_orders_ids_numerically() {
        let mut store = RecordStore::in_memory();
        for n in 0..11 {
            store
                .create(fields([("name", format!("user-{n}"))]))
                .expect("create");
        }
        let ids: Vec<String> = store.list_all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids.first().map(String::as_str), Some("p1"));
        assert_eq!(ids.get(1).map(String::as_str), Some("p2"));
        assert_eq!(ids.last().map(String::as_str), Some("p11"));
    }

    #[test]
    fn replace_all_overwrites_records_and_history() {
        let mut store = RecordStore::in_memory();
        let local = store.create(fields([("name", "Local")])).expect("create").id;

        let incoming = vec![
            Record::active("p1", alice()),
            Record::tombstone("p7", fields([("name", "Gone")])),
        ];
        assert_eq!(store.replace_all(incoming.clone()).expect("replace"), 2);

        assert_eq!(store.list_all(), incoming);
        assert!(store.history(&local).is_empty());
        assert!(matches!(store.undo(&local), Err(Error::NothingToUndo { .. })));
        // Counter moves past every replicated id.
        assert_eq!(store.create(fields([("name", "Next")])).expect("create").id, "p8");
    }

    #[test]
    fn replace_all_twice_is_idempotent() {
        let mut store = RecordStore::in_memory();
        let payload = vec![Record::active("p1", alice()), Record::active("p2", alice())];

        store.replace_all(payload.clone()).expect("first");
        let first = store.list_active();
        store.replace_all(payload).expect("second");
        assert_eq!(store.list_active(), first);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn replace_all_rejects_invalid_payload_without_changes() {
        let mut store = RecordStore::in_memory();
        store.create(alice()).expect("create");

        let result = store.replace_all(vec![Record::active("", alice())]);
        assert!(matches!(result, Err(Error::MalformedInput { .. })));
        assert_eq!(store.list_active().len(), 1);
    }

    #[test]
    fn replace_all_rejects_ids_past_the_sequence_range() {
        let mut store = RecordStore::in_memory();
        store.create(alice()).expect("create");

        let result = store.replace_all(vec![Record::active("p18446744073709551615", alice())]);
        assert!(matches!(result, Err(Error::MalformedInput { .. })));
        assert_eq!(store.list_all(), vec![Record::active("p1", alice())]);
        assert_eq!(store.create(alice()).expect("create").id, "p2");
    }

    #[test]
    fn open_rejects_persisted_ids_past_the_sequence_range() {
        let mut backend = MemoryBackend::new();
        let record = Record::active("p18446744073709551615", alice());
        backend
            .put(
                "record/p18446744073709551615",
                serde_json::to_value(&record).expect("encode"),
            )
            .expect("put");

        let result = RecordStore::open(Box::new(backend));
        assert!(matches!(result, Err(Error::Storage(StorageError::Codec { .. }))));
    }

    #[test]
    fn create_fails_cleanly_when_sequence_is_exhausted() {
        let mut store = RecordStore::in_memory();
        store.next_seq = u64::MAX;

        let result = store.create(alice());
        assert!(matches!(result, Err(Error::MalformedInput { .. })));
        assert!(store.list_all().is_empty());
        assert!(store.history(&format!("p{}", u64::MAX)).is_empty());
        assert_eq!(store.next_seq, u64::MAX);
    }

    #[test]
    fn reopen_restores_records_tombstones_and_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node_A.json");

        let (kept, removed) = {
            let backend = FileBackend::open(&path).expect("open");
            let mut store = RecordStore::open(Box::new(backend)).expect("store");
            let kept = store.create(alice()).expect("create").id;
            store.update(&kept, fields([("age", 26i64)])).expect("update");
            let removed = store.create(fields([("name", "Bob")])).expect("create").id;
            store.delete(&removed).expect("delete");
            (kept, removed)
        };

        let backend = FileBackend::open(&path).expect("reopen");
        let mut store = RecordStore::open(Box::new(backend)).expect("store");
        assert_eq!(age_of(&store.get(&kept).expect("get")), Some(&Scalar::Int(26)));
        assert!(store.list_all().iter().any(|r| r.id == removed && r.deleted));

        let undone = store.undo(&kept).expect("undo").expect("record");
        assert_eq!(undone.fields, alice());
        assert_eq!(store.create(alice()).expect("create").id, "p3");
    }

    struct RefusingBackend {
        inner: MemoryBackend,
        refuse: bool,
    }

    impl Backend for RefusingBackend {
        fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.get(key)
        }

        fn iterate(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
            self.inner.iterate(prefix)
        }

        fn commit(&mut self, batch: WriteBatch) -> Result<(), StorageError> {
            if self.refuse {
                return Err(StorageError::io(
                    "refusing",
                    std::io::Error::other("disk full"),
                ));
            }
            self.inner.commit(batch)
        }
    }

    #[test]
    fn failed_commit_rolls_back_memory() {
        let backend = RefusingBackend {
            inner: MemoryBackend::new(),
            refuse: true,
        };
        let mut store = RecordStore::open(Box::new(backend)).expect("store");

        let result = store.create(alice());
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(store.list_all().is_empty());
        assert!(store.history("p1").is_empty());
    }
}
