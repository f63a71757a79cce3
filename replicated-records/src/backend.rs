//! Durable key-value collaborator behind the record store.
//!
//! The store talks to persistence only through [`Backend`]: point reads, prefix
//! iteration and an all-or-nothing [`WriteBatch`] per logical operation. Values
//! are JSON documents so that the on-disk file stays human-readable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::error::{Result as CrateResult, StorageError};

/// Runs `work` on tokio's blocking pool; file-backed backends and cluster
/// documents do synchronous I/O.
pub(crate) async fn blocking_io<T, F>(work: F) -> CrateResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CrateResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(outcome) => outcome,
        Err(err) => Err(StorageError::io("blocking task", std::io::Error::other(err)).into()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// Writes belonging to one logical operation, applied together or not at all.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value,
        });
    }

    pub fn put_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), StorageError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|err| StorageError::codec(&key, err))?;
        self.put(key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(self, entries: &mut BTreeMap<String, Value>) {
        for op in self.ops {
            match op {
                WriteOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
    }
}

pub trait Backend: Send {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;

    /// Applies every write in `batch` durably, or none of them.
    fn commit(&mut self, batch: WriteBatch) -> Result<(), StorageError>;

    fn put(&mut self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.commit(batch)
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.commit(batch)
    }
}

fn scan(entries: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Volatile backend; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<String, Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(scan(&self.entries, prefix))
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<(), StorageError> {
        batch.apply_to(&mut self.entries);
        Ok(())
    }
}

/// Keeps the whole key space in one JSON file.
///
/// Every commit rewrites the file through a temporary sibling and a rename, so a
/// crash leaves either the previous or the new document on disk.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(&display, err))?;
        }

        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|err| StorageError::codec(&display, err))?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(StorageError::io(&display, err)),
        };

        Ok(Self { path, entries })
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let display = self.path.display().to_string();
        let encoded =
            serde_json::to_vec_pretty(entries).map_err(|err| StorageError::codec(&display, err))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded).map_err(|err| StorageError::io(tmp.display().to_string(), err))?;
        fs::rename(&tmp, &self.path).map_err(|err| StorageError::io(&display, err))
    }
}

impl Backend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(scan(&self.entries, prefix))
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut next = self.entries.clone();
        batch.apply_to(&mut next);
        self.persist(&next)?;
        self.entries = next;
        Ok(())
    }
}
