//! Cluster membership document: who is primary and how each node last synced.
//!
//! The document is the only state shared between node processes. It is read and
//! overwritten whole, without cross-process locking: concurrent writers race and
//! the last write observed wins. A process-local mutex only keeps this process's
//! own read-modify-write cycles from interleaving.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

pub type NodeId = String;

/// A cluster member as configured at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Base URL of the node's HTTP surface, e.g. `http://127.0.0.1:5001`.
    pub address: String,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

pub type StatusMap = BTreeMap<NodeId, SyncStatus>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub primary: NodeId,
    #[serde(rename = "replication_status", default)]
    pub status: StatusMap,
}

impl ClusterState {
    /// `primary` in charge and every node marked synced.
    pub fn initial(nodes: &[Node], primary: &str) -> Self {
        Self {
            primary: primary.to_string(),
            status: nodes
                .iter()
                .map(|node| (node.id.clone(), SyncStatus::Synced))
                .collect(),
        }
    }

    pub fn status_of(&self, node: &str) -> Option<SyncStatus> {
        self.status.get(node).copied()
    }

    pub fn set_status(&mut self, node: &str, status: SyncStatus) {
        self.status.insert(node.to_string(), status);
    }
}

/// Access to the shared cluster document.
pub trait ClusterStateStore: Send + Sync {
    fn load(&self) -> Result<ClusterState>;

    /// Loads, applies `change` and saves. Nothing is written if `change` fails.
    fn modify(
        &self,
        change: &mut dyn FnMut(&mut ClusterState) -> Result<()>,
    ) -> Result<ClusterState>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process document, shared by cloning an `Arc` between nodes.
#[derive(Debug)]
pub struct MemoryClusterState {
    state: Mutex<ClusterState>,
}

impl MemoryClusterState {
    pub fn new(initial: ClusterState) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }
}

impl ClusterStateStore for MemoryClusterState {
    fn load(&self) -> Result<ClusterState> {
        Ok(lock(&self.state).clone())
    }

    fn modify(
        &self,
        change: &mut dyn FnMut(&mut ClusterState) -> Result<()>,
    ) -> Result<ClusterState> {
        let mut guard = lock(&self.state);
        let mut next = guard.clone();
        change(&mut next)?;
        *guard = next.clone();
        Ok(next)
    }
}

/// JSON file shared by every node process on the host.
///
/// The file is created with the initial state on first access. Writes go
/// through a per-process temporary file and a rename so readers never see a
/// half-written document.
#[derive(Debug)]
pub struct FileClusterState {
    path: PathBuf,
    initial: ClusterState,
    guard: Mutex<()>,
}

impl FileClusterState {
    pub fn new(path: impl Into<PathBuf>, initial: ClusterState) -> Self {
        Self {
            path: path.into(),
            initial,
            guard: Mutex::new(()),
        }
    }

    fn read_or_init(&self) -> Result<ClusterState> {
        let display = self.path.display().to_string();
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .map_err(|err| StorageError::codec(&display, err))?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.write(&self.initial)?;
                Ok(self.initial.clone())
            }
            Err(err) => Err(StorageError::io(&display, err).into()),
        }
    }

    fn write(&self, state: &ClusterState) -> Result<()> {
        let display = self.path.display().to_string();
        if let Some(parent) = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(&display, err))?;
        }
        let encoded =
            serde_json::to_vec_pretty(state).map_err(|err| StorageError::codec(&display, err))?;
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, encoded)
            .map_err(|err| StorageError::io(tmp.display().to_string(), err))?;
        fs::rename(&tmp, &self.path).map_err(|err| StorageError::io(&display, err))?;
        Ok(())
    }
}

impl ClusterStateStore for FileClusterState {
    fn load(&self) -> Result<ClusterState> {
        let _guard = lock(&self.guard);
        self.read_or_init()
    }

    fn modify(
        &self,
        change: &mut dyn FnMut(&mut ClusterState) -> Result<()>,
    ) -> Result<ClusterState> {
        let _guard = lock(&self.guard);
        let mut state = self.read_or_init()?;
        change(&mut state)?;
        self.write(&state)?;
        Ok(state)
    }
}
