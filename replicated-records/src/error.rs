//! Error taxonomy shared by the record store, the cluster layer and the HTTP surface.
//!
//! Record-level errors are returned directly to the caller. Replication transport
//! failures never show up here: they are absorbed into the cluster status map
//! (see [`crate::transport::TransportError`]).

use thiserror::Error;

use crate::cluster::NodeId;
use crate::record::RecordId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of an operation on the node's operation surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown (or soft-deleted, for reads and writes) record id.
    #[error("record {id} not found")]
    NotFound { id: RecordId },

    #[error("nothing to undo for record {id}")]
    NothingToUndo { id: RecordId },

    #[error("nothing to redo for record {id}")]
    NothingToRedo { id: RecordId },

    /// Replication was requested on a node that is not the current primary.
    #[error("only the primary can run replication: {node} is not primary (primary is {primary})")]
    NotPrimary { node: NodeId, primary: NodeId },

    /// Failover found no synced node to promote; cluster state is left unchanged.
    #[error("no backup available to replace primary {failed}")]
    NoBackupAvailable { failed: NodeId },

    #[error("node {node} is not part of the cluster")]
    UnknownNode { node: NodeId },

    #[error("malformed input: {message}")]
    MalformedInput { message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedInput {
            message: message.into(),
        }
    }

    /// Stable classification string, used as the `error` field of API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::NothingToUndo { .. } => "nothing_to_undo",
            Error::NothingToRedo { .. } => "nothing_to_redo",
            Error::NotPrimary { .. } => "not_primary",
            Error::NoBackupAvailable { .. } => "no_backup_available",
            Error::UnknownNode { .. } => "unknown_node",
            Error::MalformedInput { .. } => "malformed_input",
            Error::Storage(_) => "storage",
        }
    }
}

/// Failures of the durable collaborators (record backend, shared cluster document).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode or decode {what}: {source}")]
    Codec {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn codec(what: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Codec {
            what: what.into(),
            source,
        }
    }
}
