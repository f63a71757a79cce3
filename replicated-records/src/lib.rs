//! Replicated record store with undo/redo and primary/replica replication.
//!
//! Every node keeps a full copy of a small collection of JSON records, each
//! with a soft-delete flag and its own undo/redo history. Exactly one node is
//! primary at a time; after local writes it pushes its complete record set to
//! every other node, and replicas replace their contents wholesale with what
//! they receive. Failover is operator driven: a failed primary is replaced by
//! the first synced backup in configuration order.
//!
//! # Modules
//!
//! - [`record`]: records, scalar field values and field validation
//! - [`ledger`]: per-record undo/redo stacks of state snapshots
//! - [`backend`]: durable key-value collaborator with all-or-nothing batches
//! - [`store`]: `RecordStore`, the local CRUD + undo/redo engine
//! - [`cluster`]: node descriptors and the shared cluster document
//! - [`membership`]: primary checks, failover and restore
//! - [`transport`]: delivery of replication payloads to other nodes
//! - [`replication`]: primary-gated fan-out, synchronous or in the background
//! - [`node`]: `NodeService`, the operation surface of one node
//! - [`api`]: HTTP/JSON routes over `NodeService`
//! - [`server`]: listener lifecycle and graceful shutdown
//! - [`cli`] / [`config`]: command line and startup wiring
//! - [`error`]: the crate error taxonomy
//!
//! Integration tests under `tests/` run whole clusters on ephemeral ports.

pub mod api;
pub mod backend;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod ledger;
pub mod membership;
pub mod node;
pub mod record;
pub mod replication;
pub mod server;
pub mod store;
pub mod transport;
