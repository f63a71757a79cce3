//! Full-state replication from the primary to every other node.
//!
//! A pass marks each target `pending`, pushes the complete record set to all of
//! them concurrently and records `synced` or `error` per target as each push
//! finishes. A failing or slow target never aborts the pass; its failure only
//! shows up in the status map. Pushes are whole-snapshot overwrites: the last
//! one a replica ingests wins.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::blocking_io;
use crate::cluster::{Node, NodeId, StatusMap, SyncStatus};
use crate::error::{Error, Result};
use crate::membership::Membership;
use crate::record::Record;
use crate::transport::Transport;

/// Bound on a single push, applied on top of whatever the transport does.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Replicator {
    membership: Arc<Membership>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Replicator {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Self {
        Self {
            membership,
            transport,
            timeout,
        }
    }

    /// Pushes `records` from `source` to every other node and waits for all of them.
    ///
    /// Only the current primary may originate a pass; anyone else gets
    /// [`Error::NotPrimary`]. Returns the cluster status map after the pass.
    pub async fn replicate_from(&self, source: &str, records: Vec<Record>) -> Result<StatusMap> {
        let state = self.cluster(|membership| membership.state()).await?;
        if state.primary != source {
            return Err(Error::NotPrimary {
                node: source.to_string(),
                primary: state.primary,
            });
        }

        let targets: Vec<Node> = self
            .membership
            .nodes()
            .iter()
            .filter(|node| node.id != source)
            .cloned()
            .collect();
        if targets.is_empty() {
            return Ok(state.status);
        }

        let ids: Vec<NodeId> = targets.iter().map(|node| node.id.clone()).collect();
        self.cluster(move |membership| membership.mark(&ids, SyncStatus::Pending))
            .await?;
        info!(
            source = %source,
            targets = targets.len(),
            records = records.len(),
            "replication pass started"
        );

        join_all(targets.iter().map(|target| self.push(target, &records))).await;

        self.cluster(|membership| membership.replication_status())
            .await
    }

    /// Runs [`Replicator::replicate_from`] on a background task.
    ///
    /// The caller does not wait; the outcome is only visible in the status map
    /// and the logs.
    pub fn spawn(self: &Arc<Self>, source: NodeId, records: Vec<Record>) -> JoinHandle<()> {
        let replicator = Arc::clone(self);
        tokio::spawn(async move {
            match replicator.replicate_from(&source, records).await {
                Ok(statuses) => debug!(?statuses, "background replication finished"),
                Err(Error::NotPrimary { primary, .. }) => {
                    debug!(%primary, "skipping background replication, primary moved")
                }
                Err(err) => warn!(error = %err, "background replication failed"),
            }
        })
    }

    async fn push(&self, target: &Node, records: &[Record]) -> SyncStatus {
        let status = match timeout(self.timeout, self.transport.send(target, records)).await {
            Ok(Ok(())) => {
                info!(node = %target.id, "replica synced");
                SyncStatus::Synced
            }
            Ok(Err(err)) => {
                warn!(node = %target.id, error = %err, "replication push failed");
                SyncStatus::Error
            }
            Err(_) => {
                warn!(node = %target.id, timeout = ?self.timeout, "replication push timed out");
                SyncStatus::Error
            }
        };

        let id = target.id.clone();
        let recorded = self
            .cluster(move |membership| membership.mark(&[id], status))
            .await;
        if let Err(err) = recorded {
            warn!(node = %target.id, error = %err, "failed to record replication status");
        }
        status
    }

    /// Cluster document access runs on the blocking pool.
    async fn cluster<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Membership) -> Result<T> + Send + 'static,
    {
        let membership = Arc::clone(&self.membership);
        blocking_io(move || op(&membership)).await
    }
}
