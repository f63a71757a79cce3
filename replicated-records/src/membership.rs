//! Primary designation and operator-driven failover.
//!
//! The primary is plain configuration state in the shared cluster document.
//! There are no heartbeats and no elections by vote: an operator declares the
//! primary failed ([`Membership::simulate_failure`]) or installs one directly
//! ([`Membership::restore_primary`]).

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cluster::{ClusterState, ClusterStateStore, Node, NodeId, StatusMap, SyncStatus};
use crate::error::{Error, Result};

/// Outcome of a successful failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failover {
    pub previous: NodeId,
    pub primary: NodeId,
}

/// Identity card of the local node plus its view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhoAmI {
    pub node: NodeId,
    pub address: String,
    pub primary: NodeId,
    pub replication_status: StatusMap,
}

pub struct Membership {
    local: Node,
    nodes: Vec<Node>,
    default_primary: NodeId,
    state: Arc<dyn ClusterStateStore>,
}

impl Membership {
    /// `nodes` is the static cluster in configuration order; that order decides
    /// which backup wins a failover.
    pub fn new(
        local: &str,
        nodes: Vec<Node>,
        default_primary: &str,
        state: Arc<dyn ClusterStateStore>,
    ) -> Result<Self> {
        let local = nodes
            .iter()
            .find(|node| node.id == local)
            .cloned()
            .ok_or_else(|| Error::UnknownNode {
                node: local.to_string(),
            })?;
        if !nodes.iter().any(|node| node.id == default_primary) {
            return Err(Error::UnknownNode {
                node: default_primary.to_string(),
            });
        }
        Ok(Self {
            local,
            nodes,
            default_primary: default_primary.to_string(),
            state,
        })
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn state(&self) -> Result<ClusterState> {
        self.state.load()
    }

    pub fn is_primary(&self, node: &str) -> Result<bool> {
        Ok(self.state.load()?.primary == node)
    }

    pub fn is_local_primary(&self) -> Result<bool> {
        self.is_primary(&self.local.id)
    }

    pub fn replication_status(&self) -> Result<StatusMap> {
        Ok(self.state.load()?.status)
    }

    /// Records `status` for every node in `nodes` in one write.
    pub fn mark(&self, nodes: &[NodeId], status: SyncStatus) -> Result<ClusterState> {
        self.state.modify(&mut |state| {
            for node in nodes {
                state.set_status(node, status);
            }
            Ok(())
        })
    }

    /// Marks the current primary failed and promotes the first synced backup.
    ///
    /// Fails with [`Error::NoBackupAvailable`] if no other node is synced, in
    /// which case the shared document is left untouched.
    pub fn simulate_failure(&self) -> Result<Failover> {
        let mut previous = NodeId::new();
        let result = self.state.modify(&mut |state| {
            previous = state.primary.clone();
            let mut next = state.clone();
            next.set_status(&previous, SyncStatus::Error);
            next.primary = elect_backup(&next, &self.nodes).ok_or_else(|| {
                Error::NoBackupAvailable {
                    failed: previous.clone(),
                }
            })?;
            *state = next;
            Ok(())
        });

        match result {
            Ok(state) => {
                let failover = Failover {
                    previous,
                    primary: state.primary,
                };
                info!(from = %failover.previous, to = %failover.primary, "primary failed over");
                Ok(failover)
            }
            Err(err) => {
                warn!(error = %err, "failover aborted");
                Err(err)
            }
        }
    }

    /// Installs `target` (default: the configured primary) as primary and marks it synced.
    ///
    /// This is an operator override: the node's health is not checked, only
    /// that it belongs to the cluster.
    pub fn restore_primary(&self, target: Option<&str>) -> Result<ClusterState> {
        let target = target.unwrap_or(self.default_primary.as_str());
        if self.node(target).is_none() {
            return Err(Error::UnknownNode {
                node: target.to_string(),
            });
        }

        let state = self.state.modify(&mut |state| {
            state.primary = target.to_string();
            state.set_status(target, SyncStatus::Synced);
            Ok(())
        })?;
        info!(primary = %target, "primary restored");
        Ok(state)
    }

    pub fn who_am_i(&self) -> Result<WhoAmI> {
        let state = self.state.load()?;
        Ok(WhoAmI {
            node: self.local.id.clone(),
            address: self.local.address.clone(),
            primary: state.primary,
            replication_status: state.status,
        })
    }
}

/// First node in `order` that is synced and is not the current primary.
pub fn elect_backup(state: &ClusterState, order: &[Node]) -> Option<NodeId> {
    order
        .iter()
        .filter(|node| node.id != state.primary)
        .find(|node| state.status_of(&node.id) == Some(SyncStatus::Synced))
        .map(|node| node.id.clone())
}
