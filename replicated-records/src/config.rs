//! Startup configuration: resolves the command line into a validated
//! [`NodeConfig`] and wires the node's collaborators together.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

use crate::backend::FileBackend;
use crate::cli::Cli;
use crate::cluster::{ClusterState, FileClusterState, Node, NodeId};
use crate::membership::Membership;
use crate::node::NodeService;
use crate::replication::Replicator;
use crate::store::RecordStore;
use crate::transport::HttpTransport;

pub const CLUSTER_STATE_FILE: &str = "cluster_state.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: NodeId,
    pub listen: SocketAddr,
    /// Cluster members in configuration order.
    pub nodes: Vec<Node>,
    pub primary: NodeId,
    pub store_path: PathBuf,
    pub cluster_state_path: PathBuf,
    pub replication_timeout: Duration,
    pub auto_replicate: bool,
}

impl NodeConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let nodes = match &cli.nodes_file {
            Some(path) => load_nodes_file(path)?,
            None => parse_peers(&cli.peer)?,
        };
        let primary = match cli.primary {
            Some(primary) => primary,
            None => nodes
                .first()
                .map(|node| node.id.clone())
                .ok_or_else(|| anyhow!("no cluster nodes configured"))?,
        };

        let config = Self {
            store_path: cli.data_dir.join(format!("{}.json", cli.name)),
            cluster_state_path: cli
                .cluster_state
                .unwrap_or_else(|| cli.data_dir.join(CLUSTER_STATE_FILE)),
            name: cli.name,
            listen: cli.listen,
            nodes,
            primary,
            replication_timeout: Duration::from_millis(cli.replication_timeout_ms),
            auto_replicate: !cli.no_auto_replicate,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("at least one cluster node is required (include self)");
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                bail!("node id '{}' is configured more than once", node.id);
            }
        }
        if !seen.contains(self.name.as_str()) {
            bail!("node '{}' is not one of the configured nodes", self.name);
        }
        if !seen.contains(self.primary.as_str()) {
            bail!("primary '{}' is not one of the configured nodes", self.primary);
        }
        if self.replication_timeout.is_zero() {
            bail!("replication timeout must be positive");
        }
        Ok(())
    }

    /// Opens the durable store and shared document and assembles the node.
    pub fn build_service(&self) -> Result<Arc<NodeService>> {
        let backend = FileBackend::open(&self.store_path)
            .with_context(|| format!("opening record store {}", self.store_path.display()))?;
        let store = RecordStore::open(Box::new(backend))
            .with_context(|| format!("loading records from {}", self.store_path.display()))?;

        let shared = Arc::new(FileClusterState::new(
            &self.cluster_state_path,
            ClusterState::initial(&self.nodes, &self.primary),
        ));
        let membership = Arc::new(Membership::new(
            &self.name,
            self.nodes.clone(),
            &self.primary,
            shared,
        )?);

        let transport = HttpTransport::new(self.replication_timeout)
            .context("building replication HTTP client")?;
        let replicator = Arc::new(Replicator::new(
            Arc::clone(&membership),
            Arc::new(transport),
            self.replication_timeout,
        ));

        info!(
            node = %self.name,
            nodes = self.nodes.len(),
            primary = %self.primary,
            store = %self.store_path.display(),
            cluster_state = %self.cluster_state_path.display(),
            "node configured"
        );
        Ok(Arc::new(NodeService::new(
            store,
            membership,
            replicator,
            self.auto_replicate,
        )))
    }
}

/// Parses `id=url` entries, keeping their order.
pub fn parse_peers(entries: &[String]) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((id, address)) = entry.split_once('=') else {
            bail!("invalid peer entry '{entry}', expected id=url");
        };
        if id.is_empty() || address.is_empty() {
            bail!("invalid peer entry '{entry}', expected id=url");
        }
        nodes.push(Node::new(id, address));
    }
    Ok(nodes)
}

pub fn load_nodes_file(path: &Path) -> Result<Vec<Node>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading nodes file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing nodes file {}", path.display()))
}
