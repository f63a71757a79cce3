use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueHint};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run one node of the replicated record store")]
pub struct Cli {
    /// Id of this node; must match one configured node.
    #[arg(long, default_value = "node_A")]
    pub name: String,

    /// Socket address the HTTP surface binds to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Cluster members as id=url, repeatable or comma-separated (must include self).
    #[arg(
        long,
        value_delimiter = ',',
        value_hint = ValueHint::Other,
        default_value = "node_A=http://127.0.0.1:5000,node_B=http://127.0.0.1:5001,node_C=http://127.0.0.1:5002"
    )]
    pub peer: Vec<String>,

    /// JSON file listing the cluster as [{"id": .., "address": ..}]; overrides --peer.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub nodes_file: Option<PathBuf>,

    /// Default primary. Falls back to the first configured node.
    #[arg(long)]
    pub primary: Option<String>,

    /// Directory holding this node's record file and the shared cluster document.
    #[arg(long, default_value = "data", value_hint = ValueHint::DirPath)]
    pub data_dir: PathBuf,

    /// Location of the shared cluster document (default: <data-dir>/cluster_state.json).
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub cluster_state: Option<PathBuf>,

    /// Upper bound on a single replication push, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub replication_timeout_ms: u64,

    /// Do not push to replicas in the background after each local write.
    #[arg(long)]
    pub no_auto_replicate: bool,
}
