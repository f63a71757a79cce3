//! Harness for running whole clusters in-process over real HTTP.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use replicated_records::cluster::{ClusterState, MemoryClusterState, Node};
use replicated_records::membership::Membership;
use replicated_records::node::NodeService;
use replicated_records::replication::Replicator;
use replicated_records::server::Server;
use replicated_records::store::RecordStore;
use replicated_records::transport::HttpTransport;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Nodes sharing one in-memory cluster document, each served on an ephemeral port.
pub struct TestCluster {
    pub nodes: Vec<Node>,
    pub services: HashMap<String, Arc<NodeService>>,
    client: reqwest::Client,
    _shutdown: Vec<oneshot::Sender<()>>,
    _servers: Vec<JoinHandle<()>>,
}

impl TestCluster {
    /// Starts every node in `names` except those listed in `offline`, whose
    /// addresses point at ports nobody listens on. The first name is primary.
    pub async fn spawn(names: &[&str], offline: &[&str], auto_replicate: bool) -> Result<Self> {
        let mut listeners = Vec::new();
        let mut nodes = Vec::new();
        for name in names {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            nodes.push(Node::new(*name, format!("http://{addr}")));
            if offline.contains(name) {
                drop(listener);
            } else {
                listeners.push((name.to_string(), listener));
            }
        }

        let shared = Arc::new(MemoryClusterState::new(ClusterState::initial(
            &nodes, names[0],
        )));

        let mut services = HashMap::new();
        let mut shutdown = Vec::new();
        let mut servers = Vec::new();
        for (name, listener) in listeners {
            let membership = Arc::new(Membership::new(
                &name,
                nodes.clone(),
                names[0],
                shared.clone(),
            )?);
            let replicator = Arc::new(Replicator::new(
                Arc::clone(&membership),
                Arc::new(HttpTransport::new(PUSH_TIMEOUT)?),
                PUSH_TIMEOUT,
            ));
            let service = Arc::new(NodeService::new(
                RecordStore::in_memory(),
                membership,
                replicator,
                auto_replicate,
            ));

            let (tx, rx) = oneshot::channel::<()>();
            let server = Server::new(listener, Arc::clone(&service));
            servers.push(tokio::spawn(async move {
                let _ = server
                    .run_until(async move {
                        let _ = rx.await;
                    })
                    .await;
            }));
            shutdown.push(tx);
            services.insert(name, service);
        }

        Ok(Self {
            nodes,
            services,
            client: reqwest::Client::new(),
            _shutdown: shutdown,
            _servers: servers,
        })
    }

    pub fn url(&self, node: &str, path: &str) -> String {
        let address = self
            .nodes
            .iter()
            .find(|candidate| candidate.id == node)
            .map(|candidate| candidate.address.as_str())
            .unwrap_or_else(|| panic!("unknown test node {node}"));
        format!("{address}{path}")
    }

    pub async fn get(&self, node: &str, path: &str) -> Result<(u16, Value)> {
        let response = self.client.get(self.url(node, path)).send().await?;
        decode(response).await
    }

    pub async fn post(&self, node: &str, path: &str, body: Option<Value>) -> Result<(u16, Value)> {
        let mut request = self.client.post(self.url(node, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        decode(request.send().await?).await
    }

    pub async fn post_raw(&self, node: &str, path: &str, body: &'static str) -> Result<(u16, Value)> {
        let response = self
            .client
            .post(self.url(node, path))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn put(&self, node: &str, path: &str, body: Value) -> Result<(u16, Value)> {
        let response = self.client.put(self.url(node, path)).json(&body).send().await?;
        decode(response).await
    }

    pub async fn delete(&self, node: &str, path: &str) -> Result<(u16, Value)> {
        let response = self.client.delete(self.url(node, path)).send().await?;
        decode(response).await
    }
}

async fn decode(response: reqwest::Response) -> Result<(u16, Value)> {
    let status = response.status().as_u16();
    let bytes = response.bytes().await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
