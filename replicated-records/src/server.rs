use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api;
use crate::node::NodeService;

/// One node's HTTP listener bound to its [`NodeService`].
pub struct Server {
    listener: TcpListener,
    service: Arc<NodeService>,
}

impl Server {
    pub fn new(listener: TcpListener, service: Arc<NodeService>) -> Self {
        Self { listener, service }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, service } = self;
        let node = service.node_id().to_string();

        axum::serve(listener, api::router(service))
            .with_graceful_shutdown(shutdown)
            .await?;

        info!(%node, "server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
