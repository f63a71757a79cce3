//! Delivery of replication payloads to other nodes.
//!
//! The coordinator only needs "send these records to that node, tell me if it
//! acknowledged". [`HttpTransport`] does that by posting JSON to the target's
//! ingestion endpoint; tests plug in their own implementations.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use crate::cluster::{Node, NodeId};
use crate::record::Record;

/// Path of the ingestion endpoint on every node.
pub const SYNC_PATH: &str = "/sync-data";

/// Why a single replication push failed. Absorbed into the target's status.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {node} failed: {source}")]
    Request {
        node: NodeId,
        #[source]
        source: reqwest::Error,
    },

    #[error("{node} rejected the payload with status {status}")]
    Rejected { node: NodeId, status: u16 },

    #[error("{node} did not acknowledge within {timeout:?}")]
    Timeout { node: NodeId, timeout: Duration },

    #[error("{node} is unavailable: {reason}")]
    Unavailable { node: NodeId, reason: String },
}

pub trait Transport: Send + Sync {
    /// Pushes the full record set to `target`. `Ok` means the target acknowledged.
    fn send<'a>(
        &'a self,
        target: &'a Node,
        records: &'a [Record],
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Posts the record list as JSON to `<address>/sync-data`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    fn endpoint(target: &Node) -> String {
        format!("{}{}", target.address.trim_end_matches('/'), SYNC_PATH)
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        target: &'a Node,
        records: &'a [Record],
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let response = self
                .client
                .post(Self::endpoint(target))
                .json(records)
                .send()
                .await
                .map_err(|source| {
                    if source.is_timeout() {
                        TransportError::Timeout {
                            node: target.id.clone(),
                            timeout: self.timeout,
                        }
                    } else {
                        TransportError::Request {
                            node: target.id.clone(),
                            source,
                        }
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(TransportError::Rejected {
                    node: target.id.clone(),
                    status: status.as_u16(),
                })
            }
        }
        .boxed()
    }
}
