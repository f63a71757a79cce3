//! The operation surface of one node.
//!
//! [`NodeService`] ties the local [`RecordStore`] to the cluster: it serialises
//! every local operation behind one lock, and after each successful write on
//! the primary it hands a snapshot of the store to the [`Replicator`] in the
//! background.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::backend::blocking_io;
use crate::cluster::{ClusterState, StatusMap, SyncStatus};
use crate::error::Result;
use crate::ledger::Snapshot;
use crate::membership::{Failover, Membership, WhoAmI};
use crate::record::{FieldMap, Record};
use crate::replication::Replicator;
use crate::store::RecordStore;

pub struct NodeService {
    store: Arc<Mutex<RecordStore>>,
    membership: Arc<Membership>,
    replicator: Arc<Replicator>,
    auto_replicate: bool,
}

impl NodeService {
    /// `auto_replicate` enables the background push after every local write
    /// made while this node is primary.
    pub fn new(
        store: RecordStore,
        membership: Arc<Membership>,
        replicator: Arc<Replicator>,
        auto_replicate: bool,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            membership,
            replicator,
            auto_replicate,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.membership.local().id
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub async fn create_record(&self, fields: FieldMap) -> Result<Record> {
        let record = self.write(move |store| store.create(fields)).await?;
        info!(id = %record.id, "record created");
        Ok(record)
    }

    pub async fn get_record(&self, id: &str) -> Result<Record> {
        self.store.lock().await.get(id)
    }

    pub async fn list_records(&self, include_deleted: bool) -> Vec<Record> {
        let store = self.store.lock().await;
        if include_deleted {
            store.list_all()
        } else {
            store.list_active()
        }
    }

    pub async fn update_record(&self, id: &str, fields: FieldMap) -> Result<Record> {
        let owned = id.to_string();
        let record = self.write(move |store| store.update(&owned, fields)).await?;
        debug!(%id, "record updated");
        Ok(record)
    }

    pub async fn delete_record(&self, id: &str) -> Result<Record> {
        let owned = id.to_string();
        let record = self.write(move |store| store.delete(&owned)).await?;
        info!(%id, "record soft-deleted");
        Ok(record)
    }

    pub async fn undo(&self, id: &str) -> Result<Option<Record>> {
        let id = id.to_string();
        self.write(move |store| store.undo(&id)).await
    }

    pub async fn redo(&self, id: &str) -> Result<Option<Record>> {
        let id = id.to_string();
        self.write(move |store| store.redo(&id)).await
    }

    pub async fn history(&self, id: &str) -> Vec<Snapshot> {
        self.store.lock().await.history(id)
    }

    /// Replaces the local record set with a primary's push and marks this node synced.
    pub async fn ingest_replication_payload(&self, records: Vec<Record>) -> Result<usize> {
        let (_store, installed) = self.locked(move |store| store.replace_all(records)).await?;
        let local = self.node_id().to_string();
        self.cluster(move |membership| membership.mark(&[local], SyncStatus::Synced))
            .await?;
        info!(records = installed, "replication payload ingested");
        Ok(installed)
    }

    /// Synchronous replication pass; only allowed on the primary.
    pub async fn run_replication(&self) -> Result<StatusMap> {
        let payload = self.store.lock().await.list_all();
        self.replicator
            .replicate_from(self.node_id(), payload)
            .await
    }

    pub async fn replication_status(&self) -> Result<StatusMap> {
        self.cluster(|membership| membership.replication_status()).await
    }

    pub async fn simulate_failure(&self) -> Result<Failover> {
        self.cluster(|membership| membership.simulate_failure()).await
    }

    pub async fn restore_primary(&self, node: Option<&str>) -> Result<ClusterState> {
        let node = node.map(str::to_string);
        self.cluster(move |membership| membership.restore_primary(node.as_deref()))
            .await
    }

    pub async fn who_am_i(&self) -> Result<WhoAmI> {
        self.cluster(|membership| membership.who_am_i()).await
    }

    /// Applies one mutation under the store lock and, on the primary, queues a
    /// background push of the resulting state.
    async fn write<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RecordStore) -> Result<T> + Send + 'static,
    {
        let (store, value) = self.locked(op).await?;

        if self.auto_replicate {
            match self.cluster(|membership| membership.is_local_primary()).await {
                Ok(true) => {
                    // Captured under the lock so the push matches this write.
                    let payload = store.list_all();
                    self.replicator.spawn(self.node_id().to_string(), payload);
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "cannot tell whether this node is primary"),
            }
        }
        Ok(value)
    }

    /// Runs `op` on the blocking pool while holding the store lock; the guard
    /// comes back so the caller can keep the lock.
    async fn locked<T, F>(&self, op: F) -> Result<(OwnedMutexGuard<RecordStore>, T)>
    where
        T: Send + 'static,
        F: FnOnce(&mut RecordStore) -> Result<T> + Send + 'static,
    {
        let mut store = Arc::clone(&self.store).lock_owned().await;
        blocking_io(move || {
            let value = op(&mut *store)?;
            Ok((store, value))
        })
        .await
    }

    async fn cluster<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Membership) -> Result<T> + Send + 'static,
    {
        let membership = Arc::clone(&self.membership);
        blocking_io(move || op(&membership)).await
    }
}
