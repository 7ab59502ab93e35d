//! # Batch Store
//!
//! Tracks batch lifecycle on both sides of a sync: outgoing batches from
//! routing through acknowledgment, incoming batches from receipt through
//! load. Enforces per-node strict ordering: an errored batch blocks every
//! later batch for the same node until it is resolved.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use sluice_protocol::{Batch, BatchAck, BatchStatus, BatchType};

use crate::error::{Result, SluiceError};
use crate::stage::BatchReferenceSnapshot;

/// Storage seam for batch lifecycle state.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Allocate the next batch id for a target node. Ids ascend per node and
    /// define load order at that node.
    async fn next_batch_id(&self, node_id: &str) -> Result<u64>;

    async fn insert(&self, batch: Batch) -> Result<()>;

    async fn update_status(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
        status: BatchStatus,
    ) -> Result<()>;

    /// Apply an acknowledgment from the loading side to an outgoing batch.
    async fn record_ack(&self, node_id: &str, ack: &BatchAck) -> Result<()>;

    async fn find(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<Option<Batch>>;

    /// The earliest unresolved outgoing batch for a node, or `None` when the
    /// node is caught up. Returns an error when that batch is in `Error`
    /// status: the node is blocked until an operator intervenes.
    async fn next_ready_for_node(&self, node_id: &str) -> Result<Option<Batch>>;

    /// All unresolved batch ids of one direction, any node.
    async fn pending_ids(&self, batch_type: BatchType) -> Result<Vec<(String, u64)>>;

    /// Resolve an errored batch by skipping it. The batch is marked `Ignored`
    /// and no longer blocks its node.
    async fn mark_ignored(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<()>;

    /// Resolve an errored batch by queueing it for another attempt.
    async fn reset_to_retry(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<()>;

    /// Snapshot of batch ids whose staged payloads must survive purge.
    async fn reference_snapshot(&self) -> Result<BatchReferenceSnapshot>;
}

/// In-memory batch store, used in tests and single-process deployments.
pub struct InMemoryBatchStore {
    /// Keyed by (remote node id, batch id); BTreeMap gives per-node id order
    outgoing: RwLock<BTreeMap<(String, u64), Batch>>,
    incoming: RwLock<BTreeMap<(String, u64), Batch>>,
    counters: RwLock<HashMap<String, u64>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self {
            outgoing: RwLock::new(BTreeMap::new()),
            incoming: RwLock::new(BTreeMap::new()),
            counters: RwLock::new(HashMap::new()),
        }
    }

    fn map(&self, batch_type: BatchType) -> &RwLock<BTreeMap<(String, u64), Batch>> {
        match batch_type {
            BatchType::Outgoing => &self.outgoing,
            BatchType::Incoming => &self.incoming,
        }
    }
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn next_batch_id(&self, node_id: &str) -> Result<u64> {
        let mut counters = self.counters.write();
        let counter = counters.entry(node_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert(&self, batch: Batch) -> Result<()> {
        let key = (batch.staged_location().to_string(), batch.batch_id);
        self.map(batch.batch_type).write().insert(key, batch);
        Ok(())
    }

    async fn update_status(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
        status: BatchStatus,
    ) -> Result<()> {
        let mut map = self.map(batch_type).write();
        let batch = map
            .get_mut(&(node_id.to_string(), batch_id))
            .ok_or_else(|| SluiceError::not_found(format!("batch {batch_id} for {node_id}")))?;
        batch.status = status;
        batch.last_update_time = Utc::now();
        Ok(())
    }

    async fn record_ack(&self, node_id: &str, ack: &BatchAck) -> Result<()> {
        let mut map = self.outgoing.write();
        let batch = map
            .get_mut(&(node_id.to_string(), ack.batch_id))
            .ok_or_else(|| {
                SluiceError::not_found(format!("acked batch {} for {node_id}", ack.batch_id))
            })?;
        batch.status = ack.status;
        batch.sql_message = ack.sql_message.clone();
        batch.last_update_time = Utc::now();
        if ack.status == BatchStatus::Error {
            warn!(
                node = node_id,
                batch = ack.batch_id,
                error = ack.sql_message.as_deref().unwrap_or(""),
                line = ack.error_line,
                "batch rejected by target node"
            );
        }
        Ok(())
    }

    async fn find(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<Option<Batch>> {
        Ok(self
            .map(batch_type)
            .read()
            .get(&(node_id.to_string(), batch_id))
            .cloned())
    }

    async fn next_ready_for_node(&self, node_id: &str) -> Result<Option<Batch>> {
        let map = self.outgoing.read();
        let earliest = map
            .range((node_id.to_string(), 0)..(node_id.to_string(), u64::MAX))
            .map(|(_, b)| b)
            .find(|b| b.status.is_pending());
        match earliest {
            Some(batch) if batch.status == BatchStatus::Error => Err(SluiceError::loading(
                batch.batch_id,
                format!(
                    "node {node_id} is blocked by errored batch {}: {}",
                    batch.batch_id,
                    batch.sql_message.as_deref().unwrap_or("unknown error")
                ),
            )),
            Some(batch) => Ok(Some(batch.clone())),
            None => Ok(None),
        }
    }

    async fn pending_ids(&self, batch_type: BatchType) -> Result<Vec<(String, u64)>> {
        Ok(self
            .map(batch_type)
            .read()
            .values()
            .filter(|b| b.status.is_pending())
            .map(|b| (b.staged_location().to_string(), b.batch_id))
            .collect())
    }

    async fn mark_ignored(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<()> {
        info!(node = node_id, batch = batch_id, "batch marked ignored by operator");
        self.update_status(batch_type, node_id, batch_id, BatchStatus::Ignored)
            .await
    }

    async fn reset_to_retry(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<()> {
        info!(node = node_id, batch = batch_id, "batch queued for retry by operator");
        let status = match batch_type {
            BatchType::Outgoing => BatchStatus::Sending,
            BatchType::Incoming => BatchStatus::Loading,
        };
        self.update_status(batch_type, node_id, batch_id, status).await
    }

    async fn reference_snapshot(&self) -> Result<BatchReferenceSnapshot> {
        let mut snapshot = BatchReferenceSnapshot::default();
        for batch in self.outgoing.read().values() {
            if batch.status.is_pending() {
                snapshot
                    .outgoing
                    .insert((batch.staged_location().to_string(), batch.batch_id));
            }
        }
        for batch in self.incoming.read().values() {
            if batch.status.is_pending() {
                snapshot
                    .incoming
                    .insert((batch.staged_location().to_string(), batch.batch_id));
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(batch_id: u64, node: &str, status: BatchStatus) -> Batch {
        let mut b = Batch::new(BatchType::Outgoing, batch_id, "default", "001", node);
        b.status = status;
        b
    }

    #[tokio::test]
    async fn test_batch_ids_ascend_per_node() {
        let store = InMemoryBatchStore::new();
        assert_eq!(store.next_batch_id("002").await.unwrap(), 1);
        assert_eq!(store.next_batch_id("002").await.unwrap(), 2);
        assert_eq!(store.next_batch_id("003").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_next_ready_is_earliest_pending() {
        let store = InMemoryBatchStore::new();
        store.insert(outgoing(1, "002", BatchStatus::Ok)).await.unwrap();
        store.insert(outgoing(2, "002", BatchStatus::Sending)).await.unwrap();
        store.insert(outgoing(3, "002", BatchStatus::New)).await.unwrap();

        let next = store.next_ready_for_node("002").await.unwrap().unwrap();
        assert_eq!(next.batch_id, 2);
    }

    #[tokio::test]
    async fn test_errored_batch_blocks_node() {
        let store = InMemoryBatchStore::new();
        store.insert(outgoing(1, "002", BatchStatus::Error)).await.unwrap();
        store.insert(outgoing(2, "002", BatchStatus::New)).await.unwrap();

        let err = store.next_ready_for_node("002").await.unwrap_err();
        assert!(err.to_string().contains("blocked"));
        // other nodes are unaffected
        store.insert(outgoing(1, "003", BatchStatus::New)).await.unwrap();
        assert!(store.next_ready_for_node("003").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ignore_unblocks_node() {
        let store = InMemoryBatchStore::new();
        store.insert(outgoing(1, "002", BatchStatus::Error)).await.unwrap();
        store.insert(outgoing(2, "002", BatchStatus::New)).await.unwrap();

        store
            .mark_ignored(BatchType::Outgoing, "002", 1)
            .await
            .unwrap();
        let next = store.next_ready_for_node("002").await.unwrap().unwrap();
        assert_eq!(next.batch_id, 2);
    }

    #[tokio::test]
    async fn test_retry_requeues_errored_batch() {
        let store = InMemoryBatchStore::new();
        store.insert(outgoing(1, "002", BatchStatus::Error)).await.unwrap();
        store
            .reset_to_retry(BatchType::Outgoing, "002", 1)
            .await
            .unwrap();
        let next = store.next_ready_for_node("002").await.unwrap().unwrap();
        assert_eq!(next.batch_id, 1);
        assert_eq!(next.status, BatchStatus::Sending);
    }

    #[tokio::test]
    async fn test_record_ack_resolves_batch() {
        let store = InMemoryBatchStore::new();
        store.insert(outgoing(1, "002", BatchStatus::Sending)).await.unwrap();
        store
            .record_ack("002", &BatchAck::ok(1, "002"))
            .await
            .unwrap();
        let batch = store
            .find(BatchType::Outgoing, "002", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Ok);
        assert!(store.next_ready_for_node("002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_ack_carries_message() {
        let store = InMemoryBatchStore::new();
        store.insert(outgoing(1, "002", BatchStatus::Sending)).await.unwrap();
        store
            .record_ack("002", &BatchAck::error(1, "002", Some(4), "pk violation"))
            .await
            .unwrap();
        let batch = store
            .find(BatchType::Outgoing, "002", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert_eq!(batch.sql_message.as_deref(), Some("pk violation"));
    }

    #[tokio::test]
    async fn test_reference_snapshot_tracks_pending_only() {
        let store = InMemoryBatchStore::new();
        store.insert(outgoing(1, "002", BatchStatus::Ok)).await.unwrap();
        store.insert(outgoing(2, "002", BatchStatus::Sending)).await.unwrap();
        let mut incoming = Batch::new(BatchType::Incoming, 7, "default", "002", "001");
        incoming.status = BatchStatus::Loading;
        store.insert(incoming).await.unwrap();

        let snapshot = store.reference_snapshot().await.unwrap();
        assert!(!snapshot.is_referenced("outgoing", "002", 1));
        assert!(snapshot.is_referenced("outgoing", "002", 2));
        assert!(snapshot.is_referenced("incoming", "002", 7));
        // same id to a different node stays purgeable
        assert!(!snapshot.is_referenced("outgoing", "003", 2));
    }
}
