//! # Replication Engine
//!
//! Wires capture, routing, staging, transport, and load into one node.
//! The engine exposes pass-style operations (`route_pass`, `push_pass`,
//! `pull_pass`, `purge_pass`) that the job scheduler runs under cluster
//! locks, plus the [`SyncEndpoint`] surface peers call into.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use sluice_protocol::{Batch, BatchAck, BatchStatus, BatchType, ChangeRecord};

use crate::assemble::{CollectingListener, StagingWriter};
use crate::batches::BatchStore;
use crate::changelog::ChangeLogStore;
use crate::cluster::{LockCoordinator, LockStore};
use crate::config::EngineConfig;
use crate::error::{Result, SluiceError};
use crate::extract::{BatchExtractor, SchemaProvider};
use crate::load::{BatchLoader, SqlExecutor};
use crate::route::{Router, RouterStateStore, TargetRouter};
use crate::stage::{CleanStats, StagingManager};
use crate::transport::{BatchTransport, SyncEndpoint};

/// One replication node.
pub struct Engine {
    config: EngineConfig,
    changelog: Arc<dyn ChangeLogStore>,
    batches: Arc<dyn BatchStore>,
    staging: Arc<StagingManager>,
    router: Router,
    schema: Arc<dyn SchemaProvider>,
    targets: Arc<dyn TargetRouter>,
    loader: BatchLoader,
    transport: Arc<dyn BatchTransport>,
    locks: LockCoordinator,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        changelog: Arc<dyn ChangeLogStore>,
        batches: Arc<dyn BatchStore>,
        executor: Arc<dyn SqlExecutor>,
        schema: Arc<dyn SchemaProvider>,
        targets: Arc<dyn TargetRouter>,
        router_state: Arc<dyn RouterStateStore>,
        transport: Arc<dyn BatchTransport>,
        lock_store: Arc<dyn LockStore>,
    ) -> Result<Arc<Self>> {
        let staging = Arc::new(StagingManager::new(
            &config.staging.dir,
            config.staging.memory_threshold_bytes,
        )?);
        let router = Router::new(config.node_id.clone(), config.router.clone(), router_state);
        let loader = BatchLoader::new(executor, config.loader.clone());
        let locks = LockCoordinator::new(lock_store, config.lock.clone());
        Ok(Arc::new(Self {
            config,
            changelog,
            batches,
            staging,
            router,
            schema,
            targets,
            loader,
            transport,
            locks,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    /// Batch lifecycle state, for admin and monitoring surfaces.
    pub fn batches(&self) -> &Arc<dyn BatchStore> {
        &self.batches
    }

    /// Record one captured change.
    pub async fn capture(&self, record: ChangeRecord) -> Result<u64> {
        self.changelog.append(record).await
    }

    /// Route pending changes into batches and extract each to the staging
    /// area. Returns the number of batches produced.
    pub async fn route_pass(&self) -> Result<usize> {
        let routed = self
            .router
            .route_pass(
                self.changelog.as_ref(),
                self.batches.as_ref(),
                self.targets.as_ref(),
            )
            .await?;
        let extractor = BatchExtractor::new(&self.staging);
        let count = routed.len();
        for mut item in routed {
            extractor.extract(&mut item.batch, &item.records, self.schema.as_ref())?;
            self.batches
                .update_status(
                    BatchType::Outgoing,
                    &item.batch.target_node_id,
                    item.batch.batch_id,
                    BatchStatus::Sending,
                )
                .await?;
        }
        if count > 0 {
            info!(batches = count, "routing pass extracted batches");
        }
        Ok(count)
    }

    /// Push staged batches to every configured peer, strictly ordered per
    /// node, with bounded cross-node concurrency. Returns batches acked OK.
    pub async fn push_pass(self: &Arc<Self>) -> Result<u64> {
        let permits = Arc::new(Semaphore::new(self.config.transport.max_concurrent_nodes.max(1)));
        let mut handles = Vec::new();
        for node in self.config.transport.peers.keys().cloned() {
            let engine = Arc::clone(self);
            let permits = Arc::clone(&permits);
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore closed");
                engine.push_node(&node).await
            }));
        }
        let mut pushed = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(n)) => pushed += n,
                Ok(Err(e)) if e.is_retriable() => {
                    warn!(error = %e, "push failed, will retry next pass");
                }
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(SluiceError::other(format!("push task panicked: {e}"))),
            }
        }
        Ok(pushed)
    }

    /// Push this node's backlog to one peer, earliest batch first, stopping
    /// at the first failure so order is preserved.
    async fn push_node(&self, node: &str) -> Result<u64> {
        let mut pushed = 0;
        loop {
            let batch = match self.batches.next_ready_for_node(node).await {
                Ok(Some(batch)) if batch.status == BatchStatus::Sending => batch,
                Ok(_) => break,
                Err(e) => {
                    // an errored batch blocks this node, not the whole pass
                    warn!(node, error = %e, "node blocked, skipping push");
                    break;
                }
            };
            let payload = self.staged_payload(&batch)?;
            let acks = self.transport.push(node, payload).await?;
            let mut resolved = false;
            for ack in &acks {
                self.batches.record_ack(node, ack).await?;
                if ack.batch_id == batch.batch_id {
                    resolved = true;
                    if ack.is_ok() {
                        pushed += 1;
                    }
                }
            }
            if !resolved || acks.iter().any(|a| !a.is_ok()) {
                break;
            }
        }
        Ok(pushed)
    }

    /// Pull batches from every peer, stage, load, and ack them. Returns
    /// batches loaded OK.
    pub async fn pull_pass(&self) -> Result<u64> {
        let mut loaded = 0;
        for node in self.config.transport.peers.keys() {
            match self.pull_node(node).await {
                Ok(n) => loaded += n,
                Err(e) if e.is_retriable() => {
                    warn!(node, error = %e, "pull failed, will retry next pass");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }

    async fn pull_node(&self, node: &str) -> Result<u64> {
        let payload = self.transport.pull(node).await?;
        if payload.is_empty() {
            return Ok(0);
        }
        let acks = self.stage_and_load(payload).await?;
        let ok = acks.iter().filter(|a| a.is_ok()).count() as u64;
        self.transport.send_ack(node, acks).await?;
        Ok(ok)
    }

    /// Purge staged payloads whose batches are resolved and older than the
    /// configured TTL.
    pub async fn purge_pass(&self) -> Result<CleanStats> {
        let snapshot = self.batches.reference_snapshot().await?;
        let stats = self.staging.clean(self.config.staging.purge_ttl, &snapshot);
        if stats.purged > 0 {
            info!(purged = stats.purged, bytes = stats.bytes_freed, "staging purge");
        }
        Ok(stats)
    }

    /// Operator action: skip an errored batch so its node unblocks.
    pub async fn ignore_batch(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<()> {
        self.batches.mark_ignored(batch_type, node_id, batch_id).await
    }

    /// Operator action: queue an errored batch for another attempt.
    pub async fn retry_batch(
        &self,
        batch_type: BatchType,
        node_id: &str,
        batch_id: u64,
    ) -> Result<()> {
        self.batches.reset_to_retry(batch_type, node_id, batch_id).await
    }

    fn staged_payload(&self, batch: &Batch) -> Result<Bytes> {
        let location = batch.staged_location().to_string();
        let resource = self
            .staging
            .find(batch.staging_category(), &[&location, &batch.batch_id.to_string()])
            .ok_or_else(|| {
                SluiceError::not_found(format!(
                    "staged payload for batch {} to {location}",
                    batch.batch_id
                ))
            })?;
        Ok(Bytes::from(resource.read_all()?))
    }

    /// Stage an incoming wire stream and load every batch it carries,
    /// producing one ack per batch.
    async fn stage_and_load(&self, payload: Bytes) -> Result<Vec<BatchAck>> {
        let collector = Arc::new(CollectingListener::default());
        let writer = StagingWriter::new(&self.staging, BatchType::Incoming, self.node_id())
            .with_listener(collector.clone());
        writer.process(std::io::Cursor::new(payload))?;

        let mut acks = Vec::new();
        for (mut batch, resource) in collector.take_finished() {
            batch.status = BatchStatus::Loading;
            self.batches.insert(batch.clone()).await?;
            // pin the payload against a concurrent purge pass while loading
            resource.reference();
            let outcome = self.loader.load(self.node_id(), resource.reader()?).await;
            resource.dereference();
            let outcome = outcome?;
            let status = outcome.ack.status;
            self.batches
                .update_status(
                    BatchType::Incoming,
                    &batch.source_node_id,
                    batch.batch_id,
                    status,
                )
                .await?;
            debug!(
                batch = batch.batch_id,
                from = %batch.source_node_id,
                ok = outcome.ack.is_ok(),
                "incoming batch loaded"
            );
            acks.push(outcome.ack);
            if status == BatchStatus::Error {
                // strict order per source: stop loading behind a failure
                break;
            }
        }
        Ok(acks)
    }
}

#[async_trait]
impl SyncEndpoint for Engine {
    async fn receive_push(&self, from_node: &str, payload: Bytes) -> Result<Vec<BatchAck>> {
        debug!(from = from_node, bytes = payload.len(), "receiving pushed batches");
        self.stage_and_load(payload).await
    }

    async fn serve_pull(&self, for_node: &str) -> Result<Bytes> {
        let mut pending: Vec<(String, u64)> = self
            .batches
            .pending_ids(BatchType::Outgoing)
            .await?
            .into_iter()
            .filter(|(node, _)| node == for_node)
            .collect();
        pending.sort();

        let mut body = Vec::new();
        for (node, batch_id) in pending {
            let Some(batch) = self.batches.find(BatchType::Outgoing, &node, batch_id).await? else {
                continue;
            };
            if batch.status != BatchStatus::Sending {
                // strict order: nothing leaves past an unresolved error or a
                // batch the extractor has not finished staging
                break;
            }
            let payload = self.staged_payload(&batch)?;
            body.extend_from_slice(&payload);
        }
        Ok(Bytes::from(body))
    }

    async fn receive_ack(&self, from_node: &str, acks: Vec<BatchAck>) -> Result<()> {
        for ack in &acks {
            self.batches.record_ack(from_node, ack).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batches::InMemoryBatchStore;
    use crate::changelog::InMemoryChangeLog;
    use crate::cluster::InMemoryLockStore;
    use crate::extract::StaticSchemaProvider;
    use crate::route::{InMemoryRouterStateStore, StaticTargetRouter};
    use crate::testutil::MockSqlExecutor;
    use crate::transport::InMemoryTransport;
    use sluice_protocol::{DataEventType, TableFraming};
    use tempfile::TempDir;

    struct Node {
        engine: Arc<Engine>,
        executor: Arc<MockSqlExecutor>,
        transport: Arc<InMemoryTransport>,
        _dir: TempDir,
    }

    fn node(node_id: &str, peer: &str) -> Node {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::builder(node_id)
            .staging_dir(dir.path())
            .peer(peer, format!("mem://{peer}"))
            .build();
        let executor = Arc::new(MockSqlExecutor::new());
        let schema = StaticSchemaProvider::new().table(
            TableFraming::new("customer")
                .with_keys(["id"])
                .with_columns(["id", "name"]),
        );
        let transport = Arc::new(InMemoryTransport::new(node_id));
        let engine = Engine::new(
            config,
            Arc::new(InMemoryChangeLog::new()),
            Arc::new(InMemoryBatchStore::new()),
            executor.clone(),
            Arc::new(schema),
            Arc::new(StaticTargetRouter::new(vec![peer.to_string()])),
            Arc::new(InMemoryRouterStateStore::new()),
            transport.clone(),
            Arc::new(InMemoryLockStore::new()),
        )
        .unwrap();
        Node {
            engine,
            executor,
            transport,
            _dir: dir,
        }
    }

    fn pair() -> (Node, Node) {
        let a = node("001", "002");
        let b = node("002", "001");
        a.transport.connect("002", b.engine.clone() as Arc<dyn SyncEndpoint>);
        b.transport.connect("001", a.engine.clone() as Arc<dyn SyncEndpoint>);
        (a, b)
    }

    fn change(id: &str, name: &str) -> ChangeRecord {
        ChangeRecord {
            data_id: 0,
            table_name: "customer".to_string(),
            event_type: DataEventType::Insert,
            pk_data: vec![id.to_string()],
            row_data: vec![id.to_string(), name.to_string()],
            old_data: None,
            channel_id: "default".to_string(),
            transaction_id: None,
            source_node_id: "001".to_string(),
            create_time: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_capture_route_push_load_ack() {
        let (a, b) = pair();
        a.engine.capture(change("1", "alice")).await.unwrap();
        a.engine.capture(change("2", "bob")).await.unwrap();

        assert_eq!(a.engine.route_pass().await.unwrap(), 1);
        let pushed = a.engine.push_pass().await.unwrap();
        assert_eq!(pushed, 1);

        // rows landed at B
        assert_eq!(
            b.executor.row("customer", &["1"]),
            Some(vec!["1".to_string(), "alice".to_string()])
        );
        assert_eq!(b.executor.row_count("customer"), 2);

        // A's batch is resolved OK
        let batch = a
            .engine
            .batches
            .find(BatchType::Outgoing, "002", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Ok);
    }

    #[tokio::test]
    async fn test_pull_direction() {
        let (a, b) = pair();
        a.engine.capture(change("7", "grace")).await.unwrap();
        a.engine.route_pass().await.unwrap();

        // B pulls from A instead of A pushing
        let loaded = b.engine.pull_pass().await.unwrap();
        assert_eq!(loaded, 1);
        assert!(b.executor.row("customer", &["7"]).is_some());

        let batch = a
            .engine
            .batches
            .find(BatchType::Outgoing, "002", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Ok);
    }

    #[tokio::test]
    async fn test_pull_skips_unextracted_batch() {
        let a = node("001", "002");
        // batch registered by the router but not yet staged
        let batch_id = a.engine.batches.next_batch_id("002").await.unwrap();
        let mut batch = Batch::new(BatchType::Outgoing, batch_id, "default", "001", "002");
        batch.status = BatchStatus::Routing;
        a.engine.batches.insert(batch).await.unwrap();

        let body = a.engine.serve_pull("002").await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_pull_serves_ready_batches_before_one_mid_route() {
        let a = node("001", "002");
        a.engine.capture(change("1", "alice")).await.unwrap();
        a.engine.route_pass().await.unwrap();

        let batch_id = a.engine.batches.next_batch_id("002").await.unwrap();
        let mut batch = Batch::new(BatchType::Outgoing, batch_id, "default", "001", "002");
        batch.status = BatchStatus::Routing;
        a.engine.batches.insert(batch).await.unwrap();

        // the staged batch goes out; the half-routed one waits its turn
        let body = a.engine.serve_pull("002").await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("batch,1"));
        assert!(!text.contains(&format!("batch,{batch_id}")));
    }

    #[tokio::test]
    async fn test_failed_batch_blocks_then_ignore_unblocks() {
        let (a, b) = pair();
        b.executor.poison("1");
        a.engine.capture(change("1", "alice")).await.unwrap();
        a.engine.route_pass().await.unwrap();
        a.engine.push_pass().await.unwrap();

        let batch = a
            .engine
            .batches
            .find(BatchType::Outgoing, "002", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert!(batch.sql_message.is_some());

        // later captures stay queued behind the error
        a.engine.capture(change("2", "bob")).await.unwrap();
        a.engine.route_pass().await.unwrap();
        a.engine.push_pass().await.unwrap();
        assert!(b.executor.row("customer", &["2"]).is_none());

        // operator skips the bad batch; the queue drains
        a.engine
            .ignore_batch(BatchType::Outgoing, "002", 1)
            .await
            .unwrap();
        a.engine.push_pass().await.unwrap();
        assert!(b.executor.row("customer", &["2"]).is_some());
    }

    #[tokio::test]
    async fn test_retry_after_transient_failure() {
        let (a, b) = pair();
        b.executor.poison("1");
        a.engine.capture(change("1", "alice")).await.unwrap();
        a.engine.route_pass().await.unwrap();
        a.engine.push_pass().await.unwrap();

        // condition clears (say the conflicting row was fixed by an operator)
        b.executor.poison("never-matches");
        a.engine
            .retry_batch(BatchType::Outgoing, "002", 1)
            .await
            .unwrap();
        let pushed = a.engine.push_pass().await.unwrap();
        assert_eq!(pushed, 1);
        assert!(b.executor.row("customer", &["1"]).is_some());
    }

    #[tokio::test]
    async fn test_purge_leaves_pending_batches() {
        let (a, _b) = pair();
        a.engine.capture(change("1", "alice")).await.unwrap();
        a.engine.route_pass().await.unwrap();

        // batch still Sending: purge must not touch its payload no matter
        // how old it is
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let snapshot = a.engine.batches.reference_snapshot().await.unwrap();
        let stats = a
            .engine
            .staging
            .clean(std::time::Duration::from_nanos(1), &snapshot);
        assert_eq!(stats.purged, 0);
        assert_eq!(stats.skipped_referenced, 1);
    }
}
