//! # Router
//!
//! Reads captured changes in change-id order, resolves target nodes, and
//! partitions changes into batches per (target node, channel).
//!
//! ## Gap handling
//!
//! Change ids are assigned at capture time but become visible at commit time,
//! so a routing pass can observe holes that a slower transaction fills in
//! later. A hole is re-checked for a configured number of passes and a
//! configured timeout before it is declared a permanent gap; until then,
//! routing stops at the hole so delivery order never runs ahead of a change
//! that may still appear.
//!
//! ## Batch closing
//!
//! A batch closes when it reaches the row limit, the byte limit, or the open
//! time limit. With atomic transactions enabled the limits become advisory
//! inside a source transaction: the batch only closes at a transaction
//! boundary, so one source transaction is never split across batches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use sluice_protocol::{Batch, BatchStatus, BatchType, ChangeRecord, DataGap};

use crate::batches::BatchStore;
use crate::changelog::ChangeLogStore;
use crate::config::RouterConfig;
use crate::error::Result;

/// Resolves the target nodes for one captured change.
pub trait TargetRouter: Send + Sync {
    fn targets_for(&self, record: &ChangeRecord) -> Vec<String>;
}

/// Routes every change to a fixed set of nodes.
pub struct StaticTargetRouter {
    targets: Vec<String>,
}

impl StaticTargetRouter {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }
}

impl TargetRouter for StaticTargetRouter {
    fn targets_for(&self, _record: &ChangeRecord) -> Vec<String> {
        self.targets.clone()
    }
}

/// Routes by channel, with a default set for unmapped channels.
pub struct ChannelTargetRouter {
    by_channel: HashMap<String, Vec<String>>,
    default_targets: Vec<String>,
}

impl ChannelTargetRouter {
    pub fn new(default_targets: Vec<String>) -> Self {
        Self {
            by_channel: HashMap::new(),
            default_targets,
        }
    }

    pub fn channel(mut self, channel_id: impl Into<String>, targets: Vec<String>) -> Self {
        self.by_channel.insert(channel_id.into(), targets);
        self
    }
}

impl TargetRouter for ChannelTargetRouter {
    fn targets_for(&self, record: &ChangeRecord) -> Vec<String> {
        self.by_channel
            .get(&record.channel_id)
            .unwrap_or(&self.default_targets)
            .clone()
    }
}

#[derive(Debug)]
struct PendingHole {
    start_id: u64,
    end_id: u64,
    checks: u32,
    first_seen: Instant,
}

/// Tracks the contiguous routing frontier over the change-id sequence and
/// decides when a hole becomes a permanent gap.
pub struct GapDetector {
    /// Every id at or below this has been routed or declared gapped
    frontier: u64,
    holes: Vec<PendingHole>,
    gaps: Vec<DataGap>,
    retry_count: u32,
    timeout: Duration,
}

impl GapDetector {
    pub fn new(retry_count: u32, timeout: Duration) -> Self {
        Self {
            frontier: 0,
            holes: Vec::new(),
            gaps: Vec::new(),
            retry_count,
            timeout,
        }
    }

    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Permanent gaps declared so far.
    pub fn gaps(&self) -> &[DataGap] {
        &self.gaps
    }

    /// Consume one pass worth of records (ascending by id, starting above the
    /// frontier) and return the prefix safe to route. Records past a hole
    /// that is still within its retry budget are withheld for a later pass.
    pub fn advance(&mut self, records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
        let mut routable = Vec::with_capacity(records.len());
        let mut expected = self.frontier + 1;

        for record in records {
            if record.data_id < expected {
                warn!(
                    data_id = record.data_id,
                    frontier = self.frontier,
                    "change arrived behind the routing frontier, skipping"
                );
                continue;
            }
            if record.data_id > expected {
                let hole_start = expected;
                let hole_end = record.data_id - 1;
                if !self.expire_hole(hole_start, hole_end) {
                    // hole may still fill in; everything from here waits
                    debug!(
                        start = hole_start,
                        end = hole_end,
                        "routing paused at unresolved change-id hole"
                    );
                    self.frontier = hole_start - 1;
                    return routable;
                }
                // expired into a permanent gap: route past it
            }
            expected = record.data_id + 1;
            routable.push(record);
        }

        self.frontier = expected - 1;
        // holes behind the frontier got filled in
        self.holes.retain(|h| h.start_id > self.frontier);
        routable
    }

    /// Track a hole across passes; true once it has exhausted its retry
    /// budget or timed out and is declared a permanent gap.
    fn expire_hole(&mut self, start_id: u64, end_id: u64) -> bool {
        let (checks, first_seen) = match self
            .holes
            .iter_mut()
            .find(|h| h.start_id == start_id && h.end_id == end_id)
        {
            Some(hole) => {
                hole.checks += 1;
                (hole.checks, hole.first_seen)
            }
            None => {
                self.holes.push(PendingHole {
                    start_id,
                    end_id,
                    checks: 1,
                    first_seen: Instant::now(),
                });
                (1, Instant::now())
            }
        };

        if checks > self.retry_count || first_seen.elapsed() >= self.timeout {
            info!(
                start = start_id,
                end = end_id,
                checks,
                "declaring permanent change-id gap"
            );
            self.gaps.push(DataGap::new(start_id, end_id));
            self.holes
                .retain(|h| !(h.start_id == start_id && h.end_id == end_id));
            true
        } else {
            false
        }
    }

    /// Durable view of the detector: the frontier plus every declared gap.
    /// Pending holes are intentionally absent; a fresh process re-detects
    /// them and restarts their retry budget.
    fn checkpoint(&self) -> RouterCheckpoint {
        RouterCheckpoint {
            frontier: self.frontier,
            gaps: self.gaps.clone(),
        }
    }

    fn restore(&mut self, checkpoint: &RouterCheckpoint) {
        self.frontier = checkpoint.frontier;
        self.gaps = checkpoint.gaps.clone();
        self.holes.clear();
    }
}

/// Persisted router state: survives a process restart so already-routed
/// changes are not routed again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterCheckpoint {
    pub frontier: u64,
    pub gaps: Vec<DataGap>,
}

/// Storage seam for [`RouterCheckpoint`].
#[async_trait]
pub trait RouterStateStore: Send + Sync {
    async fn load(&self) -> Result<Option<RouterCheckpoint>>;
    async fn save(&self, checkpoint: &RouterCheckpoint) -> Result<()>;
}

/// In-memory checkpoint store, for tests and single-process use.
#[derive(Default)]
pub struct InMemoryRouterStateStore {
    checkpoint: parking_lot::Mutex<Option<RouterCheckpoint>>,
}

impl InMemoryRouterStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouterStateStore for InMemoryRouterStateStore {
    async fn load(&self) -> Result<Option<RouterCheckpoint>> {
        Ok(self.checkpoint.lock().clone())
    }

    async fn save(&self, checkpoint: &RouterCheckpoint) -> Result<()> {
        *self.checkpoint.lock() = Some(checkpoint.clone());
        Ok(())
    }
}

/// One batch produced by a routing pass, with its routed rows.
#[derive(Debug)]
pub struct RoutedBatch {
    pub batch: Batch,
    pub records: Vec<ChangeRecord>,
}

struct OpenBatch {
    records: Vec<ChangeRecord>,
    bytes: u64,
    opened: Instant,
    /// Transaction id of the most recent row, for boundary detection
    current_txn: Option<String>,
    close_pending: bool,
}

impl OpenBatch {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            bytes: 0,
            opened: Instant::now(),
            current_txn: None,
            close_pending: false,
        }
    }
}

/// Partitions routable changes into batches.
pub struct Router {
    config: RouterConfig,
    gap_detector: parking_lot::Mutex<GapDetector>,
    state_store: Arc<dyn RouterStateStore>,
    restored: AtomicBool,
    node_id: String,
}

impl Router {
    pub fn new(
        node_id: impl Into<String>,
        config: RouterConfig,
        state_store: Arc<dyn RouterStateStore>,
    ) -> Self {
        let gap_detector = GapDetector::new(config.gap_retry_count, config.gap_timeout);
        Self {
            config,
            gap_detector: parking_lot::Mutex::new(gap_detector),
            state_store,
            restored: AtomicBool::new(false),
            node_id: node_id.into(),
        }
    }

    pub fn gaps(&self) -> Vec<DataGap> {
        self.gap_detector.lock().gaps().to_vec()
    }

    /// Load the persisted checkpoint before the first pass, so a restarted
    /// node resumes from its routed frontier instead of id zero.
    async fn ensure_restored(&self) -> Result<()> {
        if self.restored.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(checkpoint) = self.state_store.load().await? {
            info!(
                frontier = checkpoint.frontier,
                gaps = checkpoint.gaps.len(),
                "restored router checkpoint"
            );
            self.gap_detector.lock().restore(&checkpoint);
        }
        self.restored.store(true, Ordering::Release);
        Ok(())
    }

    /// Run one routing pass: read the change log from the frontier, withhold
    /// rows behind unresolved holes, partition the rest into batches, and
    /// register each batch with the store in `Routing` status.
    pub async fn route_pass(
        &self,
        changelog: &dyn ChangeLogStore,
        batches: &dyn BatchStore,
        targets: &dyn TargetRouter,
    ) -> Result<Vec<RoutedBatch>> {
        self.ensure_restored().await?;
        let frontier = self.gap_detector.lock().frontier();
        let records = changelog
            .read_from(frontier, self.config.read_limit)
            .await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let routable = self.gap_detector.lock().advance(records);
        let checkpoint = self.gap_detector.lock().checkpoint();
        self.state_store.save(&checkpoint).await?;
        if routable.is_empty() {
            return Ok(Vec::new());
        }

        let mut open: HashMap<(String, String), OpenBatch> = HashMap::new();
        let mut closed: Vec<RoutedBatch> = Vec::new();

        for record in routable {
            for node in targets.targets_for(&record) {
                if node == self.node_id {
                    continue;
                }
                let key = (node.clone(), record.channel_id.clone());
                if let Some(builder) = open.get_mut(&key) {
                    if self.should_close(builder, &record) {
                        let full = std::mem::replace(builder, OpenBatch::new());
                        closed.push(self.seal(batches, &key.0, &key.1, full).await?);
                    }
                }

                let builder = open.entry(key.clone()).or_insert_with(OpenBatch::new);
                builder.bytes += record.estimated_bytes() as u64;
                builder.current_txn = record.transaction_id.clone();
                builder.records.push(record.clone());

                if self.over_limits(builder) {
                    if self.config.atomic_transactions && builder.current_txn.is_some() {
                        // close at the next transaction boundary instead
                        builder.close_pending = true;
                    } else {
                        let full = std::mem::replace(builder, OpenBatch::new());
                        closed.push(self.seal(batches, &key.0, &key.1, full).await?);
                    }
                }
            }
        }

        // a pass closes everything it opened
        for ((node, channel), builder) in open {
            if !builder.records.is_empty() {
                closed.push(self.seal(batches, &node, &channel, builder).await?);
            }
        }
        Ok(closed)
    }

    /// Whether the open batch must close before this record joins it.
    fn should_close(&self, builder: &OpenBatch, record: &ChangeRecord) -> bool {
        if builder.records.is_empty() {
            return false;
        }
        let txn_boundary = builder.current_txn.is_none()
            || builder.current_txn != record.transaction_id;
        if builder.close_pending {
            return txn_boundary;
        }
        if self.over_limits(builder) {
            return !self.config.atomic_transactions || txn_boundary;
        }
        if builder.opened.elapsed() >= self.config.max_batch_open {
            return !self.config.atomic_transactions || txn_boundary;
        }
        false
    }

    fn over_limits(&self, builder: &OpenBatch) -> bool {
        builder.records.len() as u64 >= self.config.max_batch_rows
            || builder.bytes >= self.config.max_batch_bytes
    }

    async fn seal(
        &self,
        batches: &dyn BatchStore,
        node: &str,
        channel: &str,
        builder: OpenBatch,
    ) -> Result<RoutedBatch> {
        let batch_id = batches.next_batch_id(node).await?;
        let mut batch = Batch::new(
            BatchType::Outgoing,
            batch_id,
            channel,
            self.node_id.clone(),
            node,
        );
        batch.status = BatchStatus::Routing;
        batch.data_row_count = builder.records.len() as u64;
        batch.byte_count = builder.bytes;
        for record in &builder.records {
            match record.event_type {
                sluice_protocol::DataEventType::Insert => batch.insert_count += 1,
                sluice_protocol::DataEventType::Update => batch.update_count += 1,
                sluice_protocol::DataEventType::Delete => batch.delete_count += 1,
                _ => {}
            }
        }
        batches.insert(batch.clone()).await?;
        debug!(
            node,
            channel,
            batch = batch_id,
            rows = batch.data_row_count,
            "batch routed"
        );
        Ok(RoutedBatch {
            batch,
            records: builder.records,
        })
    }
}
