//! # Change Log
//!
//! Append-only log of captured row changes, the input to routing. Change ids
//! ascend in assignment order but become visible in commit order, so readers
//! must tolerate holes that later fill in (see the router's gap detector).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use sluice_protocol::ChangeRecord;

use crate::error::Result;

/// Storage seam for captured changes.
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// Append a change, assigning it the next change id. Returns the id.
    async fn append(&self, record: ChangeRecord) -> Result<u64>;

    /// Append a change under an explicit id. Ids may arrive out of order
    /// relative to earlier appends, the way concurrent transactions commit.
    async fn append_with_id(&self, data_id: u64, record: ChangeRecord) -> Result<()>;

    /// Read changes with id strictly greater than `from_id`, ascending,
    /// at most `limit` records.
    async fn read_from(&self, from_id: u64, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Highest change id ever assigned, or zero when the log is empty.
    async fn max_data_id(&self) -> Result<u64>;
}

/// In-memory change log, used in tests and single-process deployments.
pub struct InMemoryChangeLog {
    records: RwLock<BTreeMap<u64, ChangeRecord>>,
    next_id: AtomicU64,
}

impl InMemoryChangeLog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for InMemoryChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeLogStore for InMemoryChangeLog {
    async fn append(&self, mut record: ChangeRecord) -> Result<u64> {
        let data_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        record.data_id = data_id;
        self.records.write().insert(data_id, record);
        Ok(data_id)
    }

    async fn append_with_id(&self, data_id: u64, mut record: ChangeRecord) -> Result<()> {
        record.data_id = data_id;
        self.records.write().insert(data_id, record);
        // keep the id counter ahead of explicit ids
        self.next_id.fetch_max(data_id + 1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_from(&self, from_id: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let records = self.records.read();
        Ok(records
            .range(from_id + 1..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn max_data_id(&self) -> Result<u64> {
        Ok(self.next_id.load(Ordering::SeqCst).saturating_sub(1))
    }
}
