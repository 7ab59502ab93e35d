//! Test support: an in-memory [`SqlExecutor`] with real transaction and
//! savepoint semantics, so loader behavior can be exercised without a
//! database.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use sluice_protocol::TableFraming;

use crate::error::{Result, SluiceError};
use crate::load::SqlExecutor;

type Table = BTreeMap<Vec<String>, Vec<String>>;
type Tables = HashMap<String, Table>;

#[derive(Default)]
struct MockState {
    tables: Tables,
    /// Snapshot taken at `begin`, restored on `rollback`
    txn_snapshot: Option<Tables>,
    savepoints: HashMap<String, Tables>,
    commits: u64,
    rollbacks: u64,
    executed: Vec<String>,
    /// Key value that makes any touching statement fail
    poison_pk: Option<String>,
}

/// In-memory destination database for tests.
#[derive(Default)]
pub struct MockSqlExecutor {
    state: Mutex<MockState>,
}

impl MockSqlExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a row outside any transaction.
    pub fn seed(&self, table: &str, pk: &[&str], row: &[&str]) {
        let mut state = self.state.lock();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(
                pk.iter().map(|s| s.to_string()).collect(),
                row.iter().map(|s| s.to_string()).collect(),
            );
    }

    /// Make any statement touching this key value fail with a SQL error.
    pub fn poison(&self, pk_value: &str) {
        self.state.lock().poison_pk = Some(pk_value.to_string());
    }

    /// Committed row by key, or `None`.
    pub fn row(&self, table: &str, pk: &[&str]) -> Option<Vec<String>> {
        let key: Vec<String> = pk.iter().map(|s| s.to_string()).collect();
        self.state.lock().tables.get(table)?.get(&key).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn commits(&self) -> u64 {
        self.state.lock().commits
    }

    pub fn rollbacks(&self) -> u64 {
        self.state.lock().rollbacks
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    fn check_poison(state: &MockState, values: &[String]) -> Result<()> {
        if let Some(poison) = &state.poison_pk {
            if values.iter().any(|v| v == poison) {
                return Err(SluiceError::sql(format!("synthetic failure on {poison}")));
            }
        }
        Ok(())
    }

    fn pk_of(framing: &TableFraming, row: &[String]) -> Vec<String> {
        framing
            .key_columns
            .iter()
            .filter_map(|key| {
                framing
                    .columns
                    .iter()
                    .position(|c| c == key)
                    .and_then(|i| row.get(i))
                    .cloned()
            })
            .collect()
    }
}

#[async_trait]
impl SqlExecutor for MockSqlExecutor {
    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        let snapshot = state.tables.clone();
        state.txn_snapshot = Some(snapshot);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.txn_snapshot = None;
        state.savepoints.clear();
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.txn_snapshot.take() {
            state.tables = snapshot;
        }
        state.savepoints.clear();
        state.rollbacks += 1;
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let snapshot = state.tables.clone();
        state.savepoints.insert(name.to_string(), snapshot);
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let snapshot = state
            .savepoints
            .remove(name)
            .ok_or_else(|| SluiceError::sql(format!("unknown savepoint {name}")))?;
        state.tables = snapshot;
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.state.lock().savepoints.remove(name);
        Ok(())
    }

    async fn insert(&self, framing: &TableFraming, row: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_poison(&state, row)?;
        let pk = Self::pk_of(framing, row);
        let table = state.tables.entry(framing.table.clone()).or_default();
        if table.contains_key(&pk) {
            return Err(SluiceError::UniqueViolation(format!(
                "duplicate key {pk:?} on {}",
                framing.table
            )));
        }
        table.insert(pk, row.to_vec());
        Ok(())
    }

    async fn update(&self, framing: &TableFraming, row: &[String], pk: &[String]) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check_poison(&state, pk)?;
        let table = state.tables.entry(framing.table.clone()).or_default();
        match table.get_mut(&pk.to_vec()) {
            Some(existing) => {
                *existing = row.to_vec();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, framing: &TableFraming, pk: &[String]) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check_poison(&state, pk)?;
        let table = state.tables.entry(framing.table.clone()).or_default();
        Ok(table.remove(&pk.to_vec()).map(|_| 1).unwrap_or(0))
    }

    async fn execute(&self, statement: &str) -> Result<u64> {
        self.state.lock().executed.push(statement.to_string());
        Ok(0)
    }
}
