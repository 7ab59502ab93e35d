//! # Batch Loader
//!
//! Applies a staged batch payload to the destination database inside one
//! transaction per batch.
//!
//! ## Conflict fallbacks
//!
//! A conflicting insert falls back to an update by key; a zero-row update
//! falls back to an insert. The insert attempt runs under a savepoint so the
//! failed statement does not poison the enclosing transaction. A zero-row
//! delete is a warning, not a failure, when `allow_missing_delete` is set.
//!
//! ## Failure semantics
//!
//! Any unrecovered row failure rolls the whole batch back and produces an
//! error acknowledgment carrying the failing line number and message. The
//! staged payload stays put so the batch can be retried or skipped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, warn};

use sluice_protocol::{
    BatchAck, BinaryEncoding, ProtocolError, TableFraming, WireEvent, WireReader,
};

use crate::config::LoaderConfig;
use crate::error::{Result, SluiceError};

const SP_BEFORE_INSERT: &str = "sp_before_insert";

/// Destination database seam. One executor instance serves one load at a
/// time; transaction state is the executor's.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    async fn savepoint(&self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()>;
    async fn release_savepoint(&self, name: &str) -> Result<()>;

    /// Insert one row. A key conflict must surface as
    /// [`SluiceError::UniqueViolation`].
    async fn insert(&self, framing: &TableFraming, row: &[String]) -> Result<()>;

    /// Update by key; returns the number of rows affected.
    async fn update(&self, framing: &TableFraming, row: &[String], pk: &[String]) -> Result<u64>;

    /// Delete by key; returns the number of rows affected.
    async fn delete(&self, framing: &TableFraming, pk: &[String]) -> Result<u64>;

    /// Execute a raw statement carried on a `sql` or `ddl` line.
    async fn execute(&self, statement: &str) -> Result<u64>;
}

/// Handler for a whitelisted `script` payload.
#[async_trait]
pub trait ScriptHandler: Send + Sync {
    async fn run(&self, body: &str) -> Result<()>;
}

/// Outcome of loading one staged batch.
#[derive(Debug)]
pub struct LoadOutcome {
    pub batch_id: u64,
    pub ack: BatchAck,
    pub summary: LoadSummary,
}

#[derive(Debug, Default, Clone)]
pub struct LoadSummary {
    pub rows_applied: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub sql_statements: u64,
    /// Inserts converted to updates on key conflict
    pub insert_fallbacks: u64,
    /// Updates converted to inserts on zero rows
    pub update_fallbacks: u64,
    pub missing_deletes: u64,
    pub incremental_commits: u64,
}

struct LoadState {
    batch_id: Option<u64>,
    source_node_id: String,
    encoding: BinaryEncoding,
    catalog: Option<String>,
    schema: Option<String>,
    framing: Option<TableFraming>,
    /// Framing by qualified table name, survives table interleave
    framing_cache: HashMap<String, TableFraming>,
    old_row: Option<Vec<String>>,
    rows_since_commit: u64,
    committed: bool,
}

impl LoadState {
    fn new() -> Self {
        Self {
            batch_id: None,
            source_node_id: String::new(),
            encoding: BinaryEncoding::default(),
            catalog: None,
            schema: None,
            framing: None,
            framing_cache: HashMap::new(),
            old_row: None,
            rows_since_commit: 0,
            committed: false,
        }
    }

    fn framing(&self, line_no: u64) -> Result<&TableFraming> {
        self.framing.as_ref().ok_or_else(|| {
            SluiceError::Protocol(ProtocolError::out_of_order(
                line_no,
                "row data before table framing",
            ))
        })
    }
}

/// Applies one staged batch payload through a [`SqlExecutor`].
pub struct BatchLoader {
    executor: Arc<dyn SqlExecutor>,
    config: LoaderConfig,
    script_handlers: HashMap<String, Arc<dyn ScriptHandler>>,
}

impl BatchLoader {
    pub fn new(executor: Arc<dyn SqlExecutor>, config: LoaderConfig) -> Self {
        Self {
            executor,
            config,
            script_handlers: HashMap::new(),
        }
    }

    /// Register a handler for `script` payloads equal to `name`. Payloads
    /// with no registered handler fail the batch.
    pub fn script_handler(mut self, name: impl Into<String>, handler: Arc<dyn ScriptHandler>) -> Self {
        self.script_handlers.insert(name.into(), handler);
        self
    }

    /// Load one staged payload. Row-level failures roll the batch back and
    /// come back as an error acknowledgment, not an `Err`.
    pub async fn load<R: BufRead>(&self, node_id: &str, reader: R) -> Result<LoadOutcome> {
        let mut state = LoadState::new();
        let mut summary = LoadSummary::default();
        self.executor.begin().await?;

        let result = self.apply_stream(reader, &mut state, &mut summary).await;
        // no batch line means there is nothing to ack against; close the
        // transaction and surface the failure to the caller
        let Some(batch_id) = state.batch_id else {
            self.executor.rollback().await?;
            return Err(match result {
                Err((_, e)) => e,
                Ok(()) => SluiceError::Protocol(ProtocolError::malformed(
                    0,
                    "stream carried no batch line",
                )),
            });
        };

        match result {
            Ok(()) => {
                if !state.committed {
                    self.executor.commit().await?;
                }
                debug!(batch = batch_id, rows = summary.rows_applied, "batch loaded");
                Ok(LoadOutcome {
                    batch_id,
                    ack: BatchAck::ok(batch_id, node_id),
                    summary,
                })
            }
            Err((line_no, e)) => {
                self.executor.rollback().await?;
                warn!(batch = batch_id, line = line_no, error = %e, "batch load failed, rolled back");
                Ok(LoadOutcome {
                    batch_id,
                    ack: BatchAck::error(batch_id, node_id, Some(line_no), e.to_string()),
                    summary: LoadSummary::default(),
                })
            }
        }
    }

    async fn apply_stream<R: BufRead>(
        &self,
        reader: R,
        state: &mut LoadState,
        summary: &mut LoadSummary,
    ) -> std::result::Result<(), (u64, SluiceError)> {
        let mut wire = WireReader::new(reader);
        loop {
            let line = wire.next_line().map_err(|e| (0, SluiceError::from(e)))?;
            let Some(line) = line else { break };
            let line_no = line.line_no;
            self.apply_line(line.event, line_no, state, summary)
                .await
                .map_err(|e| (line_no, e))?;
        }
        Ok(())
    }

    async fn apply_line(
        &self,
        event: WireEvent,
        line_no: u64,
        state: &mut LoadState,
        summary: &mut LoadSummary,
    ) -> Result<()> {
        match event {
            WireEvent::NodeId(id) => state.source_node_id = id,
            WireEvent::Binary(encoding) => state.encoding = encoding,
            WireEvent::Channel(_) => {}
            WireEvent::Catalog(catalog) => {
                state.catalog = if catalog.is_empty() { None } else { Some(catalog) };
            }
            WireEvent::Schema(schema) => {
                state.schema = if schema.is_empty() { None } else { Some(schema) };
            }
            WireEvent::Table(table) => {
                let mut framing = state
                    .framing_cache
                    .get(&table)
                    .cloned()
                    .unwrap_or_else(|| TableFraming::new(table.clone()));
                framing.catalog = state.catalog.clone();
                framing.schema = state.schema.clone();
                state.framing = Some(framing);
            }
            WireEvent::Keys(keys) => {
                let framing = state.framing.as_mut().ok_or_else(|| {
                    SluiceError::Protocol(ProtocolError::out_of_order(
                        line_no,
                        "keys line before table line",
                    ))
                })?;
                framing.key_columns = keys;
                state.framing_cache.insert(framing.table.clone(), framing.clone());
            }
            WireEvent::Columns(columns) => {
                let framing = state.framing.as_mut().ok_or_else(|| {
                    SluiceError::Protocol(ProtocolError::out_of_order(
                        line_no,
                        "columns line before table line",
                    ))
                })?;
                framing.columns = columns;
                state.framing_cache.insert(framing.table.clone(), framing.clone());
            }
            WireEvent::Batch(batch_id) => {
                state.batch_id = Some(batch_id);
            }
            WireEvent::Commit(_) => {}
            WireEvent::Retry(batch_id) => {
                state.batch_id = Some(batch_id);
            }
            WireEvent::Insert(row) => {
                let framing = state.framing(line_no)?.clone();
                self.apply_insert(&framing, &row, summary).await?;
                state.old_row = None;
                self.after_row(state, summary).await?;
            }
            WireEvent::Update(fields) => {
                let framing = state.framing(line_no)?.clone();
                let (row, pk) = split_update_fields(&framing, fields, line_no)?;
                self.apply_update(&framing, &row, &pk, summary).await?;
                state.old_row = None;
                self.after_row(state, summary).await?;
            }
            WireEvent::Delete(pk) => {
                let framing = state.framing(line_no)?.clone();
                self.apply_delete(&framing, &pk, summary).await?;
                state.old_row = None;
                self.after_row(state, summary).await?;
            }
            WireEvent::Old(row) => {
                state.old_row = Some(row);
            }
            WireEvent::Sql(statement) => {
                self.executor.execute(&statement).await?;
                summary.sql_statements += 1;
            }
            WireEvent::Ddl(statement) => {
                self.executor.execute(&statement).await?;
                summary.sql_statements += 1;
                // schema may have changed under the cached framing
                state.framing_cache.clear();
                state.framing = None;
            }
            WireEvent::Script(body) => {
                let handler = self.script_handlers.get(body.as_str()).ok_or_else(|| {
                    SluiceError::config(format!("no handler registered for script: {body}"))
                })?;
                handler.run(&body).await?;
            }
            WireEvent::StatsColumns(_) | WireEvent::Stats(_) => {}
            WireEvent::Unknown => {
                debug!(line = line_no, "skipping unknown wire token");
            }
        }
        Ok(())
    }

    async fn apply_insert(
        &self,
        framing: &TableFraming,
        row: &[String],
        summary: &mut LoadSummary,
    ) -> Result<()> {
        self.executor.savepoint(SP_BEFORE_INSERT).await?;
        match self.executor.insert(framing, row).await {
            Ok(()) => {
                self.executor.release_savepoint(SP_BEFORE_INSERT).await?;
                summary.inserts += 1;
                Ok(())
            }
            Err(SluiceError::UniqueViolation(msg)) if self.config.fallback_update => {
                self.executor.rollback_to_savepoint(SP_BEFORE_INSERT).await?;
                debug!(table = %framing.qualified_name(), "insert conflicted, falling back to update: {msg}");
                let pk = pk_from_row(framing, row)?;
                let affected = self.executor.update(framing, row, &pk).await?;
                if affected == 0 {
                    return Err(SluiceError::sql(format!(
                        "fallback update matched no rows on {}",
                        framing.qualified_name()
                    )));
                }
                summary.inserts += 1;
                summary.insert_fallbacks += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_update(
        &self,
        framing: &TableFraming,
        row: &[String],
        pk: &[String],
        summary: &mut LoadSummary,
    ) -> Result<()> {
        let affected = self.executor.update(framing, row, pk).await?;
        match affected {
            0 if self.config.fallback_insert => {
                debug!(table = %framing.qualified_name(), "update matched no rows, falling back to insert");
                self.executor.insert(framing, row).await?;
                summary.updates += 1;
                summary.update_fallbacks += 1;
            }
            0 => {
                return Err(SluiceError::sql(format!(
                    "update matched no rows on {}",
                    framing.qualified_name()
                )));
            }
            1 => summary.updates += 1,
            n => {
                warn!(
                    table = %framing.qualified_name(),
                    affected = n,
                    "update by key touched more than one row"
                );
                summary.updates += 1;
            }
        }
        Ok(())
    }

    async fn apply_delete(
        &self,
        framing: &TableFraming,
        pk: &[String],
        summary: &mut LoadSummary,
    ) -> Result<()> {
        let affected = self.executor.delete(framing, pk).await?;
        if affected == 0 {
            if !self.config.allow_missing_delete {
                return Err(SluiceError::sql(format!(
                    "delete matched no rows on {}",
                    framing.qualified_name()
                )));
            }
            warn!(table = %framing.qualified_name(), "delete matched no rows");
            summary.missing_deletes += 1;
        }
        summary.deletes += 1;
        Ok(())
    }

    /// Row bookkeeping shared by insert/update/delete: counters and the
    /// incremental commit boundary.
    async fn after_row(&self, state: &mut LoadState, summary: &mut LoadSummary) -> Result<()> {
        summary.rows_applied += 1;
        state.rows_since_commit += 1;
        if self.config.max_rows_before_commit > 0
            && state.rows_since_commit >= self.config.max_rows_before_commit
        {
            self.executor.commit().await?;
            self.executor.begin().await?;
            state.rows_since_commit = 0;
            summary.incremental_commits += 1;
        }
        Ok(())
    }
}

/// Split an update line's fields into (new row values, key values) using the
/// current framing. Full form carries columns then keys; the short form
/// carries columns only, with keys taken from the key columns' positions.
fn split_update_fields(
    framing: &TableFraming,
    fields: Vec<String>,
    line_no: u64,
) -> Result<(Vec<String>, Vec<String>)> {
    let n_cols = framing.columns.len();
    let n_keys = framing.key_columns.len();
    if n_cols == 0 {
        return Err(SluiceError::Protocol(ProtocolError::out_of_order(
            line_no,
            "update before columns line",
        )));
    }
    if fields.len() == n_cols + n_keys {
        let mut row = fields;
        let pk = row.split_off(n_cols);
        Ok((row, pk))
    } else if fields.len() == n_cols {
        let pk = pk_from_row(framing, &fields)?;
        Ok((fields, pk))
    } else {
        Err(SluiceError::Protocol(ProtocolError::malformed(
            line_no,
            format!(
                "update carries {} fields for {} columns and {} keys",
                fields.len(),
                n_cols,
                n_keys
            ),
        )))
    }
}

/// Derive key values from a full row by key column positions.
fn pk_from_row(framing: &TableFraming, row: &[String]) -> Result<Vec<String>> {
    framing
        .key_columns
        .iter()
        .map(|key| {
            framing
                .columns
                .iter()
                .position(|c| c == key)
                .and_then(|i| row.get(i))
                .cloned()
                .ok_or_else(|| {
                    SluiceError::sql(format!(
                        "key column {key} not present in columns of {}",
                        framing.qualified_name()
                    ))
                })
        })
        .collect()
}
