//! # Batch Assembler
//!
//! Drives a line-oriented wire stream into staged batch resources.
//!
//! The assembler is the receive half of batch transfer: it consumes framing
//! and row tokens, opens one staged resource per `batch` token, deduplicates
//! table framing within a batch, re-emits framing cached from earlier batches
//! so every staged batch is self-contained, and finalizes the resource on
//! `commit`.
//!
//! ## Partial-failure isolation
//!
//! An I/O error mid-batch deletes the partial resource and stops processing,
//! but does not propagate: batches committed earlier in the same stream stay
//! staged and acknowledged.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use sluice_protocol::{
    Batch, BatchStatus, BatchType, BinaryEncoding, ProtocolError, ProtocolWriter, Statistics,
    WireEvent, WireReader,
};

use crate::error::{Result, SluiceError};
use crate::stage::{ResourceState, StagedResource, StagedWriter, StagingManager};

/// Observer of batch lifecycle events during assembly.
pub trait BatchListener: Send + Sync {
    fn batch_started(&self, _batch: &Batch) {}
    fn batch_finished(&self, _batch: &Batch, _resource: &Arc<StagedResource>) {}
}

/// Listener that collects finished batches; used by the pull job to hand
/// staged batches to the loader in arrival order.
#[derive(Default)]
pub struct CollectingListener {
    finished: parking_lot::Mutex<Vec<(Batch, Arc<StagedResource>)>>,
}

impl CollectingListener {
    pub fn take_finished(&self) -> Vec<(Batch, Arc<StagedResource>)> {
        std::mem::take(&mut self.finished.lock())
    }
}

impl BatchListener for CollectingListener {
    fn batch_finished(&self, batch: &Batch, resource: &Arc<StagedResource>) {
        self.finished.lock().push((batch.clone(), Arc::clone(resource)));
    }
}

/// Summary of one assembly pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssemblySummary {
    pub batches: u64,
    pub lines: u64,
    /// Set when a batch failed mid-write and was discarded
    pub failed_batch: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct TableKey {
    catalog_line: Option<String>,
    schema_line: Option<String>,
    table_line: String,
}

#[derive(Clone)]
struct TableLines {
    catalog_line: Option<String>,
    schema_line: Option<String>,
    table_line: String,
    keys_line: Option<String>,
    columns_line: Option<String>,
}

/// Writes a wire stream into staged resources, one per batch.
pub struct StagingWriter<'a> {
    staging: &'a StagingManager,
    batch_type: BatchType,
    /// Local node receiving (incoming) or remote target (outgoing re-stage)
    target_node_id: String,
    listeners: Vec<Arc<dyn BatchListener>>,
}

struct AssemblyState {
    node_line: Option<String>,
    binary_line: Option<String>,
    channel_line: Option<String>,
    node_id: Option<String>,
    encoding: BinaryEncoding,
    channel_id: Option<String>,
    catalog_line: Option<String>,
    schema_line: Option<String>,
    /// Framing seen before a writer is open; flushed after the batch line
    pending_header: Vec<String>,
    current_table: Option<TableKey>,
    sync_table_lines: HashMap<TableKey, TableLines>,
    batch_table_lines: HashMap<TableKey, TableLines>,
    stats_columns: Option<Vec<String>>,
    pending_stats: Option<Statistics>,
    batch: Option<Batch>,
    resource: Option<Arc<StagedResource>>,
    writer: Option<ProtocolWriter<StagedWriter>>,
    row_count: u64,
}

impl AssemblyState {
    fn new() -> Self {
        Self {
            node_line: None,
            binary_line: None,
            channel_line: None,
            node_id: None,
            encoding: BinaryEncoding::default(),
            channel_id: None,
            catalog_line: None,
            schema_line: None,
            pending_header: Vec::new(),
            current_table: None,
            sync_table_lines: HashMap::new(),
            batch_table_lines: HashMap::new(),
            stats_columns: None,
            pending_stats: None,
            batch: None,
            resource: None,
            writer: None,
            row_count: 0,
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => {
                writer.write_raw_line(line)?;
                Ok(())
            }
            None => {
                self.pending_header.push(line.to_string());
                Ok(())
            }
        }
    }
}

impl<'a> StagingWriter<'a> {
    pub fn new(
        staging: &'a StagingManager,
        batch_type: BatchType,
        target_node_id: impl Into<String>,
    ) -> Self {
        Self {
            staging,
            batch_type,
            target_node_id: target_node_id.into(),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn BatchListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Process an entire wire stream. I/O failures mid-batch are contained:
    /// the partial batch is discarded and earlier batches are unaffected.
    pub fn process<R: BufRead>(&self, reader: R) -> Result<AssemblySummary> {
        let mut state = AssemblyState::new();
        match self.process_inner(reader, &mut state) {
            Ok(summary) => Ok(summary),
            Err(e) if is_isolatable(&e) => {
                let failed = state.batch.as_ref().map(|b| b.batch_id);
                if let Some(resource) = state.resource.take() {
                    drop(state.writer.take());
                    if let Err(del) = resource.delete() {
                        warn!(error = %del, "could not delete partial staged resource");
                    }
                }
                error!(batch = ?failed, error = %e, "failed to stage batch, earlier batches unaffected");
                Ok(AssemblySummary {
                    batches: 0,
                    lines: 0,
                    failed_batch: failed,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn process_inner<R: BufRead>(
        &self,
        reader: R,
        state: &mut AssemblyState,
    ) -> Result<AssemblySummary> {
        let mut wire = WireReader::new(reader);
        let mut summary = AssemblySummary::default();
        let start = Instant::now();
        let mut last_report = start;

        while let Some(line) = wire.next_line()? {
            summary.lines += 1;
            match line.event {
                WireEvent::NodeId(id) => {
                    state.node_id = Some(id);
                    state.node_line = Some(line.raw);
                }
                WireEvent::Binary(encoding) => {
                    state.encoding = encoding;
                    state.binary_line = Some(line.raw);
                }
                WireEvent::Channel(channel) => {
                    state.channel_id = Some(channel);
                    state.channel_line = Some(line.raw);
                }
                WireEvent::Catalog(_) => {
                    state.catalog_line = Some(line.raw.clone());
                    state.write_line(&line.raw)?;
                }
                WireEvent::Schema(_) => {
                    state.schema_line = Some(line.raw.clone());
                    state.write_line(&line.raw)?;
                }
                WireEvent::Table(_) => self.on_table(state, &line.raw)?,
                WireEvent::Keys(_) => {
                    if let Some(key) = state.current_table.clone() {
                        if let Some(lines) = state.batch_table_lines.get_mut(&key) {
                            lines.keys_line = Some(line.raw.clone());
                        }
                        if let Some(lines) = state.sync_table_lines.get_mut(&key) {
                            lines.keys_line = Some(line.raw.clone());
                        }
                    }
                    state.write_line(&line.raw)?;
                }
                WireEvent::Columns(_) => {
                    if let Some(key) = state.current_table.clone() {
                        if let Some(lines) = state.batch_table_lines.get_mut(&key) {
                            lines.columns_line = Some(line.raw.clone());
                        }
                        if let Some(lines) = state.sync_table_lines.get_mut(&key) {
                            lines.columns_line = Some(line.raw.clone());
                        }
                    }
                    state.write_line(&line.raw)?;
                }
                WireEvent::Batch(batch_id) => {
                    self.on_batch(state, batch_id, &line.raw)?;
                    summary.batches += 1;
                }
                WireEvent::Commit(_) => self.on_commit(state, &line.raw)?,
                WireEvent::Retry(batch_id) => self.on_retry(state, batch_id)?,
                WireEvent::StatsColumns(fields) => {
                    state.stats_columns = Some(fields);
                }
                WireEvent::Stats(fields) => {
                    if let Some(columns) = &state.stats_columns {
                        state.pending_stats = Some(Statistics::from_wire(columns, &fields)?);
                    }
                }
                _ => self.on_data_row(state, &line.raw, &line.event, line.line_no)?,
            }

            if last_report.elapsed().as_secs() >= 60 {
                info!(
                    batch = state.batch.as_ref().map(|b| b.batch_id),
                    elapsed_secs = start.elapsed().as_secs(),
                    lines = summary.lines,
                    bytes = state.resource.as_ref().map(|r| r.size()).unwrap_or(0),
                    "transfer to stage still processing"
                );
                last_report = Instant::now();
            }
        }
        Ok(summary)
    }

    fn on_table(&self, state: &mut AssemblyState, raw: &str) -> Result<()> {
        let key = TableKey {
            catalog_line: state.catalog_line.clone(),
            schema_line: state.schema_line.clone(),
            table_line: raw.to_string(),
        };
        if state.batch_table_lines.contains_key(&key) {
            // framing already in this batch: the table line alone suffices
            state.current_table = Some(key);
            state.write_line(raw)?;
        } else if let Some(sync_lines) = state.sync_table_lines.get(&key).cloned() {
            // seen in a prior batch: re-emit full framing so the staged
            // batch needs no cross-batch state at the loader
            if let Some(catalog) = &sync_lines.catalog_line {
                state.write_line(catalog)?;
            }
            if let Some(schema) = &sync_lines.schema_line {
                state.write_line(schema)?;
            }
            state.write_line(raw)?;
            if let Some(keys) = &sync_lines.keys_line {
                state.write_line(keys)?;
            }
            if let Some(columns) = &sync_lines.columns_line {
                state.write_line(columns)?;
            }
            state.batch_table_lines.insert(key.clone(), sync_lines);
            state.current_table = Some(key);
        } else {
            let lines = TableLines {
                catalog_line: state.catalog_line.clone(),
                schema_line: state.schema_line.clone(),
                table_line: raw.to_string(),
                keys_line: None,
                columns_line: None,
            };
            state.sync_table_lines.insert(key.clone(), lines.clone());
            state.batch_table_lines.insert(key.clone(), lines);
            state.current_table = Some(key);
            state.write_line(raw)?;
        }
        Ok(())
    }

    fn on_batch(&self, state: &mut AssemblyState, batch_id: u64, raw: &str) -> Result<()> {
        let source_node = state.node_id.clone().unwrap_or_default();
        let channel = state.channel_id.clone().unwrap_or_default();
        let mut batch = Batch::new(
            self.batch_type,
            batch_id,
            channel,
            source_node,
            self.target_node_id.clone(),
        );
        batch.binary_encoding = state.encoding;
        batch.status = BatchStatus::Loading;

        let location = batch.staged_location().to_string();
        let resource = self.staging.create(
            batch.staging_category(),
            &[&location, &batch_id.to_string()],
        )?;
        let mut writer = ProtocolWriter::new(resource.writer()?);
        if let Some(node_line) = &state.node_line {
            writer.write_raw_line(node_line)?;
        }
        if let Some(binary_line) = &state.binary_line {
            writer.write_raw_line(binary_line)?;
        }
        if let Some(channel_line) = &state.channel_line {
            writer.write_raw_line(channel_line)?;
        }
        writer.write_raw_line(raw)?;
        // framing that arrived ahead of the batch line
        for line in state.pending_header.drain(..) {
            writer.write_raw_line(&line)?;
        }
        state.writer = Some(writer);
        state.resource = Some(resource);
        state.row_count = 0;

        for listener in &self.listeners {
            listener.batch_started(&batch);
        }
        debug!(batch = batch_id, "staging batch started");
        state.batch = Some(batch);
        Ok(())
    }

    fn on_commit(&self, state: &mut AssemblyState, raw: &str) -> Result<()> {
        if let Some(mut writer) = state.writer.take() {
            writer.write_raw_line(raw)?;
            writer.flush()?;
            writer.into_inner().close()?;
        }
        let resource = state.resource.take();
        if let Some(resource) = &resource {
            resource.set_done()?;
        }
        state.batch_table_lines.clear();

        if let Some(mut batch) = state.batch.take() {
            batch.data_row_count = state.row_count;
            if let Some(stats) = state.pending_stats.take() {
                batch.statistics = stats;
            }
            if let Some(resource) = &resource {
                batch.byte_count = resource.size();
                for listener in &self.listeners {
                    listener.batch_finished(&batch, resource);
                }
            }
            debug!(batch = batch.batch_id, rows = batch.data_row_count, "staging batch finished");
        }
        Ok(())
    }

    fn on_retry(&self, state: &mut AssemblyState, batch_id: u64) -> Result<()> {
        let source_node = state.node_id.clone().unwrap_or_default();
        let channel = state.channel_id.clone().unwrap_or_default();
        let batch = Batch::new(
            self.batch_type,
            batch_id,
            channel,
            source_node,
            self.target_node_id.clone(),
        );
        let location = batch.staged_location().to_string();
        let existing = self
            .staging
            .find(batch.staging_category(), &[&location, &batch_id.to_string()]);
        match existing {
            Some(resource) if resource.state() == ResourceState::Create => {
                // a previous attempt never finished; start clean
                resource.delete()?;
                state.resource = None;
                state.writer = None;
            }
            Some(resource) => {
                // complete payload already staged: resume without recreate
                debug!(batch = batch_id, path = %resource.path(), "retry for staged batch, reusing");
                state.resource = Some(resource);
                state.writer = None;
            }
            None => {
                state.resource = None;
                state.writer = None;
            }
        }
        for listener in &self.listeners {
            listener.batch_started(&batch);
        }
        state.batch = Some(batch);
        Ok(())
    }

    fn on_data_row(
        &self,
        state: &mut AssemblyState,
        raw: &str,
        event: &WireEvent,
        line_no: u64,
    ) -> Result<()> {
        if state.writer.is_none() {
            return Err(SluiceError::Protocol(ProtocolError::out_of_order(
                line_no,
                format!("batch data received outside a batch: {raw}"),
            )));
        }

        // Legacy producers may send rows for a table whose keys/columns were
        // framed in an earlier batch only. Inject the cached framing so the
        // loader never needs cross-batch state.
        if let Some(key) = state.current_table.clone() {
            let needs_injection = match state.batch_table_lines.get(&key) {
                None => true,
                Some(lines) => lines.columns_line.is_none(),
            };
            if needs_injection {
                if let Some(sync_lines) = state.sync_table_lines.get(&key).cloned() {
                    debug!("injecting keys and columns for backwards compatibility");
                    if !state.batch_table_lines.contains_key(&key) {
                        state.write_line(&sync_lines.table_line.clone())?;
                    }
                    if let Some(keys) = &sync_lines.keys_line {
                        state.write_line(keys)?;
                    }
                    if let Some(columns) = &sync_lines.columns_line {
                        state.write_line(columns)?;
                    }
                    state.batch_table_lines.insert(key, sync_lines);
                }
            }
        }

        if event.is_row_event() {
            state.row_count += 1;
        }
        state.write_line(raw)
    }
}

fn is_isolatable(e: &SluiceError) -> bool {
    matches!(
        e,
        SluiceError::Io(_) | SluiceError::Staging(_) | SluiceError::Protocol(ProtocolError::Io(_))
    )
}
