//! Replication model types shared between the extract and load sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};

/// How binary column values are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BinaryEncoding {
    #[default]
    None,
    Base64,
    Hex,
}

impl BinaryEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Base64 => "BASE64",
            Self::Hex => "HEX",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "NONE" => Ok(Self::None),
            "BASE64" => Ok(Self::Base64),
            "HEX" => Ok(Self::Hex),
            other => Err(ProtocolError::UnknownEncoding(other.to_string())),
        }
    }
}

/// The kind of change a [`ChangeRecord`] captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEventType {
    Insert,
    Update,
    Delete,
    /// Raw SQL statement to replay verbatim
    Sql,
    /// Schema change statement
    Ddl,
    /// Request to re-extract a table from scratch
    Reload,
}

impl DataEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sql => "sql",
            Self::Ddl => "ddl",
            Self::Reload => "reload",
        }
    }

    /// Whether this event carries row data (as opposed to a statement).
    pub fn is_dml(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// One captured row change, written by a source-database trigger into the
/// change log and consumed exactly once per target by the router.
///
/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonic, gap-tracked sequence id assigned at capture time
    pub data_id: u64,
    /// Source table name
    pub table_name: String,
    /// What happened to the row
    pub event_type: DataEventType,
    /// Primary key values (order matches the table's key columns)
    pub pk_data: Vec<String>,
    /// New column values (order matches the table's columns)
    pub row_data: Vec<String>,
    /// Previous column values, when the trigger captures them
    pub old_data: Option<Vec<String>>,
    /// Channel this change belongs to
    pub channel_id: String,
    /// Source transaction id, for atomic-transaction batching
    pub transaction_id: Option<String>,
    /// Node where the change originated
    pub source_node_id: String,
    /// Capture timestamp
    pub create_time: DateTime<Utc>,
}

impl ChangeRecord {
    /// Rough wire size estimate used by the partitioner's byte threshold.
    pub fn estimated_bytes(&self) -> usize {
        let mut size = 32 + self.table_name.len();
        size += self.pk_data.iter().map(|v| v.len() + 1).sum::<usize>();
        size += self.row_data.iter().map(|v| v.len() + 1).sum::<usize>();
        if let Some(old) = &self.old_data {
            size += old.iter().map(|v| v.len() + 1).sum::<usize>();
        }
        size
    }
}

/// Direction of a batch relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchType {
    /// Extracted locally, destined for a remote node
    Outgoing,
    /// Received from a remote node, to be loaded locally
    Incoming,
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created by the router, not yet extracted
    New,
    /// Router/extractor is filling it
    Routing,
    /// In transit to the target
    Sending,
    /// Being replayed at the destination
    Loading,
    /// Applied and acknowledged
    Ok,
    /// Failed; blocks later batches for the same node until resolved
    Error,
    /// Administratively skipped
    Ignored,
}

impl BatchStatus {
    /// Statuses that still reference their staged payload. Staging purge must
    /// not touch resources belonging to batches in these states.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::New | Self::Routing | Self::Sending | Self::Loading | Self::Error
        )
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Ok | Self::Ignored)
    }
}

/// An ordered, atomically-applied set of change records destined for one
/// node/channel. The unit of transmission and application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Unique per target node
    pub batch_id: u64,
    /// Named partition of replication traffic
    pub channel_id: String,
    /// Node that extracted the batch
    pub source_node_id: String,
    /// Node that will load the batch
    pub target_node_id: String,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub binary_encoding: BinaryEncoding,
    /// Bytes staged for this batch
    pub byte_count: u64,
    pub data_row_count: u64,
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    /// Error detail when status is Error
    pub sql_message: Option<String>,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    /// Wire-carried statistics attached at commit time
    #[serde(default)]
    pub statistics: Statistics,
}

impl Batch {
    pub fn new(
        batch_type: BatchType,
        batch_id: u64,
        channel_id: impl Into<String>,
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            batch_id,
            channel_id: channel_id.into(),
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            batch_type,
            status: BatchStatus::New,
            binary_encoding: BinaryEncoding::default(),
            byte_count: 0,
            data_row_count: 0,
            insert_count: 0,
            update_count: 0,
            delete_count: 0,
            sql_message: None,
            create_time: now,
            last_update_time: now,
            statistics: Statistics::default(),
        }
    }

    /// Staging location segment for this batch: the remote node's id, so all
    /// payloads exchanged with one peer live under one directory.
    pub fn staged_location(&self) -> &str {
        match self.batch_type {
            BatchType::Outgoing => &self.target_node_id,
            BatchType::Incoming => &self.source_node_id,
        }
    }

    /// Staging category for this batch's payload.
    pub fn staging_category(&self) -> &'static str {
        match self.batch_type {
            BatchType::Outgoing => "outgoing",
            BatchType::Incoming => "incoming",
        }
    }
}

/// Acknowledgment returned by the loading side for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: u64,
    pub node_id: String,
    pub status: BatchStatus,
    /// Line number in the wire stream where the failure occurred, if any
    pub error_line: Option<u64>,
    pub sql_message: Option<String>,
}

impl BatchAck {
    pub fn ok(batch_id: u64, node_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            status: BatchStatus::Ok,
            error_line: None,
            sql_message: None,
        }
    }

    pub fn error(
        batch_id: u64,
        node_id: impl Into<String>,
        error_line: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            status: BatchStatus::Error,
            error_line,
            sql_message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == BatchStatus::Ok
    }
}

/// A range of change-log sequence ids known to be skipped, recorded so the
/// router never blocks waiting for ids that will never appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataGap {
    pub start_id: u64,
    pub end_id: u64,
    pub create_time: DateTime<Utc>,
}

impl DataGap {
    pub fn new(start_id: u64, end_id: u64) -> Self {
        Self {
            start_id,
            end_id,
            create_time: Utc::now(),
        }
    }

    pub fn contains(&self, data_id: u64) -> bool {
        data_id >= self.start_id && data_id <= self.end_id
    }

    pub fn gap_size(&self) -> u64 {
        self.end_id - self.start_id + 1
    }

    pub fn overlaps(&self, other: &DataGap) -> bool {
        self.start_id <= other.end_id && other.start_id <= self.end_id
    }
}

/// Table identity plus ordered key/column names, emitted once per distinct
/// table identity within a batch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFraming {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
    pub key_columns: Vec<String>,
    pub columns: Vec<String>,
}

impl TableFraming {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            table: table.into(),
            key_columns: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_keys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, keys: I) -> Self {
        self.key_columns = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_columns<I: IntoIterator<Item = S>, S: Into<String>>(mut self, cols: I) -> Self {
        self.columns = cols.into_iter().map(Into::into).collect();
        self
    }

    /// Cache key: equality over (catalog, schema, table).
    pub fn identity(&self) -> (Option<&str>, Option<&str>, &str) {
        (
            self.catalog.as_deref(),
            self.schema.as_deref(),
            &self.table,
        )
    }

    /// Fully qualified name for logging.
    pub fn qualified_name(&self) -> String {
        let mut name = String::new();
        if let Some(catalog) = &self.catalog {
            name.push_str(catalog);
            name.push('.');
        }
        if let Some(schema) = &self.schema {
            name.push_str(schema);
            name.push('.');
        }
        name.push_str(&self.table);
        name
    }
}

/// Named counters carried on `stats_columns`/`stats` wire lines and attached
/// to a batch at commit time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Statistics {
    values: HashMap<String, i64>,
}

impl Statistics {
    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn increment(&mut self, name: &str, delta: i64) {
        *self.values.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Build from the full split fields of parallel `stats_columns` / `stats`
    /// wire lines. The columns line holds the token then names; the stats
    /// line holds the token, the batch id, then values, so values sit one
    /// field to the right of their names.
    pub fn from_wire(columns: &[String], values: &[String]) -> Result<Self> {
        let mut stats = Statistics::default();
        for (i, column) in columns.iter().enumerate().skip(1) {
            if let Some(raw) = values.get(i + 1) {
                let value = raw.trim().parse::<i64>().map_err(|_| {
                    ProtocolError::InvalidNumber {
                        line_no: 0,
                        value: raw.clone(),
                    }
                })?;
                stats.set(column.clone(), value);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_encoding_roundtrip() {
        for enc in [BinaryEncoding::None, BinaryEncoding::Base64, BinaryEncoding::Hex] {
            assert_eq!(BinaryEncoding::parse(enc.as_str()).unwrap(), enc);
        }
        assert!(BinaryEncoding::parse("GZIP").is_err());
    }

    #[test]
    fn test_batch_staged_location() {
        let outgoing = Batch::new(BatchType::Outgoing, 1, "default", "001", "002");
        assert_eq!(outgoing.staged_location(), "002");
        assert_eq!(outgoing.staging_category(), "outgoing");

        let incoming = Batch::new(BatchType::Incoming, 1, "default", "001", "002");
        assert_eq!(incoming.staged_location(), "001");
        assert_eq!(incoming.staging_category(), "incoming");
    }

    #[test]
    fn test_batch_status_pending() {
        assert!(BatchStatus::New.is_pending());
        assert!(BatchStatus::Error.is_pending());
        assert!(!BatchStatus::Ok.is_pending());
        assert!(!BatchStatus::Ignored.is_pending());
    }

    #[test]
    fn test_data_gap() {
        let gap = DataGap::new(5, 9);
        assert!(gap.contains(5));
        assert!(gap.contains(9));
        assert!(!gap.contains(10));
        assert_eq!(gap.gap_size(), 5);
        assert!(gap.overlaps(&DataGap::new(9, 20)));
        assert!(!gap.overlaps(&DataGap::new(10, 20)));
    }

    #[test]
    fn test_framing_identity() {
        let a = TableFraming::new("customer").with_schema("public");
        let b = TableFraming::new("customer")
            .with_schema("public")
            .with_keys(["id"])
            .with_columns(["id", "name"]);
        // Identity ignores key/column lists
        assert_eq!(a.identity(), b.identity());
        assert_eq!(b.qualified_name(), "public.customer");
    }

    #[test]
    fn test_ack_json_roundtrip() {
        // acks cross the HTTP boundary as JSON
        let ack = BatchAck::error(42, "002", Some(9), "duplicate key");
        let json = serde_json::to_string(&ack).unwrap();
        let back: BatchAck = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_id, 42);
        assert_eq!(back.status, BatchStatus::Error);
        assert_eq!(back.error_line, Some(9));
        assert!(!back.is_ok());
    }

    #[test]
    fn test_statistics_from_wire() {
        let columns: Vec<String> = ["stats_columns", "rows", "bytes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let values: Vec<String> = ["stats", "7", "42", "1024"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let stats = Statistics::from_wire(&columns, &values).unwrap();
        assert_eq!(stats.get("rows"), Some(42));
        assert_eq!(stats.get("bytes"), Some(1024));
        assert_eq!(stats.get("stats_columns"), None);
    }
}
