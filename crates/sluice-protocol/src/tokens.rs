//! Wire format token spellings.
//!
//! These are the first field of every wire line. Order of emission matters
//! within a batch; the spellings themselves are frozen wire contract.

pub const NODEID: &str = "nodeid";
pub const BINARY: &str = "binary";
pub const CHANNEL: &str = "channel";
pub const CATALOG: &str = "catalog";
pub const SCHEMA: &str = "schema";
pub const TABLE: &str = "table";
pub const KEYS: &str = "keys";
pub const COLUMNS: &str = "columns";
pub const BATCH: &str = "batch";
pub const INSERT: &str = "insert";
pub const UPDATE: &str = "update";
pub const DELETE: &str = "delete";
pub const OLD: &str = "old";
pub const SQL: &str = "sql";
pub const DDL: &str = "ddl";
pub const SCRIPT: &str = "script";
pub const STATS_COLUMNS: &str = "stats_columns";
pub const STATS: &str = "stats";
pub const COMMIT: &str = "commit";
pub const RETRY: &str = "retry";
