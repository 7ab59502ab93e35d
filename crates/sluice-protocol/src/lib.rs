//! Sluice Wire Protocol
//!
//! This crate defines the line-oriented batch wire format shared between the
//! extracting and loading sides of a sluice deployment, plus the replication
//! model types that ride on it.
//!
//! # Wire Format
//!
//! A batch stream is a sequence of comma-delimited, backslash-escaped lines.
//! Token order matters within a batch:
//!
//! ```text
//! nodeid, 001
//! binary, BASE64
//! channel, default
//! catalog, corp
//! schema, public
//! table, customer
//! keys, id
//! columns, id, name
//! batch, 77
//! insert, 5, alice
//! commit, 77
//! ```
//!
//! Table framing (`catalog`/`schema`/`table`/`keys`/`columns`) is emitted once
//! per distinct table identity within a batch and must be re-emitted whenever
//! a different table identity interleaves.
//!
//! # Protocol Stability
//!
//! Token spellings are part of the wire contract with deployed peers. Do not
//! rename them.

mod csv;
mod error;
mod model;
mod reader;
mod writer;

pub mod tokens;

pub use csv::{join_fields, split_fields};
pub use error::{ProtocolError, Result};
pub use model::{
    Batch, BatchAck, BatchStatus, BatchType, BinaryEncoding, ChangeRecord, DataEventType, DataGap,
    Statistics, TableFraming,
};
pub use reader::{WireEvent, WireLine, WireReader};
pub use writer::ProtocolWriter;

/// Maximum number of characters written per physical chunk of one logical
/// line. Longer lines are flushed in pieces to avoid one huge buffer write.
pub const MAX_WRITE_LENGTH: usize = 32 * 1024;
