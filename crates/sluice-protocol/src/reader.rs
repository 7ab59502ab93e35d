//! Line-oriented wire format reader.
//!
//! Yields one [`WireLine`] per logical line: the raw text (so pass-through
//! writers like the staging assembler can echo it verbatim) plus the parsed
//! [`WireEvent`]. Unrecognized tokens parse as [`WireEvent::Unknown`] so
//! newer producers don't break older consumers.

use std::io::BufRead;

use crate::csv::split_fields;
use crate::error::{ProtocolError, Result};
use crate::model::BinaryEncoding;
use crate::tokens;

/// A parsed wire line.
#[derive(Debug, Clone, PartialEq)]
pub struct WireLine {
    /// Raw line text without the trailing newline
    pub raw: String,
    /// 1-based line number in the stream
    pub line_no: u64,
    pub event: WireEvent,
}

/// One decoded wire token with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    NodeId(String),
    Binary(BinaryEncoding),
    Channel(String),
    Catalog(String),
    Schema(String),
    Table(String),
    Keys(Vec<String>),
    Columns(Vec<String>),
    Batch(u64),
    /// Row values; for updates the trailing fields are the lookup keys and
    /// the consumer splits them using its current table template
    Insert(Vec<String>),
    Update(Vec<String>),
    Delete(Vec<String>),
    Old(Vec<String>),
    Sql(String),
    Ddl(String),
    Script(String),
    StatsColumns(Vec<String>),
    Stats(Vec<String>),
    Commit(u64),
    Retry(u64),
    /// Token not in this protocol version; carried through untouched
    Unknown,
}

impl WireEvent {
    /// Whether this event is a data row or statement (counts toward row
    /// statistics), as opposed to framing.
    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            Self::Insert(_)
                | Self::Update(_)
                | Self::Delete(_)
                | Self::Sql(_)
                | Self::Ddl(_)
                | Self::Script(_)
        )
    }
}

/// Streaming reader over the wire batch format.
pub struct WireReader<R> {
    inner: R,
    line_no: u64,
}

impl<R: BufRead> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, line_no: 0 }
    }

    /// Read the next logical line, or `None` at end of stream. Blank lines
    /// are skipped.
    pub fn next_line(&mut self) -> Result<Option<WireLine>> {
        loop {
            let mut raw = String::new();
            let n = self.inner.read_line(&mut raw)?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            while raw.ends_with('\n') || raw.ends_with('\r') {
                raw.pop();
            }
            if raw.trim().is_empty() {
                continue;
            }
            let event = self.parse(&raw)?;
            return Ok(Some(WireLine {
                raw,
                line_no: self.line_no,
                event,
            }));
        }
    }

    fn parse(&self, raw: &str) -> Result<WireEvent> {
        let fields = split_fields(raw);
        let token = fields[0].as_str();
        let arg = |i: usize| fields.get(i).cloned().unwrap_or_default();
        let rest = || fields[1..].to_vec();

        let event = match token {
            tokens::NODEID => WireEvent::NodeId(arg(1)),
            tokens::BINARY => WireEvent::Binary(BinaryEncoding::parse(&arg(1))?),
            tokens::CHANNEL => WireEvent::Channel(arg(1)),
            tokens::CATALOG => WireEvent::Catalog(arg(1)),
            tokens::SCHEMA => WireEvent::Schema(arg(1)),
            tokens::TABLE => {
                if fields.len() < 2 || fields[1].is_empty() {
                    return Err(ProtocolError::malformed(self.line_no, "table without name"));
                }
                WireEvent::Table(arg(1))
            }
            tokens::KEYS => WireEvent::Keys(rest()),
            tokens::COLUMNS => WireEvent::Columns(rest()),
            tokens::BATCH => WireEvent::Batch(self.parse_id(&arg(1))?),
            tokens::COMMIT => WireEvent::Commit(self.parse_id(&arg(1))?),
            tokens::RETRY => WireEvent::Retry(self.parse_id(&arg(1))?),
            tokens::INSERT => WireEvent::Insert(rest()),
            tokens::UPDATE => WireEvent::Update(rest()),
            tokens::DELETE => WireEvent::Delete(rest()),
            tokens::OLD => WireEvent::Old(rest()),
            tokens::SQL => WireEvent::Sql(arg(1)),
            tokens::DDL => WireEvent::Ddl(arg(1)),
            tokens::SCRIPT => WireEvent::Script(arg(1)),
            tokens::STATS_COLUMNS => WireEvent::StatsColumns(fields.clone()),
            tokens::STATS => WireEvent::Stats(fields.clone()),
            _ => WireEvent::Unknown,
        };
        Ok(event)
    }

    fn parse_id(&self, value: &str) -> Result<u64> {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidNumber {
                line_no: self.line_no,
                value: value.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(input: &str) -> Vec<WireLine> {
        let mut reader = WireReader::new(Cursor::new(input.to_string()));
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_framing_tokens() {
        let lines = read_all(
            "nodeid, 001\nbinary, BASE64\nchannel, default\n\
             table, customer\nkeys, id\ncolumns, id, name\nbatch, 7\n",
        );
        assert_eq!(lines[0].event, WireEvent::NodeId("001".into()));
        assert_eq!(lines[1].event, WireEvent::Binary(BinaryEncoding::Base64));
        assert_eq!(lines[2].event, WireEvent::Channel("default".into()));
        assert_eq!(lines[3].event, WireEvent::Table("customer".into()));
        assert_eq!(lines[4].event, WireEvent::Keys(vec!["id".into()]));
        assert_eq!(
            lines[5].event,
            WireEvent::Columns(vec!["id".into(), "name".into()])
        );
        assert_eq!(lines[6].event, WireEvent::Batch(7));
    }

    #[test]
    fn test_row_events() {
        let lines = read_all("insert, 5, alice\nupdate, 5, bob, 5\ndelete, 5\ncommit, 7\n");
        assert_eq!(
            lines[0].event,
            WireEvent::Insert(vec!["5".into(), "alice".into()])
        );
        assert!(lines[0].event.is_row_event());
        assert_eq!(
            lines[1].event,
            WireEvent::Update(vec!["5".into(), "bob".into(), "5".into()])
        );
        assert_eq!(lines[2].event, WireEvent::Delete(vec!["5".into()]));
        assert_eq!(lines[3].event, WireEvent::Commit(7));
        assert!(!lines[3].event.is_row_event());
    }

    #[test]
    fn test_raw_preserved() {
        let lines = read_all("insert, a\\,b, c\n");
        assert_eq!(lines[0].raw, "insert, a\\,b, c");
        assert_eq!(
            lines[0].event,
            WireEvent::Insert(vec!["a,b".into(), "c".into()])
        );
    }

    #[test]
    fn test_blank_lines_skipped_and_line_numbers() {
        let lines = read_all("batch, 1\n\n\ncommit, 1\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_no, 1);
        assert_eq!(lines[1].line_no, 4);
    }

    #[test]
    fn test_bad_batch_id() {
        let mut reader = WireReader::new(Cursor::new("batch, abc\n".to_string()));
        assert!(reader.next_line().is_err());
    }

    #[test]
    fn test_unknown_token_passes_through() {
        let lines = read_all("wibble, 42\n");
        assert_eq!(lines[0].event, WireEvent::Unknown);
        assert_eq!(lines[0].raw, "wibble, 42");
    }
}
