//! Wire format writer.
//!
//! Emits the line-oriented batch grammar. Long logical lines are flushed in
//! [`MAX_WRITE_LENGTH`](crate::MAX_WRITE_LENGTH) chunks so a single huge row
//! never forces one giant buffer write.

use std::io::Write;

use crate::csv::{escape_field, join_fields};
use crate::error::Result;
use crate::model::{BinaryEncoding, Statistics, TableFraming};
use crate::tokens;
use crate::MAX_WRITE_LENGTH;

/// Serializes batches into the wire format.
pub struct ProtocolWriter<W> {
    inner: W,
    lines_written: u64,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            lines_written: 0,
        }
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Write one logical line, chunking when it exceeds the write length.
    pub fn write_raw_line(&mut self, line: &str) -> Result<()> {
        if line.len() > MAX_WRITE_LENGTH {
            let bytes = line.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                let mut end = usize::min(i + MAX_WRITE_LENGTH, bytes.len());
                // never split inside a UTF-8 sequence
                while end < bytes.len() && !line.is_char_boundary(end) {
                    end -= 1;
                }
                self.inner.write_all(&bytes[i..end])?;
                i = end;
            }
        } else {
            self.inner.write_all(line.as_bytes())?;
        }
        self.inner.write_all(b"\n")?;
        self.lines_written += 1;
        Ok(())
    }

    fn write_tokenized(&mut self, token: &str, args: &[&str]) -> Result<()> {
        let mut fields = Vec::with_capacity(args.len() + 1);
        fields.push(token);
        fields.extend_from_slice(args);
        let line = join_fields(fields);
        self.write_raw_line(&line)
    }

    pub fn write_node_id(&mut self, node_id: &str) -> Result<()> {
        self.write_tokenized(tokens::NODEID, &[node_id])
    }

    pub fn write_binary(&mut self, encoding: BinaryEncoding) -> Result<()> {
        self.write_tokenized(tokens::BINARY, &[encoding.as_str()])
    }

    pub fn write_channel(&mut self, channel_id: &str) -> Result<()> {
        self.write_tokenized(tokens::CHANNEL, &[channel_id])
    }

    /// Emit full framing for a table: catalog/schema when present, then
    /// table, keys, columns.
    pub fn write_framing(&mut self, framing: &TableFraming) -> Result<()> {
        if let Some(catalog) = &framing.catalog {
            self.write_tokenized(tokens::CATALOG, &[catalog])?;
        }
        if let Some(schema) = &framing.schema {
            self.write_tokenized(tokens::SCHEMA, &[schema])?;
        }
        self.write_table(&framing.table)?;
        let keys: Vec<&str> = framing.key_columns.iter().map(String::as_str).collect();
        self.write_tokenized(tokens::KEYS, &keys)?;
        let cols: Vec<&str> = framing.columns.iter().map(String::as_str).collect();
        self.write_tokenized(tokens::COLUMNS, &cols)
    }

    pub fn write_table(&mut self, table: &str) -> Result<()> {
        self.write_tokenized(tokens::TABLE, &[table])
    }

    pub fn write_batch(&mut self, batch_id: u64) -> Result<()> {
        self.write_tokenized(tokens::BATCH, &[&batch_id.to_string()])
    }

    pub fn write_commit(&mut self, batch_id: u64) -> Result<()> {
        self.write_tokenized(tokens::COMMIT, &[&batch_id.to_string()])
    }

    pub fn write_retry(&mut self, batch_id: u64) -> Result<()> {
        self.write_tokenized(tokens::RETRY, &[&batch_id.to_string()])
    }

    pub fn write_insert(&mut self, row: &[String]) -> Result<()> {
        let args: Vec<&str> = row.iter().map(String::as_str).collect();
        self.write_tokenized(tokens::INSERT, &args)
    }

    /// Update rows carry new column values followed by lookup key values.
    pub fn write_update(&mut self, row: &[String], pk: &[String]) -> Result<()> {
        let mut args: Vec<&str> = row.iter().map(String::as_str).collect();
        args.extend(pk.iter().map(String::as_str));
        self.write_tokenized(tokens::UPDATE, &args)
    }

    pub fn write_delete(&mut self, pk: &[String]) -> Result<()> {
        let args: Vec<&str> = pk.iter().map(String::as_str).collect();
        self.write_tokenized(tokens::DELETE, &args)
    }

    pub fn write_old(&mut self, row: &[String]) -> Result<()> {
        let args: Vec<&str> = row.iter().map(String::as_str).collect();
        self.write_tokenized(tokens::OLD, &args)
    }

    pub fn write_sql(&mut self, statement: &str) -> Result<()> {
        self.write_tokenized(tokens::SQL, &[statement])
    }

    pub fn write_ddl(&mut self, statement: &str) -> Result<()> {
        self.write_tokenized(tokens::DDL, &[statement])
    }

    pub fn write_script(&mut self, body: &str) -> Result<()> {
        self.write_tokenized(tokens::SCRIPT, &[body])
    }

    /// Emit `stats_columns` and `stats` as a pair. Column order is sorted for
    /// a deterministic wire image; the leading stats value is the batch id,
    /// the rest pair with the columns positionally.
    pub fn write_stats(&mut self, batch_id: u64, stats: &Statistics) -> Result<()> {
        let mut names: Vec<(String, i64)> = Vec::new();
        for name in stats.names() {
            if let Some(value) = stats.get(&name) {
                names.push((name, value));
            }
        }
        names.sort();

        let mut columns_line = String::from(tokens::STATS_COLUMNS);
        let mut stats_line = format!("{},{}", tokens::STATS, batch_id);
        for (name, value) in &names {
            columns_line.push(',');
            columns_line.push_str(&escape_field(name));
            stats_line.push(',');
            stats_line.push_str(&value.to_string());
        }
        self.write_raw_line(&columns_line)?;
        self.write_raw_line(&stats_line)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
