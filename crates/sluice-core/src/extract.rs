//! # Batch Extractor
//!
//! Renders a routed batch into the wire format and stages the payload.
//! Table framing is emitted once per distinct table and re-emitted whenever
//! a different table interleaves, so the loading side can stream the batch
//! with only current-table state.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use sluice_protocol::{
    Batch, ChangeRecord, DataEventType, ProtocolWriter, Statistics, TableFraming,
};

use crate::error::{Result, SluiceError};
use crate::stage::{StagedResource, StagingManager};

/// Supplies table framing (key columns and column order) for extraction.
pub trait SchemaProvider: Send + Sync {
    fn framing_for(&self, table_name: &str) -> Option<TableFraming>;
}

/// Fixed table registry, configured up front.
#[derive(Default)]
pub struct StaticSchemaProvider {
    tables: HashMap<String, TableFraming>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, framing: TableFraming) -> Self {
        self.tables.insert(framing.table.clone(), framing);
        self
    }
}

impl SchemaProvider for StaticSchemaProvider {
    fn framing_for(&self, table_name: &str) -> Option<TableFraming> {
        self.tables.get(table_name).cloned()
    }
}

/// Writes routed batches into staged wire payloads.
pub struct BatchExtractor<'a> {
    staging: &'a StagingManager,
}

impl<'a> BatchExtractor<'a> {
    pub fn new(staging: &'a StagingManager) -> Self {
        Self { staging }
    }

    /// Extract one batch to the staging area. Returns the finished resource;
    /// the batch is updated in place with statistics and byte count.
    pub fn extract(
        &self,
        batch: &mut Batch,
        records: &[ChangeRecord],
        schema: &dyn SchemaProvider,
    ) -> Result<Arc<StagedResource>> {
        let location = batch.staged_location().to_string();
        let resource = self.staging.create(
            batch.staging_category(),
            &[&location, &batch.batch_id.to_string()],
        )?;
        let mut writer = ProtocolWriter::new(resource.writer()?);

        writer.write_node_id(&batch.source_node_id)?;
        writer.write_binary(batch.binary_encoding)?;
        writer.write_channel(&batch.channel_id)?;
        writer.write_batch(batch.batch_id)?;

        let mut current_table: Option<String> = None;
        for record in records {
            match record.event_type {
                DataEventType::Sql => {
                    let statement = record.row_data.first().map(String::as_str).unwrap_or("");
                    writer.write_sql(statement)?;
                    continue;
                }
                DataEventType::Ddl => {
                    let statement = record.row_data.first().map(String::as_str).unwrap_or("");
                    writer.write_ddl(statement)?;
                    continue;
                }
                _ => {}
            }

            if current_table.as_deref() != Some(record.table_name.as_str()) {
                let framing = schema.framing_for(&record.table_name).ok_or_else(|| {
                    SluiceError::config(format!(
                        "no framing registered for table {}",
                        record.table_name
                    ))
                })?;
                writer.write_framing(&framing)?;
                current_table = Some(record.table_name.clone());
            }

            match record.event_type {
                DataEventType::Insert | DataEventType::Reload => {
                    writer.write_insert(&record.row_data)?;
                }
                DataEventType::Update => {
                    if let Some(old) = &record.old_data {
                        writer.write_old(old)?;
                    }
                    writer.write_update(&record.row_data, &record.pk_data)?;
                }
                DataEventType::Delete => {
                    if let Some(old) = &record.old_data {
                        writer.write_old(old)?;
                    }
                    writer.write_delete(&record.pk_data)?;
                }
                DataEventType::Sql | DataEventType::Ddl => unreachable!(),
            }
        }

        let mut stats = Statistics::default();
        stats.set("ROWCOUNT", records.len() as i64);
        stats.set("INSERTCOUNT", batch.insert_count as i64);
        stats.set("UPDATECOUNT", batch.update_count as i64);
        stats.set("DELETECOUNT", batch.delete_count as i64);
        writer.write_stats(batch.batch_id, &stats)?;
        batch.statistics = stats;

        writer.write_commit(batch.batch_id)?;
        writer.flush()?;
        writer.into_inner().close()?;
        resource.set_done()?;
        batch.byte_count = resource.size();
        debug!(
            batch = batch.batch_id,
            node = %batch.target_node_id,
            bytes = batch.byte_count,
            "batch extracted to stage"
        );
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_protocol::BatchType;
    use tempfile::TempDir;

    fn framing() -> TableFraming {
        TableFraming::new("customer")
            .with_keys(["id"])
            .with_columns(["id", "name"])
    }

    fn change(id: u64, table: &str, event: DataEventType) -> ChangeRecord {
        ChangeRecord {
            data_id: id,
            table_name: table.to_string(),
            event_type: event,
            pk_data: vec![id.to_string()],
            row_data: vec![id.to_string(), "alice".to_string()],
            old_data: None,
            channel_id: "default".to_string(),
            transaction_id: None,
            source_node_id: "001".to_string(),
            create_time: chrono::Utc::now(),
        }
    }

    fn staged_text(resource: &StagedResource) -> String {
        String::from_utf8(resource.read_all().unwrap()).unwrap()
    }

    #[test]
    fn test_extract_writes_header_rows_and_commit() {
        let dir = TempDir::new().unwrap();
        let staging = StagingManager::new(dir.path(), 1024 * 1024).unwrap();
        let schema = StaticSchemaProvider::new().table(framing());
        let mut batch = Batch::new(BatchType::Outgoing, 5, "default", "001", "002");
        batch.insert_count = 2;
        let records = vec![
            change(1, "customer", DataEventType::Insert),
            change(2, "customer", DataEventType::Insert),
        ];

        let resource = BatchExtractor::new(&staging)
            .extract(&mut batch, &records, &schema)
            .unwrap();
        let text = staged_text(&resource);

        assert!(text.starts_with("nodeid,001\nbinary,NONE\nchannel,default\nbatch,5\n"));
        assert!(text.contains("table,customer\nkeys,id\ncolumns,id,name\n"));
        assert!(text.contains("insert,1,alice\ninsert,2,alice\n"));
        assert!(text.ends_with("commit,5\n"));
        assert_eq!(batch.byte_count, text.len() as u64);
        assert_eq!(batch.statistics.get("ROWCOUNT"), Some(2));
    }

    #[test]
    fn test_framing_once_per_table_reemitted_on_interleave() {
        let dir = TempDir::new().unwrap();
        let staging = StagingManager::new(dir.path(), 1024 * 1024).unwrap();
        let other = TableFraming::new("orders")
            .with_keys(["id"])
            .with_columns(["id", "name"]);
        let schema = StaticSchemaProvider::new().table(framing()).table(other);
        let mut batch = Batch::new(BatchType::Outgoing, 1, "default", "001", "002");
        let records = vec![
            change(1, "customer", DataEventType::Insert),
            change(2, "customer", DataEventType::Insert),
            change(3, "orders", DataEventType::Insert),
            change(4, "customer", DataEventType::Insert),
        ];

        let resource = BatchExtractor::new(&staging)
            .extract(&mut batch, &records, &schema)
            .unwrap();
        let text = staged_text(&resource);
        assert_eq!(text.matches("table,customer").count(), 2);
        assert_eq!(text.matches("table,orders").count(), 1);
    }

    #[test]
    fn test_update_carries_old_values_and_pk() {
        let dir = TempDir::new().unwrap();
        let staging = StagingManager::new(dir.path(), 1024 * 1024).unwrap();
        let schema = StaticSchemaProvider::new().table(framing());
        let mut batch = Batch::new(BatchType::Outgoing, 9, "default", "001", "002");
        let mut record = change(7, "customer", DataEventType::Update);
        record.old_data = Some(vec!["7".to_string(), "bob".to_string()]);

        let resource = BatchExtractor::new(&staging)
            .extract(&mut batch, &[record], &schema)
            .unwrap();
        let text = staged_text(&resource);
        assert!(text.contains("old,7,bob\nupdate,7,alice,7\n"));
    }

    #[test]
    fn test_unregistered_table_is_config_error() {
        let dir = TempDir::new().unwrap();
        let staging = StagingManager::new(dir.path(), 1024 * 1024).unwrap();
        let schema = StaticSchemaProvider::new();
        let mut batch = Batch::new(BatchType::Outgoing, 1, "default", "001", "002");
        let records = vec![change(1, "customer", DataEventType::Insert)];

        let err = BatchExtractor::new(&staging)
            .extract(&mut batch, &records, &schema)
            .unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }
}
