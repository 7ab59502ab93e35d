//! # Sluice Core
//!
//! Trigger-based change-data-capture replication engine. Captured row
//! changes flow through routing, staging, and transport to peer nodes,
//! where they are applied transactionally and acknowledged.
//!
//! ```text
//!   capture            route              extract           push/pull
//!  ┌─────────┐   ┌──────────────┐   ┌───────────────┐   ┌─────────────┐
//!  │ change  │──▶│ gap-aware    │──▶│ wire payload  │──▶│ HTTP peer   │
//!  │ log     │   │ batching     │   │ in staging    │   │ transport   │
//!  └─────────┘   └──────────────┘   └───────────────┘   └──────┬──────┘
//!                                                              │
//!  ┌─────────┐   ┌──────────────┐   ┌───────────────┐          │
//!  │  ack    │◀──│ transactional│◀──│ assemble to   │◀─────────┘
//!  │         │   │ load         │   │ staging       │
//!  └─────────┘   └──────────────┘   └───────────────┘
//! ```
//!
//! Guarantees:
//! - Per target node, batches load in batch-id order; an errored batch
//!   blocks its node until skipped or retried.
//! - A source transaction is never split across batches when atomic
//!   transactions are enabled.
//! - A batch either loads completely or rolls back completely (up to the
//!   configured incremental commit boundary).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sluice_core::{
//!     batches::InMemoryBatchStore, changelog::InMemoryChangeLog,
//!     cluster::InMemoryLockStore, config::EngineConfig, engine::Engine,
//!     extract::StaticSchemaProvider,
//!     route::{InMemoryRouterStateStore, StaticTargetRouter},
//!     transport::HttpTransport,
//! };
//! # use sluice_core::load::SqlExecutor;
//! # fn executor() -> Arc<dyn SqlExecutor> { unimplemented!() }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::builder("001")
//!     .staging_dir("/var/lib/sluice/staging")
//!     .peer("002", "http://peer:31415/sync")
//!     .build();
//! let transport = Arc::new(HttpTransport::new("001", &config.transport)?);
//! let engine = Engine::new(
//!     config,
//!     Arc::new(InMemoryChangeLog::new()),
//!     Arc::new(InMemoryBatchStore::new()),
//!     executor(),
//!     Arc::new(StaticSchemaProvider::new()),
//!     Arc::new(StaticTargetRouter::new(vec!["002".into()])),
//!     Arc::new(InMemoryRouterStateStore::new()),
//!     transport,
//!     Arc::new(InMemoryLockStore::new()),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod assemble;
pub mod batches;
pub mod changelog;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod load;
pub mod route;
pub mod stage;
pub mod testutil;
pub mod transport;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::Engine;
pub use error::{ErrorCategory, Result, SluiceError};
pub use jobs::JobScheduler;

// Wire-level types shared with peers
pub use sluice_protocol::{
    Batch, BatchAck, BatchStatus, BatchType, BinaryEncoding, ChangeRecord, DataEventType, DataGap,
    Statistics, TableFraming,
};
