//! Fileloader Core
//!
//! A directory-watching ETL engine for tabular files. Each discovered file
//! runs a write-audit-publish pipeline:
//!
//! - **Readers** stream delimited text, spreadsheets, and JSON as lazy
//!   record sequences
//! - **Validation** coerces and constrains records against per-source row
//!   models, dead-lettering failures
//! - **Staging** lands validated records in an ephemeral per-file table via
//!   batched inserts
//! - **Audits** gate on grain uniqueness and source-declared checks
//! - **Merge** publishes the stage into the target with an idempotent,
//!   grain-keyed upsert
//!
//! Files run concurrently on a bounded worker pool; each pipeline owns its
//! run-log row, stage table, and counters, so failures stay isolated.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fileloader_core::config::Config;
//! use fileloader_core::db::{schema, Db};
//! use fileloader_core::notify::WebhookNotifier;
//! use fileloader_core::pipeline::PipelineContext;
//! use fileloader_core::scheduler::Scheduler;
//! use fileloader_core::sources::SourceRegistry;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let registry = Arc::new(SourceRegistry::from_json_file(&config.paths.sources_path)?);
//!     let db = Db::connect(
//!         &config.database.url,
//!         config.database.max_connections,
//!         config.database.acquire_timeout,
//!         config.database.statement_timeout,
//!     )
//!     .await?;
//!     schema::ensure_tables(&db, &registry).await?;
//!
//!     let ctx = Arc::new(PipelineContext {
//!         db,
//!         batch_size: config.batch_size,
//!         archive_dir: config.paths.archive_dir.clone(),
//!         duplicates_dir: config.paths.duplicates_dir.clone(),
//!         notifier: Arc::new(WebhookNotifier::new(None, None)),
//!         cancel: CancellationToken::new(),
//!     });
//!     let scheduler = Scheduler::new(ctx, registry, config.paths.watch_dir.clone(), config.workers);
//!     scheduler.run().await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod db;
pub mod dlq;
pub mod merge;
pub mod notify;
pub mod pipeline;
pub mod readers;
pub mod runlog;
pub mod scheduler;
pub mod sources;
pub mod stage;
pub mod validate;

pub use fileloader_common::{ErrorKind, LoadError};
