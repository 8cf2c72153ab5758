//! IHM Collector Library
//!
//! Polls an industrial controller's FTP server for CSV production reports
//! and loads new rows into PostgreSQL.
//!
//! A cycle lists the report directory, filters out partial and system
//! reports, skips files already ingested, and for each remaining file
//! downloads it, normalizes the CSV, keeps the rows newer than the last
//! stored row, and inserts them with retries. Files that fail stay pending
//! until the next cycle.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ihm_collector::config::CollectorConfig;
//! use ihm_collector::ingest::{
//!     ExclusionFilter, FileSource, FsArtifactStore, FtpTransport, Persister, PgRowStore,
//!     PollingOrchestrator,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CollectorConfig::load()?;
//!     let pool = sqlx::PgPool::connect(&config.database.url).await?;
//!
//!     let filter = ExclusionFilter::new(config.controller.exclude_patterns.as_deref());
//!     let source = FileSource::new(Arc::new(FtpTransport), filter);
//!     let persister = Persister::new(Arc::new(PgRowStore::new(pool)), config.retry_policy());
//!     let artifacts = Arc::new(FsArtifactStore::new(&config.polling.work_dir));
//!
//!     let mut collector = PollingOrchestrator::new(
//!         source,
//!         config.credentials(),
//!         persister,
//!         artifacts,
//!         config.orchestrator_settings(),
//!     );
//!     let report = collector.run_cycle(&CancellationToken::new()).await?;
//!     println!("{} rows inserted", report.rows_inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ingest;

pub use config::CollectorConfig;
pub use error::{CollectorError, Result};
