//! Report ingestion pipeline
//!
//! The stages, in the order a file passes through them:
//!
//! - [`ftp`]: list and download report files from the controller
//! - [`exclusion`]: drop partial and system reports by name
//! - [`change`]: skip files already ingested and unchanged
//! - [`normalizer`]: parse raw CSV into [`NormalizedRow`]s
//! - [`incremental`]: keep only rows newer than the stored watermark
//! - [`mapper`]: shape rows for the `relatorio` table
//! - [`storage`]: insert with retries and verify the stored count
//! - [`hooks`]: backups, process log and local cleanup after a file is done
//!
//! [`orchestrator`] ties them together into a polling loop.

pub mod artifacts;
pub mod backup;
pub mod change;
pub mod exclusion;
pub mod ftp;
pub mod hooks;
pub mod incremental;
pub mod mapper;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod storage;

pub use artifacts::{ArtifactStore, FsArtifactStore};
pub use backup::{BackupMeta, BackupStore};
pub use change::{ChangeDetector, ChangeStatus};
pub use exclusion::ExclusionFilter;
pub use ftp::{Credentials, FileSource, FtpTransport, ListingEntry, Transport, TransportSession};
pub use hooks::PostPersistHook;
pub use models::{
    CandidateFile, FileProcessingState, NormalizedFile, NormalizedRow, PersistedRow,
    ProcessedFile, RemoteFileRef, Watermark,
};
pub use orchestrator::{CycleReport, OrchestratorSettings, PollingOrchestrator};
pub use storage::{InsertOutcome, Persister, PgRowStore, RetryPolicy, RowStore};
