//! Processed-file snapshots
//!
//! Every parsed report is kept as `<work_dir>/processed/<name>.json` with the
//! shape `{ "source": ..., "rows": [...] }`. Nothing in the pipeline reads the
//! snapshots back; they feed backups and manual inspection.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::models::NormalizedFile;
use crate::error::{CollectorError, Result};

/// Write-only sink for normalized files
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist the snapshot and return where it landed
    async fn write_snapshot(&self, file: &NormalizedFile) -> Result<PathBuf>;
}

/// Snapshots on the local filesystem
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    work_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.work_dir.join("processed")
    }

    pub fn snapshot_path(&self, source: &str) -> PathBuf {
        self.processed_dir().join(format!("{}.json", source))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write_snapshot(&self, file: &NormalizedFile) -> Result<PathBuf> {
        let plain_name = Path::new(&file.source)
            .file_name()
            .is_some_and(|n| n == file.source.as_str());
        if !plain_name {
            return Err(CollectorError::Artifact(format!(
                "snapshot name '{}' is not a plain file name",
                file.source
            )));
        }

        let dir = self.processed_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.snapshot_path(&file.source);
        let staging = path.with_extension("json.partial");
        let body = serde_json::to_vec_pretty(file)?;

        tokio::fs::write(&staging, &body).await?;
        tokio::fs::rename(&staging, &path).await?;

        debug!(
            file = %file.source,
            rows = file.rows.len(),
            path = %path.display(),
            "Snapshot written"
        );
        Ok(path)
    }
}
