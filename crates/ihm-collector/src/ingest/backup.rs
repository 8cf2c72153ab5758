//! Local backups of ingested files
//!
//! Each backup is a copy named `<timestamp>-<original name>` plus a metadata
//! sidecar `<stored name>.meta.json`. Backups within the same millisecond get
//! a counter after the timestamp. Restoring is done by hand.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{CollectorError, Result};

const SIDECAR_SUFFIX: &str = ".meta.json";

/// Sidecar written next to every backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub original_name: String,
    pub stored_name: String,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
    pub backup_path: PathBuf,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `source` into the backup directory under `original_name`
    pub fn backup_file(&self, source: &Path, original_name: &str) -> Result<BackupMeta> {
        self.backup_file_at(source, original_name, Utc::now())
    }

    fn backup_file_at(
        &self,
        source: &Path,
        original_name: &str,
        now: DateTime<Utc>,
    ) -> Result<BackupMeta> {
        fs::create_dir_all(&self.dir)?;

        let stamp = now
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        let (stored_name, backup_path, mut target) = self.create_unique(&stamp, original_name)?;

        let size = io::copy(&mut File::open(source)?, &mut target)?;

        let meta = BackupMeta {
            original_name: original_name.to_string(),
            stored_name,
            mimetype: mimetype_for(original_name).map(str::to_string),
            size: Some(size),
            backup_path,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let meta_path = self.dir.join(format!("{}{}", meta.stored_name, SIDECAR_SUFFIX));
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;

        info!(file = %original_name, stored = %meta.stored_name, bytes = size, "Backup stored");
        Ok(meta)
    }

    /// Create `<stamp>-<name>`, or `<stamp>-<n>-<name>` when that is taken
    fn create_unique(&self, stamp: &str, original_name: &str) -> Result<(String, PathBuf, File)> {
        let mut n = 0u32;
        loop {
            let stored_name = match n {
                0 => format!("{}-{}", stamp, original_name),
                n => format!("{}-{}-{}", stamp, n, original_name),
            };
            let path = self.dir.join(&stored_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((stored_name, path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(CollectorError::Io(e)),
            }
        }
    }

    /// All readable sidecars, newest first
    pub fn list(&self) -> Result<Vec<BackupMeta>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CollectorError::Io(e)),
        };

        let mut metas = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX));
            if !is_sidecar {
                continue;
            }
            match fs::read(&path).map(|raw| serde_json::from_slice::<BackupMeta>(&raw)) {
                Ok(Ok(meta)) => metas.push(meta),
                _ => debug!(path = %path.display(), "Skipping unreadable sidecar"),
            }
        }

        metas.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(metas)
    }

    pub fn latest_backup(&self, original_name: &str) -> Result<Option<BackupMeta>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|meta| meta.original_name == original_name))
    }
}

fn mimetype_for(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    if lower.ends_with(".csv") {
        Some("text/csv")
    } else if lower.ends_with(".json") {
        Some("application/json")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_writes_copy_and_sidecar() {
        let work = tempfile::tempdir().unwrap();
        let source = work.path().join("Relatorio_2025_08.csv");
        fs::write(&source, b"title\n26/08/25,17:40:00,A,1,2\n").unwrap();

        let store = BackupStore::new(work.path().join("backups"));
        let meta = store.backup_file(&source, "Relatorio_2025_08.csv").unwrap();

        assert!(meta.stored_name.ends_with("-Relatorio_2025_08.csv"));
        assert!(!meta.stored_name.contains(':'));
        assert_eq!(meta.mimetype.as_deref(), Some("text/csv"));
        assert_eq!(fs::read(&meta.backup_path).unwrap(), fs::read(&source).unwrap());

        let sidecar = store.dir().join(format!("{}.meta.json", meta.stored_name));
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(sidecar).unwrap()).unwrap();
        assert_eq!(raw["originalName"], "Relatorio_2025_08.csv");
        assert_eq!(raw["storedName"], meta.stored_name.as_str());
    }

    #[test]
    fn test_same_millisecond_backups_do_not_overwrite() {
        let work = tempfile::tempdir().unwrap();
        let first = work.path().join("first.csv");
        let second = work.path().join("second.csv");
        fs::write(&first, b"first").unwrap();
        fs::write(&second, b"second").unwrap();

        let store = BackupStore::new(work.path().join("backups"));
        let now = Utc::now();
        let a = store.backup_file_at(&first, "a.csv", now).unwrap();
        let b = store.backup_file_at(&second, "a.csv", now).unwrap();

        assert_ne!(a.stored_name, b.stored_name);
        assert!(b.stored_name.ends_with("-1-a.csv"));
        assert_eq!(fs::read(&a.backup_path).unwrap(), b"first");
        assert_eq!(fs::read(&b.backup_path).unwrap(), b"second");

        let mut stored: Vec<_> = store.list().unwrap().into_iter().map(|m| m.stored_name).collect();
        stored.sort();
        let mut expected = vec![a.stored_name, b.stored_name];
        expected.sort();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_latest_backup_ignores_snapshot_copies() {
        let work = tempfile::tempdir().unwrap();
        let csv = work.path().join("a.csv");
        let snapshot = work.path().join("a.csv.json");
        fs::write(&csv, b"x").unwrap();
        fs::write(&snapshot, br#"{"source":"a.csv","rows":[]}"#).unwrap();

        let store = BackupStore::new(work.path().join("backups"));
        assert!(store.latest_backup("a.csv").unwrap().is_none());

        store.backup_file(&csv, "a.csv").unwrap();
        store.backup_file(&snapshot, "a.csv.json").unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        let latest = store.latest_backup("a.csv").unwrap().unwrap();
        assert_eq!(latest.original_name, "a.csv");
    }
}
