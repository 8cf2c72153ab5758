//! Post-persist hooks
//!
//! Hooks run in order after a file reaches done. A failing hook is logged and
//! the remaining hooks still run.

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backup::BackupStore;
use super::models::ProcessedFile;

pub type PostPersistHook = Arc<dyn Fn(&ProcessedFile) -> anyhow::Result<()> + Send + Sync>;

/// Run every hook, returning how many failed
pub fn run_hooks(hooks: &[PostPersistHook], file: &ProcessedFile) -> usize {
    let mut failed = 0;
    for (index, hook) in hooks.iter().enumerate() {
        if let Err(e) = hook(file) {
            warn!(
                file = %file.name,
                hook = index,
                error = %format!("{:#}", e),
                "Post-persist hook failed"
            );
            failed += 1;
        }
    }
    failed
}

/// Back up the raw CSV and, when present, its JSON snapshot
pub fn backup_hook(store: BackupStore) -> PostPersistHook {
    Arc::new(move |file: &ProcessedFile| -> anyhow::Result<()> {
        store
            .backup_file(&file.local_path, &file.name)
            .with_context(|| format!("Failed to back up {}", file.name))?;

        if let Some(snapshot) = file.snapshot_path.as_ref().filter(|p| p.exists()) {
            store
                .backup_file(snapshot, &format!("{}.json", file.name))
                .with_context(|| format!("Failed to back up snapshot of {}", file.name))?;
        }
        Ok(())
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessLogEntry<'a> {
    filename: &'a str,
    time: String,
    row_count: u64,
    status: &'static str,
}

/// Append one JSON line per processed file to `log_path`
pub fn process_log_hook(log_path: PathBuf) -> PostPersistHook {
    Arc::new(move |file: &ProcessedFile| -> anyhow::Result<()> {
        let entry = ProcessLogEntry {
            filename: &file.name,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            row_count: file.inserted_rows,
            status: if file.inserted_rows > 0 { "sucesso" } else { "vazio" },
        };

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open {}", log_path.display()))?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        out.write_all(&line)?;

        debug!(file = %file.name, rows = file.inserted_rows, "Process log appended");
        Ok(())
    })
}

/// Delete the local download once its rows are stored and a backup exists
pub fn cleanup_hook(backups: BackupStore) -> PostPersistHook {
    Arc::new(move |file: &ProcessedFile| -> anyhow::Result<()> {
        if file.stored_rows < file.mapped_rows as i64 {
            debug!(
                file = %file.name,
                stored = file.stored_rows,
                mapped = file.mapped_rows,
                "Keeping local copy, store is behind"
            );
            return Ok(());
        }
        if backups.latest_backup(&file.name)?.is_none() {
            debug!(file = %file.name, "Keeping local copy, no backup yet");
            return Ok(());
        }

        match std::fs::remove_file(&file.local_path) {
            Ok(()) => {
                info!(file = %file.name, path = %file.local_path.display(), "Removed local copy");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove {}", file.local_path.display())),
        }
    })
}
