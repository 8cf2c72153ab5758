//! Polling orchestrator
//!
//! Drives one collection cycle per interval: connect, list, decide which
//! files need work, then download, parse, extract, map and persist each one
//! in turn. Files that fail stay pending and are picked up again next cycle.
//! A stop request is honoured between files and while sleeping.

use chrono::{NaiveDateTime, TimeDelta};
use ihm_common::checksum::sha256_hex;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::artifacts::ArtifactStore;
use super::change::ChangeDetector;
use super::ftp::{Credentials, FileSource, TransportSession};
use super::hooks::{run_hooks, PostPersistHook};
use super::models::{CandidateFile, FileProcessingState, ProcessedFile};
use super::storage::Persister;
use super::{incremental, mapper, normalizer};
use crate::error::{CollectorError, Result};

/// Cycle tuning
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub remote_dir: String,
    /// Local directory for downloads
    pub work_dir: PathBuf,
    pub poll_interval: Duration,
    /// Upper bound on files processed per cycle, `None` for no limit
    pub max_candidates_per_cycle: Option<usize>,
    /// Skip a candidate modified closer than this to the previous selection
    pub min_candidate_gap: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            remote_dir: "/InternalStorage/data/".to_string(),
            work_dir: PathBuf::from("tmp"),
            poll_interval: Duration::from_millis(60_000),
            max_candidates_per_cycle: None,
            min_candidate_gap: Duration::ZERO,
        }
    }
}

/// Counters for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// `.csv` files that passed the exclusion filter
    pub listed: usize,
    /// Listed files needing work after change detection
    pub candidates: usize,
    /// Candidates kept after thinning
    pub selected: usize,
    pub done: usize,
    /// Candidates still not done when the cycle ended
    pub pending: usize,
    pub failed: usize,
    pub rows_inserted: u64,
    pub cancelled: bool,
}

pub struct PollingOrchestrator {
    source: FileSource,
    credentials: Credentials,
    detector: ChangeDetector,
    persister: Persister,
    artifacts: Arc<dyn ArtifactStore>,
    hooks: Vec<PostPersistHook>,
    settings: OrchestratorSettings,
    in_flight: Option<String>,
}

impl PollingOrchestrator {
    pub fn new(
        source: FileSource,
        credentials: Credentials,
        persister: Persister,
        artifacts: Arc<dyn ArtifactStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            credentials,
            detector: ChangeDetector::new(),
            persister,
            artifacts,
            hooks: Vec::new(),
            settings,
            in_flight: None,
        }
    }

    /// Append a post-persist hook; hooks run in insertion order
    pub fn with_hook(mut self, hook: PostPersistHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn state(&self, name: &str) -> FileProcessingState {
        if self.detector.is_done(name) {
            FileProcessingState::Done
        } else if self.in_flight.as_deref() == Some(name) {
            FileProcessingState::InFlight
        } else {
            FileProcessingState::Pending
        }
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Start the polling loop in the background
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Poll until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            remote_dir = %self.settings.remote_dir,
            "Collector started"
        );

        while !cancel.is_cancelled() {
            match self.run_cycle(&cancel).await {
                Ok(report) => info!(
                    listed = report.listed,
                    candidates = report.candidates,
                    selected = report.selected,
                    done = report.done,
                    pending = report.pending,
                    failed = report.failed,
                    rows = report.rows_inserted,
                    "Collection cycle completed"
                ),
                Err(CollectorError::Connection(e)) => {
                    warn!(error = %e, "Controller unreachable, retrying next cycle")
                },
                Err(e) => error!(error = %e, "Collection cycle failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {},
            }
        }

        info!("Collector stopped");
    }

    /// Run one cycle
    ///
    /// Connection and listing failures end the cycle with an error; failures
    /// on individual files are counted in the report.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport> {
        info!("Starting collection cycle");

        let mut session = self.source.connect(&self.credentials).await?;
        let result = self.cycle_with_session(session.as_mut(), cancel).await;
        self.source.close(session).await;

        result
    }

    async fn cycle_with_session(
        &mut self,
        session: &mut dyn TransportSession,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let listed = self.source.list(session, &self.settings.remote_dir).await?;
        report.listed = listed.len();

        let mut needs_work = Vec::new();
        for file in listed {
            let first_sight = !self.detector.knows(&file.name);
            let status = self.detector.check(&file);
            if !status.needs_work() {
                debug!(file = %file.name, ?status, "No work needed");
                continue;
            }
            if first_sight && self.already_ingested(&file).await {
                info!(file = %file.name, "Rows already stored, marking done");
                self.detector.mark_done(&file, None);
                continue;
            }
            needs_work.push(file);
        }
        report.candidates = needs_work.len();

        let selected = select_candidates(
            needs_work,
            self.settings.max_candidates_per_cycle,
            self.settings.min_candidate_gap,
        );
        report.selected = selected.len();
        info!(
            listed = report.listed,
            candidates = report.candidates,
            selected = report.selected,
            "Files to process"
        );

        for file in selected {
            if cancel.is_cancelled() {
                info!("Stop requested, leaving remaining files pending");
                report.cancelled = true;
                break;
            }

            self.in_flight = Some(file.name.clone());
            let outcome = self.process_file(session, &file).await;
            self.in_flight = None;

            match outcome {
                Ok(processed) => {
                    report.done += 1;
                    report.rows_inserted += processed.inserted_rows;
                },
                Err(e) => {
                    report.failed += 1;
                    error!(file = %file.name, error = %e, "File left pending");
                },
            }
        }

        report.pending = report.candidates - report.done;
        Ok(report)
    }

    /// Whether the store already covers a file this process has not seen
    ///
    /// Needs stored rows, plus a watermark within a minute of the listed
    /// modification time when the listing has one. Store errors mean no.
    async fn already_ingested(&self, file: &CandidateFile) -> bool {
        let stored = match self.persister.count_by_file(&file.name).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(file = %file.name, error = %e, "Stored row count unavailable");
                return false;
            },
        };
        if stored == 0 {
            return false;
        }

        let Some(modified) = file.modified else {
            return true;
        };
        match self.persister.last_watermark(&file.name).await {
            Ok(watermark) => watermark
                .and_then(|w| w.timestamp())
                .is_some_and(|ts| ts + TimeDelta::minutes(1) >= modified),
            Err(e) => {
                warn!(file = %file.name, error = %e, "Stored watermark unavailable");
                false
            },
        }
    }

    #[instrument(skip_all, fields(file = %file.name))]
    async fn process_file(
        &mut self,
        session: &mut dyn TransportSession,
        file: &CandidateFile,
    ) -> Result<ProcessedFile> {
        let local_path = self
            .source
            .download(session, &self.settings.remote_dir, &file.name, &self.settings.work_dir)
            .await?;
        let content = tokio::fs::read(&local_path).await?;
        let content_hash = sha256_hex(&content);

        let mut processed = ProcessedFile {
            name: file.name.clone(),
            local_path,
            snapshot_path: None,
            parsed_rows: 0,
            mapped_rows: 0,
            inserted_rows: 0,
            stored_rows: 0,
        };

        if self.detector.content_unchanged(&file.name, &content_hash) {
            info!("Content unchanged since last ingest");
            self.detector.mark_done(file, Some(content_hash));
            return Ok(processed);
        }

        let normalized = normalizer::normalize(&file.name, &content);
        processed.parsed_rows = normalized.rows.len();
        processed.snapshot_path = Some(self.artifacts.write_snapshot(&normalized).await?);

        let watermark = self.persister.last_watermark(&file.name).await?;
        let increment = incremental::extract_new_rows(&normalized.rows, watermark.as_ref());
        let mapped = mapper::map_rows(&increment);
        debug!(
            parsed = normalized.rows.len(),
            skipped = normalized.skipped,
            new = increment.len(),
            mapped = mapped.len(),
            watermark = ?watermark,
            "Extracted increment"
        );

        let outcome = self.persister.insert_rows(&mapped, &file.name).await?;
        self.detector.mark_done(file, Some(content_hash));

        processed.mapped_rows = mapped.len();
        processed.inserted_rows = outcome.inserted;
        processed.stored_rows = outcome.stored;
        info!(inserted = outcome.inserted, stored = outcome.stored, "File done");

        self.run_post_persist(&processed).await;
        Ok(processed)
    }

    async fn run_post_persist(&self, processed: &ProcessedFile) {
        if self.hooks.is_empty() {
            return;
        }

        let hooks = self.hooks.clone();
        let file = processed.clone();
        match tokio::task::spawn_blocking(move || run_hooks(&hooks, &file)).await {
            Ok(0) => {},
            Ok(failed) => warn!(file = %processed.name, failed, "Some post-persist hooks failed"),
            Err(e) => error!(file = %processed.name, error = %e, "Post-persist hooks panicked"),
        }
    }
}

/// Newest first, capped at `max`, skipping files modified within `min_gap`
/// of the previous pick
pub fn select_candidates(
    mut files: Vec<CandidateFile>,
    max: Option<usize>,
    min_gap: Duration,
) -> Vec<CandidateFile> {
    files.sort_by(|a, b| match (a.modified, b.modified) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });

    let min_gap = TimeDelta::from_std(min_gap).unwrap_or(TimeDelta::MAX);
    let mut selected = Vec::new();
    let mut previous: Option<NaiveDateTime> = None;

    for file in files {
        if max.is_some_and(|max| selected.len() >= max) {
            break;
        }
        if let (Some(prev), Some(current)) = (previous, file.modified) {
            if prev - current < min_gap {
                debug!(file = %file.name, "Too close to previous selection, skipping");
                continue;
            }
        }
        if file.modified.is_some() {
            previous = file.modified;
        }
        selected.push(file);
    }

    selected
}
