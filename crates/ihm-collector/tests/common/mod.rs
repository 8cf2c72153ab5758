//! Shared fixtures for collector integration tests
//!
//! - [`ScriptedServer`]: an in-memory controller with switchable faults
//! - [`MemoryRowStore`]: a row store that can be told to fail
//! - [`TestPostgres`]: a throwaway PostgreSQL container with migrations applied

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use ihm_collector::error::{CollectorError, ConnectionError, PersistenceError};
use ihm_collector::ingest::ftp::{Credentials, ListingEntry, Transport, TransportSession};
use ihm_collector::ingest::{
    ExclusionFilter, FileSource, FsArtifactStore, OrchestratorSettings, PersistedRow, Persister,
    PollingOrchestrator, RetryPolicy, RowStore, Watermark,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing_subscriber::EnvFilter;

pub const REPORT: &str = "Relatorio_2025_08.csv";

pub const SAMPLE_CSV: &[u8] = include_bytes!("../fixtures/sample.csv");

/// Good rows in `fixtures/sample.csv`
pub const SAMPLE_ROWS: u64 = 20;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Headerless report with one row per minute from 17:00, for `minutes`
pub fn report_csv(minutes: std::ops::Range<u32>) -> Vec<u8> {
    let mut out = String::from("Relatorio de Producao - Linha 1\r\n");
    for minute in minutes {
        out.push_str(&format!(
            "26/08/25,17:{:02}:00,Lote {},1,0,{},{}\r\n",
            minute,
            minute % 4,
            100 + minute,
            200 + minute
        ));
    }
    out.into_bytes()
}

// ============================================================================
// Scripted controller
// ============================================================================

#[derive(Default)]
struct ServerState {
    files: BTreeMap<String, Vec<u8>>,
    modified: BTreeMap<String, NaiveDateTime>,
    refusing: bool,
    broken: HashSet<String>,
    connects: usize,
    closes: usize,
    retrievals: Vec<String>,
}

/// In-memory stand-in for the controller's FTP server
#[derive(Clone, Default)]
pub struct ScriptedServer {
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: &str, content: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(name.to_string(), content.into());
    }

    /// Report `at` as the modification time of `name` in listings
    pub fn touch(&self, name: &str, at: NaiveDateTime) {
        self.state
            .lock()
            .unwrap()
            .modified
            .insert(name.to_string(), at);
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.state.lock().unwrap().refusing = refusing;
    }

    /// Make RETR of `name` fail until [`ScriptedServer::repair`] is called
    pub fn break_file(&self, name: &str) {
        self.state.lock().unwrap().broken.insert(name.to_string());
    }

    pub fn repair(&self, name: &str) {
        self.state.lock().unwrap().broken.remove(name);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn retrievals(&self) -> Vec<String> {
        self.state.lock().unwrap().retrievals.clone()
    }
}

#[async_trait]
impl Transport for ScriptedServer {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn TransportSession>, ConnectionError> {
        let mut state = self.state.lock().unwrap();
        if state.refusing {
            return Err(ConnectionError::Refused {
                addr: credentials.addr(),
            });
        }
        state.connects += 1;
        Ok(Box::new(ScriptedSession {
            state: self.state.clone(),
        }))
    }
}

struct ScriptedSession {
    state: Arc<Mutex<ServerState>>,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn list(&mut self, _remote_dir: &str) -> ihm_collector::Result<Vec<ListingEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .iter()
            .map(|(name, content)| ListingEntry {
                modified: state.modified.get(name).copied(),
                ..ListingEntry::file(name.clone(), content.len() as u64)
            })
            .collect())
    }

    async fn retrieve(&mut self, remote_path: &str) -> ihm_collector::Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path).to_string();
        state.retrievals.push(name.clone());

        if state.broken.contains(&name) {
            return Err(CollectorError::transfer(remote_path, "451 local error in processing"));
        }
        state
            .files
            .get(&name)
            .cloned()
            .ok_or_else(|| CollectorError::transfer(remote_path, "550 file not found"))
    }

    async fn close(&mut self) -> ihm_collector::Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

// ============================================================================
// In-memory row store
// ============================================================================

/// Row store keeping `(tag, row)` pairs in insertion order
#[derive(Clone, Default)]
pub struct MemoryRowStore {
    rows: Arc<Mutex<Vec<(String, PersistedRow)>>>,
    failures_left: Arc<AtomicU32>,
    always_fail: Arc<AtomicBool>,
    insert_calls: Arc<AtomicU32>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` inserts
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn rows_for(&self, tag: &str) -> Vec<PersistedRow> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == tag)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn insert_rows(
        &self,
        rows: &[PersistedRow],
        file_tag: &str,
    ) -> std::result::Result<u64, PersistenceError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(PersistenceError::Store("connection reset by peer".into()));
        }
        let scheduled = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scheduled.is_ok() {
            return Err(PersistenceError::Store("deadlock detected".into()));
        }

        let mut stored = self.rows.lock().unwrap();
        stored.extend(rows.iter().map(|row| (file_tag.to_string(), row.clone())));
        Ok(rows.len() as u64)
    }

    async fn count_by_file(&self, file_tag: &str) -> std::result::Result<i64, PersistenceError> {
        Ok(self.rows_for(file_tag).len() as i64)
    }

    async fn last_watermark(
        &self,
        file_tag: &str,
    ) -> std::result::Result<Option<Watermark>, PersistenceError> {
        Ok(self
            .rows_for(file_tag)
            .into_iter()
            .rev()
            .filter_map(|row| Some(Watermark::new(row.dia?, row.hora?)))
            .find(|watermark| watermark.timestamp().is_some()))
    }
}

// ============================================================================
// Orchestrator wiring
// ============================================================================

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_unit: Duration::from_millis(10),
    }
}

pub fn settings(work_dir: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        work_dir: work_dir.to_path_buf(),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Orchestrator over the scripted server and memory store
pub fn collector(
    server: &ScriptedServer,
    store: &MemoryRowStore,
    work_dir: &Path,
) -> PollingOrchestrator {
    let source = FileSource::new(Arc::new(server.clone()), ExclusionFilter::default());
    let persister = Persister::new(Arc::new(store.clone()), fast_retry());
    PollingOrchestrator::new(
        source,
        Credentials::default(),
        persister,
        Arc::new(FsArtifactStore::new(work_dir)),
        settings(work_dir),
    )
}

// ============================================================================
// PostgreSQL container
// ============================================================================

/// PostgreSQL container with the collector schema applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
