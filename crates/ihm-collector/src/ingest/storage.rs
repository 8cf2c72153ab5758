//! Row persistence
//!
//! [`RowStore`] is the seam to the relational store; [`PgRowStore`] is the
//! PostgreSQL implementation. [`Persister`] wraps any store with bounded,
//! linearly backed-off retries and checks that every row actually landed.
//!
//! Stores must apply one `insert_rows` call all-or-nothing: a failed attempt
//! is retried with the full batch. Once a store has accepted a batch it is
//! never sent again, whatever the follow-up count says.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::models::{PersistedRow, Watermark, MAX_SLOTS};
use crate::error::PersistenceError;

/// Rows per INSERT statement, well under the 65535 bind limit
const INSERT_CHUNK_ROWS: usize = 1000;

/// Recent date-shaped rows checked when looking for a watermark
const WATERMARK_SCAN_ROWS: i64 = 100;

/// Relational store for mapped rows
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert `rows` tagged with `file_tag`, returning the number inserted
    async fn insert_rows(
        &self,
        rows: &[PersistedRow],
        file_tag: &str,
    ) -> Result<u64, PersistenceError>;

    async fn count_by_file(&self, file_tag: &str) -> Result<i64, PersistenceError>;

    /// (Dia, Hora) of the most recently inserted row for `file_tag` whose
    /// pair parses as a timestamp; summary rows like `TOTAL,--` are skipped
    async fn last_watermark(&self, file_tag: &str) -> Result<Option<Watermark>, PersistenceError>;
}

/// Retry bound and linear backoff for inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt `n` failing waits `n * backoff_unit`
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// Result of a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    /// Rows held for the tag after the insert
    pub stored: i64,
    pub attempts: u32,
}

/// Retrying front for a [`RowStore`]
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn RowStore>,
    policy: RetryPolicy,
}

impl Persister {
    pub fn new(store: Arc<dyn RowStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn last_watermark(
        &self,
        file_tag: &str,
    ) -> Result<Option<Watermark>, PersistenceError> {
        self.store.last_watermark(file_tag).await
    }

    pub async fn count_by_file(&self, file_tag: &str) -> Result<i64, PersistenceError> {
        self.store.count_by_file(file_tag).await
    }

    /// Insert with retry
    ///
    /// Only a failed baseline count or a failed insert is retried. The count
    /// taken after a committed insert catches a store that reports success
    /// without storing everything; that shortfall fails without a retry.
    pub async fn insert_rows(
        &self,
        rows: &[PersistedRow],
        file_tag: &str,
    ) -> Result<InsertOutcome, PersistenceError> {
        if rows.is_empty() {
            let stored = self.store.count_by_file(file_tag).await?;
            return Ok(InsertOutcome {
                inserted: 0,
                stored,
                attempts: 0,
            });
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(file = %file_tag, attempt, max_attempts, rows = rows.len(), "Inserting rows");

            match self.try_insert(rows, file_tag).await {
                Ok((baseline, inserted)) => {
                    return self
                        .verify_landed(rows.len(), file_tag, baseline, inserted, attempt)
                        .await;
                },
                Err(e) if attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        file = %file_tag,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Insert failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    error!(
                        file = %file_tag,
                        attempts = attempt,
                        error = %e,
                        "Insert retries exhausted"
                    );
                    return Err(PersistenceError::RetriesExhausted {
                        file: file_tag.to_string(),
                        rows: rows.len(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                },
            }
        }
    }

    /// Baseline count then insert; returns `(baseline, inserted)`
    async fn try_insert(
        &self,
        rows: &[PersistedRow],
        file_tag: &str,
    ) -> Result<(i64, u64), PersistenceError> {
        let baseline = self.store.count_by_file(file_tag).await?;
        let inserted = self.store.insert_rows(rows, file_tag).await?;
        Ok((baseline, inserted))
    }

    /// Check a committed insert against the baseline
    async fn verify_landed(
        &self,
        expected: usize,
        file_tag: &str,
        baseline: i64,
        inserted: u64,
        attempts: u32,
    ) -> Result<InsertOutcome, PersistenceError> {
        let stored = match self.store.count_by_file(file_tag).await {
            Ok(stored) => stored,
            Err(e) => {
                // The batch is committed, a re-insert would duplicate it
                warn!(
                    file = %file_tag,
                    inserted,
                    error = %e,
                    "Row count after insert failed, trusting the store's insert count"
                );
                baseline + inserted as i64
            },
        };

        let expected = expected as i64;
        let landed = stored - baseline;
        if landed < expected {
            error!(file = %file_tag, expected, landed, "Committed insert is short of rows");
            return Err(PersistenceError::Shortfall {
                file: file_tag.to_string(),
                expected,
                landed,
            });
        }

        info!(file = %file_tag, inserted, stored, attempts, "Rows persisted");
        Ok(InsertOutcome {
            inserted,
            stored,
            attempts,
        })
    }
}

/// PostgreSQL store over the `relatorio` table
#[derive(Clone)]
pub struct PgRowStore {
    pool: PgPool,
}

impl PgRowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

fn insert_columns() -> String {
    let mut columns = vec![
        r#""Dia""#.to_string(),
        r#""Hora""#.to_string(),
        r#""Nome""#.to_string(),
        r#""Form1""#.to_string(),
        r#""Form2""#.to_string(),
    ];
    columns.extend((1..=MAX_SLOTS).map(|i| format!(r#""Prod_{}""#, i)));
    columns.push(r#""processedFile""#.to_string());
    columns.join(", ")
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn insert_rows(
        &self,
        rows: &[PersistedRow],
        file_tag: &str,
    ) -> Result<u64, PersistenceError> {
        let columns = insert_columns();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO relatorio ({}) ", columns));

            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.dia.clone())
                    .push_bind(row.hora.clone())
                    .push_bind(row.nome.clone())
                    .push_bind(row.form1)
                    .push_bind(row.form2);
                for value in row.prod {
                    b.push_bind(value);
                }
                b.push_bind(file_tag.to_string());
            });

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn count_by_file(&self, file_tag: &str) -> Result<i64, PersistenceError> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM relatorio WHERE "processedFile" = $1"#)
                .bind(file_tag)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn last_watermark(&self, file_tag: &str) -> Result<Option<Watermark>, PersistenceError> {
        // Shape filter first; the parse below rejects impossible dates
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT "Dia", "Hora"
            FROM relatorio
            WHERE "processedFile" = $1
              AND "Dia" ~ '^\s*(\d{1,2}/\d{1,2}/\d{2,4}|\d{4}-\d{2}-\d{2})\s*$'
              AND "Hora" ~ '^\s*\d{1,2}:\d{2}(:\d{2})?\s*$'
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(file_tag)
        .bind(WATERMARK_SCAN_ROWS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(dia, hora)| Watermark { dia, hora })
            .find(|watermark| watermark.timestamp().is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` inserts, then stores everything
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
        rows: Mutex<i64>,
        drop_one: bool,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                rows: Mutex::new(0),
                drop_one: false,
            }
        }
    }

    #[async_trait]
    impl RowStore for FlakyStore {
        async fn insert_rows(
            &self,
            rows: &[PersistedRow],
            _file_tag: &str,
        ) -> Result<u64, PersistenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(PersistenceError::Store(format!("connection reset ({call})")));
            }
            let landed = if self.drop_one { rows.len() - 1 } else { rows.len() };
            *self.rows.lock().unwrap() += landed as i64;
            Ok(rows.len() as u64)
        }

        async fn count_by_file(&self, _file_tag: &str) -> Result<i64, PersistenceError> {
            Ok(*self.rows.lock().unwrap())
        }

        async fn last_watermark(
            &self,
            _file_tag: &str,
        ) -> Result<Option<Watermark>, PersistenceError> {
            Ok(None)
        }
    }

    fn rows(n: usize) -> Vec<PersistedRow> {
        (0..n)
            .map(|i| PersistedRow {
                form1: Some(i as i32),
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_twice_then_succeed() {
        let store = Arc::new(FlakyStore::new(2));
        let persister = Persister::new(store.clone(), RetryPolicy::default());

        let started = tokio::time::Instant::now();
        let outcome = persister.insert_rows(&rows(4), "a.csv").await.unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.inserted, 4);
        assert_eq!(outcome.stored, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_store_exhausts_retries() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let persister = Persister::new(store.clone(), RetryPolicy::default());

        let err = persister.insert_rows(&rows(2), "a.csv").await.unwrap_err();
        match err {
            PersistenceError::RetriesExhausted { attempts, rows, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(rows, 2);
                assert!(matches!(*last, PersistenceError::Store(_)));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortfall_fails_without_reinserting() {
        let store = Arc::new(FlakyStore {
            drop_one: true,
            ..FlakyStore::new(0)
        });
        let persister = Persister::new(store.clone(), RetryPolicy::default());

        let err = persister.insert_rows(&rows(3), "a.csv").await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Shortfall {
                expected: 3,
                landed: 2,
                ..
            }
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*store.rows.lock().unwrap(), 2);
    }

    /// Commits every insert; the count right after the first insert errors
    struct CountFailsAfterInsert {
        rows: Mutex<i64>,
        counts: AtomicU32,
        inserts: AtomicU32,
    }

    #[async_trait]
    impl RowStore for CountFailsAfterInsert {
        async fn insert_rows(
            &self,
            rows: &[PersistedRow],
            _file_tag: &str,
        ) -> Result<u64, PersistenceError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            *self.rows.lock().unwrap() += rows.len() as i64;
            Ok(rows.len() as u64)
        }

        async fn count_by_file(&self, _file_tag: &str) -> Result<i64, PersistenceError> {
            let call = self.counts.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 2 {
                return Err(PersistenceError::Store("connection reset".into()));
            }
            Ok(*self.rows.lock().unwrap())
        }

        async fn last_watermark(
            &self,
            _file_tag: &str,
        ) -> Result<Option<Watermark>, PersistenceError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_committed_batch_is_not_reinserted_when_count_fails() {
        let store = Arc::new(CountFailsAfterInsert {
            rows: Mutex::new(0),
            counts: AtomicU32::new(0),
            inserts: AtomicU32::new(0),
        });
        let persister = Persister::new(store.clone(), RetryPolicy::default());

        let outcome = persister.insert_rows(&rows(5), "a.csv").await.unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.inserted, 5);
        assert_eq!(outcome.stored, 5);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(*store.rows.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_store() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let persister = Persister::new(store.clone(), RetryPolicy::default());

        let outcome = persister.insert_rows(&[], "a.csv").await.unwrap();
        assert_eq!(outcome.attempts, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
    }

    #[test]
    fn test_insert_columns() {
        let columns = insert_columns();
        assert!(columns.starts_with(r#""Dia", "Hora", "Nome", "Form1", "Form2", "Prod_1""#));
        assert!(columns.ends_with(r#""Prod_40", "processedFile""#));
        assert_eq!(columns.split(", ").count(), 5 + MAX_SLOTS + 1);
    }
}
