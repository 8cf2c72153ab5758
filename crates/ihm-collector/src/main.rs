//! IHM Collector - polls the controller and loads reports into PostgreSQL

use anyhow::{Context, Result};
use clap::Parser;
use ihm_collector::config::CollectorConfig;
use ihm_collector::ingest::hooks::{backup_hook, cleanup_hook, process_log_hook};
use ihm_collector::ingest::{
    BackupStore, ExclusionFilter, FileSource, FsArtifactStore, FtpTransport, Persister,
    PgRowStore, PollingOrchestrator,
};
use ihm_common::logging::{init_logging, LogConfig, LogLevel};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ihm-collector")]
#[command(author, version, about = "Collects IHM production reports over FTP")]
struct Cli {
    /// Run a single collection cycle and exit
    #[arg(long)]
    once: bool,

    /// Skip local backups of ingested files
    #[arg(long)]
    no_backup: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("ihm-collector")
        .filter_directives("sqlx=warn,suppaftp=info")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let config = CollectorConfig::load()?;
    info!(
        host = %config.controller.host,
        port = config.controller.port,
        remote_dir = %config.controller.remote_dir,
        "Starting IHM collector"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");

    let store = PgRowStore::new(pool);
    store.migrate().await.context("Failed to run migrations")?;

    let filter = ExclusionFilter::new(config.controller.exclude_patterns.as_deref());
    let source = FileSource::new(Arc::new(FtpTransport), filter);
    let persister = Persister::new(Arc::new(store), config.retry_policy());
    let artifacts = Arc::new(FsArtifactStore::new(&config.polling.work_dir));

    let mut collector = PollingOrchestrator::new(
        source,
        config.credentials(),
        persister,
        artifacts,
        config.orchestrator_settings(),
    );

    let backups_enabled = config.backup.enabled && !cli.no_backup;
    if backups_enabled {
        collector = collector.with_hook(backup_hook(BackupStore::new(&config.backup.dir)));
    }
    collector = collector.with_hook(process_log_hook(config.process_log_path()));
    if backups_enabled {
        // Only delete the download once a backup of it exists
        collector = collector.with_hook(cleanup_hook(BackupStore::new(&config.backup.dir)));
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    if cli.once {
        let report = collector.run_cycle(&cancel).await?;
        info!(
            listed = report.listed,
            done = report.done,
            pending = report.pending,
            failed = report.failed,
            rows = report.rows_inserted,
            "Single cycle complete"
        );
    } else {
        collector.start(cancel).await?;
    }

    info!("Collector shut down gracefully");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current file");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current file");
        },
    }
}
