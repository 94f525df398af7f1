//! Hivemind sync daemon.
//!
//! This is the main entry point for the sync-state orchestration
//! service. It bootstraps the store schema on first run, drives the
//! initial-sync finalization sequence, and then periodically finalizes
//! whatever block range the ingestion side has written since the last
//! pass.
//!
//! # Usage
//!
//! ```bash
//! # Run against a local store
//! hivemind-sync --database-url postgres://localhost/hive
//!
//! # Tune the massive-sync threshold and finalization cadence
//! hivemind-sync \
//!     --database-url postgres://localhost/hive \
//!     --massive-sync-threshold 403200 \
//!     --finalize-interval-secs 30
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) for graceful shutdown:
//! 1. Finishes the in-flight finalization pass, if any
//! 2. Logs the final head-block status
//! 3. Exits cleanly

use anyhow::{Context, Result};
use clap::Parser;
use hivemind_core::metrics::{init_metrics, start_metrics_server};
use hivemind_sync::{Db, SyncConfig, SyncEngine, SYNCED_BLOCK_LIMIT};
use tracing_subscriber::EnvFilter;

/// Hivemind sync daemon.
#[derive(Parser, Debug)]
#[command(name = "hivemind-sync")]
#[command(about = "Hivemind sync-state orchestration daemon")]
#[command(version)]
struct Args {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum pooled connections (also bounds the maintenance worker pool)
    #[arg(long, default_value = "10")]
    max_connections: u32,

    /// Block-window size at which a sync is treated as massive
    #[arg(long, default_value_t = SYNCED_BLOCK_LIMIT)]
    massive_sync_threshold: i64,

    /// Working-memory budget for heavyweight statements
    #[arg(long, default_value = "2GB")]
    work_mem: String,

    /// Seconds between live-sync finalization passes
    #[arg(long, default_value = "60")]
    finalize_interval_secs: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("hivemind_sync=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Hivemind sync daemon starting...");

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        tracing::info!("Metrics server listening on port {}", args.metrics_port);
    }

    tracing::info!("Configuration:");
    tracing::info!("  Pool size: {}", args.max_connections);
    tracing::info!("  Massive-sync threshold: {} blocks", args.massive_sync_threshold);
    tracing::info!("  work_mem: {}", args.work_mem);
    tracing::info!("  Finalize interval: {}s", args.finalize_interval_secs);

    let db = Db::connect(&args.database_url, args.max_connections)
        .await
        .context("Failed to connect to the store")?;

    let cfg = SyncConfig {
        massive_sync_threshold: args.massive_sync_threshold,
        work_mem: args.work_mem.clone(),
    };
    let mut engine = SyncEngine::new(db.clone(), cfg);
    engine.initialize().await.context("Startup checks failed")?;

    // Initial sync: tear down indexes/FKs if the pending window is
    // massive, then finalize up to the current head.
    let last_block = watermark(&db).await?;
    let head_block = head(&db).await?;
    engine.before_initial_sync(last_block, head_block).await?;
    engine
        .finish_initial_sync(head_block)
        .await
        .context("Initial sync finalization failed")?;

    // Live sync: finalize newly ingested ranges on a fixed cadence
    // until shutdown is requested.
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(args.finalize_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping gracefully...");
                break;
            }
            _ = interval.tick() => {
                let head_block = head(&db).await?;
                if head_block > watermark(&db).await? {
                    engine.finalize_batch(head_block).await?;
                }
                match engine.status().await {
                    Ok(status) => tracing::info!(
                        "Head block {} ({}), {}s behind",
                        status.db_head_block,
                        status.db_head_time,
                        status.db_head_age_secs
                    ),
                    Err(e) => tracing::warn!("Status query failed: {}", e),
                }
            }
        }
    }

    // Shutdown sequence
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    if let Ok(status) = engine.status().await {
        tracing::info!("Head block:  {}", status.db_head_block);
        tracing::info!("Head time:   {}", status.db_head_time);
        tracing::info!("Head age:    {}s", status.db_head_age_secs);
    }

    Ok(())
}

/// The finalized-block watermark.
async fn watermark(db: &Db) -> Result<i64> {
    let block: i64 = sqlx::query_scalar("SELECT block_num::bigint FROM hive_state LIMIT 1")
        .fetch_one(db.pool())
        .await
        .context("Failed to read the sync watermark")?;
    Ok(block)
}

/// The highest ingested block, or 0 for an empty store.
async fn head(db: &Db) -> Result<i64> {
    let block: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(num), 0)::bigint FROM hive_blocks")
        .fetch_one(db.pool())
        .await
        .context("Failed to read the head block")?;
    Ok(block)
}
