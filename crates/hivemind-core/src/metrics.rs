//! Prometheus metrics helpers for the hivemind sync engine.
//!
//! Centralized metrics initialization and the common metric
//! definitions used across components.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (e.g., `follow_`, `vote_`, `index_`)
//! - Suffix: unit or type (e.g., `_total`, `_seconds`)
//! - Labels: used sparingly to avoid cardinality explosion

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
/// Returns a handle for [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be
/// installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if the recorder is
/// already installed, instead of panicking. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. Spawns a
/// background task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for common metrics.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Operation indexing
    // =========================================================================

    describe_counter!("follow_ops_total", "Follow operations received");
    describe_counter!(
        "follow_ops_dropped_total",
        "Follow operations dropped by validation"
    );
    describe_counter!("follow_ops_buffered_total", "Follow edges buffered during bulk sync");
    describe_counter!("follow_accounts_flushed_total", "Accounts with follow counts updated");
    describe_counter!("vote_ops_total", "Vote operations written");

    // =========================================================================
    // Index lifecycle
    // =========================================================================

    describe_counter!("index_created_total", "Secondary indexes created");
    describe_counter!("index_dropped_total", "Secondary indexes dropped");

    // =========================================================================
    // Finalization tasks
    // =========================================================================

    describe_counter!("finalize_tasks_total", "Finalization tasks completed");
    describe_counter!("finalize_task_failures_total", "Finalization tasks failed");
    describe_gauge!(
        "sync_initial_running",
        "Whether initial sync is in progress (1=yes, 0=no)"
    );
    describe_gauge!("sync_head_block", "Last durably recorded block number");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();
        // at most one install can succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
