//! Prometheus metrics for the Scrivener daemon.
//!
//! One recorder serves the whole process: [`init_metrics`] installs it and
//! registers a description for every series the ingestion paths emit, and
//! [`start_metrics_server`] exposes the scrape endpoint. Components then
//! record through the `metrics` macros with no handle threading:
//!
//! ```rust,ignore
//! metrics::counter!("backfill_pages_total").increment(1);
//! metrics::gauge!("gateway_connected").set(1.0);
//! ```
//!
//! Series names are prefixed by component (`backfill_`, `gateway_`,
//! `ratelimit_`) and suffixed by kind (`_total` for counters). Labels are
//! avoided so cardinality stays flat.

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the process-wide Prometheus recorder and describe every series
/// the daemon emits.
///
/// Call once at startup, before any component records a sample. The
/// returned handle renders the exposition text for
/// [`start_metrics_server`].
///
/// # Panics
///
/// A second installation attempt panics; use [`try_init_metrics`] where a
/// recorder may already be in place.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("metrics recorder already installed");
    register_common_metrics();
    handle
}

/// Fallible variant of [`init_metrics`] for contexts that cannot know
/// whether a recorder exists yet (test binaries, embedders). Returns
/// `None` when installation is refused.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Expose `handle` as a Prometheus scrape target on `0.0.0.0:{port}`.
///
/// The listener is bound up front so a busy port fails loudly at startup;
/// `/metrics` is then served from a background task for the life of the
/// process.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    let render = move || {
        let handle = handle.clone();
        async move { handle.render() }
    };
    let app = Router::new().route("/metrics", get(render));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server failed: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for common metrics used across Scrivener.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Live Ingestion Metrics
    // =========================================================================

    describe_counter!(
        "live_messages_total",
        "Messages received on the gateway stream"
    );
    describe_counter!(
        "live_messages_inserted_total",
        "Gateway messages newly inserted into the store"
    );
    describe_counter!(
        "live_messages_duplicate_total",
        "Gateway messages dropped by the unique index"
    );
    describe_counter!(
        "gateway_sessions_total",
        "Gateway sessions opened (including reconnects)"
    );
    describe_counter!(
        "gateway_reconnects_total",
        "Gateway sessions torn down and rescheduled"
    );
    describe_gauge!(
        "gateway_connected",
        "Whether a gateway session is currently open (1=yes, 0=no)"
    );

    // =========================================================================
    // Backfill Metrics
    // =========================================================================

    describe_counter!("backfill_pages_total", "Message pages fetched by backfill");
    describe_counter!(
        "backfill_messages_inserted_total",
        "Backfill messages newly inserted into the store"
    );
    describe_counter!(
        "backfill_messages_duplicate_total",
        "Backfill messages dropped by the unique index"
    );
    describe_counter!(
        "backfill_channels_done_total",
        "Channels whose backfill reached the empty-page terminal state"
    );
    describe_counter!(
        "backfill_errors_total",
        "Backfill page fetches that failed (non-2xx, malformed body)"
    );
    describe_counter!(
        "backfill_stale_claims_recovered_total",
        "Channel claims released by the stale-claim sweep"
    );

    // =========================================================================
    // Rate-Limit Coordinator Metrics
    // =========================================================================

    describe_counter!("ratelimit_429_total", "HTTP 429 responses observed");
    describe_counter!(
        "ratelimit_global_cooldowns_total",
        "Global cooldowns imposed by the upstream"
    );
    describe_gauge!("ratelimit_buckets", "Rate-limit buckets currently tracked");

    // =========================================================================
    // User Projection Metrics
    // =========================================================================

    describe_counter!(
        "users_projected_total",
        "User identity upserts attempted alongside message inserts"
    );

    // =========================================================================
    // Process Metrics
    // =========================================================================

    describe_gauge!(
        "ingestion_running",
        "Whether the ingestion daemon is running (1=yes, 0=no)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Ensure metrics are initialized exactly once for all tests
    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        // First call may or may not succeed (depends on test order)
        let handle1 = try_init_metrics();

        // Second call should definitely return None (already installed)
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        // This should be idempotent and not panic
        register_common_metrics();
        register_common_metrics();
    }
}
