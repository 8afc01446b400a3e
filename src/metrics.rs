//! Prometheus counters for the write and statistics paths.
//!
//! The `metrics` macros are no-ops until a recorder is installed, so library
//! users and tests pay nothing unless `init_metrics` runs.

use crate::config::MetricsConfig;
use crate::reconcile::ReconcileStats;
use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

pub const RECONCILE_RUNS: &str = "rx_reconcile_runs_total";
pub const RECONCILE_CREATED: &str = "rx_reconcile_created_total";
pub const RECONCILE_UPDATED: &str = "rx_reconcile_updated_total";
pub const RECONCILE_DELETED: &str = "rx_reconcile_deleted_total";
pub const RECOMPUTE_FAILURES: &str = "rx_total_recompute_failures_total";
pub const STATS_QUERIES: &str = "rx_stats_queries_total";

static INIT: Once = Once::new();

/// Install the Prometheus exporter when enabled. Idempotent.
pub fn init_metrics(config: &MetricsConfig) {
    if !config.enabled {
        return;
    }
    INIT.call_once(|| {
        let addr: SocketAddr = match config.listen.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("Invalid metrics addr '{}', using default 127.0.0.1:9898", config.listen);
                SocketAddr::from(([127, 0, 0, 1], 9898))
            }
        };
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
        match builder.install() {
            Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
            Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
        }
    });
}

pub fn record_reconcile(stats: &ReconcileStats) {
    metrics::counter!(RECONCILE_RUNS).increment(1);
    metrics::counter!(RECONCILE_CREATED).increment(stats.created as u64);
    metrics::counter!(RECONCILE_UPDATED).increment(stats.updated as u64);
    metrics::counter!(RECONCILE_DELETED).increment(stats.deleted as u64);
}

pub fn record_recompute_failure() {
    metrics::counter!(RECOMPUTE_FAILURES).increment(1);
}

pub fn record_stats_query(kind: &'static str) {
    metrics::counter!(STATS_QUERIES, "kind" => kind).increment(1);
}
