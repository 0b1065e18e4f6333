//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swap registrations and lifecycle transitions
//! - Signature collection
//! - Broadcast outcomes and latency
//! - Health checks

use crate::error::RelayerResult;
use crate::state::SwapStats;
use crate::swap::SwapStatus;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Swap metrics
    pub static ref SWAPS_REGISTERED: CounterVec = register_counter_vec!(
        "swap_relayer_swaps_registered_total",
        "Total burn events registered as swaps",
        &[]
    ).unwrap();

    pub static ref DUPLICATE_BURNS: CounterVec = register_counter_vec!(
        "swap_relayer_duplicate_burns_total",
        "Burn events ignored because the swap already existed",
        &[]
    ).unwrap();

    pub static ref SWAPS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "swap_relayer_swaps",
        "Current number of swaps per status",
        &["status"]
    ).unwrap();

    // Signature metrics
    pub static ref SIGNATURES_RECORDED: CounterVec = register_counter_vec!(
        "swap_relayer_signatures_recorded_total",
        "Signatures accepted, by whether they were new",
        &["outcome"]
    ).unwrap();

    pub static ref SIGNING_FAILURES: CounterVec = register_counter_vec!(
        "swap_relayer_signing_failures_total",
        "Local co-signing attempts that failed",
        &[]
    ).unwrap();

    // Finalization metrics
    pub static ref BROADCASTS: CounterVec = register_counter_vec!(
        "swap_relayer_broadcasts_total",
        "Multisig broadcasts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref FINALIZE_RACES_LOST: CounterVec = register_counter_vec!(
        "swap_relayer_finalize_races_lost_total",
        "Finalize attempts that found another worker owning the swap",
        &[]
    ).unwrap();

    pub static ref BROADCAST_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_relayer_broadcast_latency_seconds",
        "Time spent combining and broadcasting a multisig transaction",
        &[],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref CONFIRMATIONS: CounterVec = register_counter_vec!(
        "swap_relayer_confirmations_total",
        "Swaps confirmed on the destination chain",
        &[]
    ).unwrap();

    pub static ref EXPIRATIONS: CounterVec = register_counter_vec!(
        "swap_relayer_expirations_total",
        "Swaps failed by the timeout policy",
        &["from_status"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "swap_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "swap_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::RelayerError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::RelayerError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_swap_registered() {
    SWAPS_REGISTERED.with_label_values(&[]).inc();
}

pub fn record_duplicate_burn() {
    DUPLICATE_BURNS.with_label_values(&[]).inc();
}

pub fn record_signature(inserted: bool) {
    SIGNATURES_RECORDED
        .with_label_values(&[if inserted { "new" } else { "duplicate" }])
        .inc();
}

pub fn record_signing_failure() {
    SIGNING_FAILURES.with_label_values(&[]).inc();
}

pub fn record_broadcast(success: bool, latency_secs: f64) {
    BROADCASTS
        .with_label_values(&[if success { "success" } else { "failure" }])
        .inc();
    BROADCAST_LATENCY.with_label_values(&[]).observe(latency_secs);
}

pub fn record_finalize_race_lost() {
    FINALIZE_RACES_LOST.with_label_values(&[]).inc();
}

pub fn record_confirmed() {
    CONFIRMATIONS.with_label_values(&[]).inc();
}

pub fn record_expired(from: SwapStatus) {
    EXPIRATIONS.with_label_values(&[from.as_str()]).inc();
}

pub fn record_swap_stats(stats: &SwapStats) {
    for status in SwapStatus::ALL {
        SWAPS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(stats.get(status) as f64);
    }
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
