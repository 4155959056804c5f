//! Telemetry for the reconciliation pipeline.
//!
//! Every counter the backend emits is defined and incremented through this
//! module, so metric names and label keys live in exactly one place. The
//! Prometheus exporter is optional: it only starts when METRICS_PORT is set.

use axum::{Router, routing::get};
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use tokio::net::TcpListener;

/// Label value for cluster-kind resources.
pub const KIND_CLUSTER: &str = "cluster";
/// Label value for node-pool-kind resources.
pub const KIND_NODEPOOL: &str = "nodepool";

// Periodic scheduler ---------------------------------------------------------

/// One reconcile event published by the periodic loop.
pub fn record_reconcile_published(kind: &'static str) {
    counter!("lattice_reconcile_published_total", "kind" => kind).increment(1);
}

/// A failed publish or schedule advance in the periodic loop.
pub fn record_reconcile_error(kind: &'static str) {
    counter!("lattice_reconcile_errors_total", "kind" => kind).increment(1);
}

/// An out-of-band reconcile requested through the API.
pub fn record_manual_trigger(kind: &'static str) {
    counter!("lattice_reconcile_manual_total", "kind" => kind).increment(1);
}

/// Schedule rows recreated by the repair backstop.
pub fn record_schedules_repaired(count: u64) {
    counter!("lattice_schedules_repaired_total").increment(count);
}

// Reactive pipeline ----------------------------------------------------------

/// One reconcile event published from a change notification.
pub fn record_reactive_published(kind: &'static str) {
    counter!("lattice_reactive_published_total", "kind" => kind).increment(1);
}

pub fn record_reactive_rate_limited() {
    counter!("lattice_reactive_rate_limited_total").increment(1);
}

pub fn record_reactive_error() {
    counter!("lattice_reactive_errors_total").increment(1);
}

// Change notification bus ----------------------------------------------------

pub fn record_notification_received() {
    counter!("lattice_notify_received_total").increment(1);
}

pub fn record_notification_debounced() {
    counter!("lattice_notify_debounced_total").increment(1);
}

/// Dropped because the downstream consumer stalled.
pub fn record_notification_dropped() {
    counter!("lattice_notify_dropped_total").increment(1);
}

pub fn record_notification_malformed() {
    counter!("lattice_notify_malformed_total").increment(1);
}

pub fn record_notification_connection_error() {
    counter!("lattice_notify_connection_errors_total").increment(1);
}

// Exporter -------------------------------------------------------------------

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();
static EXPORTER_STARTED: OnceLock<()> = OnceLock::new();

fn recorder() -> &'static PrometheusHandle {
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install Prometheus recorder")
    })
}

/// Start the exporter listener when METRICS_PORT is set. Safe to call more
/// than once; only the first call binds the port.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = metrics_port() else {
        return;
    };
    if EXPORTER_STARTED.set(()).is_ok() {
        let _ = recorder();
        tokio::spawn(run_metrics_server(port));
    }
}

async fn run_metrics_server(port: u16) {
    let handle = recorder().clone();
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(move || async move { handle.render() }));
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("{}", format!("🛑 metrics exporter cannot bind {addr}: {e}").red());
            return;
        }
    };
    println!("{}", format!("📈 metrics exporter on :{port}").green());
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("{}", format!("🛑 metrics exporter exited: {e}").red());
    }
}

fn metrics_port() -> Option<u16> {
    std::env::var("METRICS_PORT").ok()?.parse().ok()
}
