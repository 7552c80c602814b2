//! Prometheus endpoint for the tunnel counters.
//!
//! Serves the [`Stats`] record at `/metrics` in the text exposition format.
//! Values are read at request time; nothing is kept between scrapes.

use crate::stats::{HistogramSnapshot, SERVICE_TIME_BUCKETS_US, Snapshot, Stats};
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Counter name, help text and value accessor.
type CounterDef = (&'static str, &'static str, fn(&Snapshot) -> u64);

const COUNTERS: [CounterDef; 17] = [
    ("blocks_read", "The total number of blocks read", |s| s.rd_blk),
    (
        "blocks_read_error",
        "The total number of corrupted or malformed blocks read",
        |s| s.rd_blk_err,
    ),
    (
        "blocks_read_missed",
        "The total number of blocks missed between reads",
        |s| s.rd_blk_miss,
    ),
    ("blocks_read_stale", "The total number of stale blocks read", |s| s.rd_blk_stale),
    ("blocks_read_data", "The total number of data blocks read", |s| s.rd_blk_data),
    (
        "blocks_read_keepalive",
        "The total number of keepalive blocks read",
        |s| s.rd_blk_keep,
    ),
    ("read_errors", "The total number of read errors", |s| s.rd_err),
    ("blocks_written", "The total number of blocks written", |s| s.wr_blk),
    (
        "blocks_written_data",
        "The total number of data blocks written",
        |s| s.wr_blk_data,
    ),
    (
        "blocks_written_keepalive",
        "The total number of keepalive blocks written",
        |s| s.wr_blk_keep,
    ),
    ("write_errors", "The total number of write errors", |s| s.wr_err),
    ("packets_rx", "The total number of received packets", |s| s.rx_pkt),
    ("bytes_rx", "The total number of received bytes", |s| s.rx_bytes),
    ("rx_errors", "The total number of receive errors", |s| s.rx_err),
    ("packets_tx", "The total number of transmitted packets", |s| s.tx_pkt),
    ("bytes_tx", "The total number of sent bytes", |s| s.tx_bytes),
    ("tx_errors", "The total number of transmit errors", |s| s.tx_err),
];

fn header_lines(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind));
}

fn micros_as_secs(us: u64) -> f64 {
    us as f64 / 1_000_000.0
}

fn histogram(out: &mut String, name: &str, help: &str, hist: &HistogramSnapshot) {
    header_lines(out, name, help, "histogram");
    for (bound, count) in SERVICE_TIME_BUCKETS_US.iter().zip(hist.cumulative) {
        out.push_str(&format!(
            "{}_bucket{{le=\"{}\"}} {}\n",
            name,
            micros_as_secs(*bound),
            count
        ));
    }
    out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, hist.count));
    out.push_str(&format!("{}_sum {}\n", name, micros_as_secs(hist.sum_us)));
    out.push_str(&format!("{}_count {}\n", name, hist.count));
}

/// Render every counter, gauge and histogram in `stats`.
pub fn render(stats: &Stats) -> String {
    let snapshot = stats.snapshot();
    let mut out = String::new();

    for (name, help, value) in COUNTERS {
        header_lines(&mut out, name, help, "counter");
        out.push_str(&format!("{} {}\n", name, value(&snapshot)));
    }

    header_lines(&mut out, "peer_rx_state", "Current peer rx state", "gauge");
    out.push_str(&format!("peer_rx_state {}\n", stats.rx_state().code()));
    header_lines(&mut out, "peer_tx_state", "Current peer tx state", "gauge");
    out.push_str(&format!("peer_tx_state {}\n", stats.tx_state().code()));

    histogram(
        &mut out,
        "read_service_time",
        "Read service time",
        &stats.rd_svc_time.snapshot(),
    );
    histogram(
        &mut out,
        "write_service_time",
        "Write service time",
        &stats.wr_svc_time.snapshot(),
    );
    out
}

async fn handler(State(stats): State<Arc<Stats>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], render(&stats))
}

pub fn router(stats: Arc<Stats>) -> Router {
    Router::new()
        .route("/metrics", get(handler))
        .with_state(stats)
}

/// Serve `/metrics` on an already bound listener until the task is aborted.
pub async fn serve_on(listener: TcpListener, stats: Arc<Stats>) -> Result<()> {
    axum::serve(listener, router(stats))
        .await
        .context("metrics server failed")
}

/// Bind `addr` and serve `/metrics` on it.
pub async fn serve(addr: SocketAddr, stats: Arc<Stats>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind {}", addr))?;
    info!("prometheus: serving at http://{}/metrics", addr);
    serve_on(listener, stats).await
}
