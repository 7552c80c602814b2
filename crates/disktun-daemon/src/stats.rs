//! Tunnel counters and the periodic stats report.
//!
//! Each counter has a single writer (the loop that owns the matching
//! resource), so relaxed atomics are enough. The reporter takes snapshots and
//! logs the difference between consecutive ones.

use disktun_core::peer::{RxState, TxState};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

/// Upper bounds of the service time buckets, in microseconds.
pub const SERVICE_TIME_BUCKETS_US: [u64; 7] = [500, 1_000, 5_000, 10_000, 15_000, 20_000, 30_000];

/// Service time distribution with fixed bucket bounds.
///
/// Bucket counts are not cumulative here; the exporter sums them.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; SERVICE_TIME_BUCKETS_US.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

/// Point-in-time copy of a [`Histogram`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramSnapshot {
    /// Observations at or below each bound, cumulative
    pub cumulative: [u64; SERVICE_TIME_BUCKETS_US.len()],
    pub count: u64,
    pub sum_us: u64,
}

impl Histogram {
    pub fn observe(&self, us: u64) {
        if let Some(i) = SERVICE_TIME_BUCKETS_US.iter().position(|bound| us <= *bound) {
            inc(&self.buckets[i]);
        }
        inc(&self.count);
        add(&self.sum_us, us);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = [0; SERVICE_TIME_BUCKETS_US.len()];
        let mut running = 0;
        for (slot, bucket) in cumulative.iter_mut().zip(&self.buckets) {
            running += bucket.load(Ordering::Relaxed);
            *slot = running;
        }
        HistogramSnapshot {
            cumulative,
            count: self.count.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct Stats {
    /// Blocks read and decoded successfully
    pub rd_blk: AtomicU64,
    /// Blocks that failed to decode
    pub rd_blk_err: AtomicU64,
    /// Sequence ids skipped between two observed blocks
    pub rd_blk_miss: AtomicU64,
    pub rd_blk_stale: AtomicU64,
    pub rd_blk_data: AtomicU64,
    pub rd_blk_keep: AtomicU64,
    /// Device read failures
    pub rd_err: AtomicU64,
    /// Total read service time in microseconds
    pub rd_svc_us: AtomicU64,
    pub wr_blk: AtomicU64,
    pub wr_blk_data: AtomicU64,
    pub wr_blk_keep: AtomicU64,
    pub wr_err: AtomicU64,
    /// Total write service time in microseconds
    pub wr_svc_us: AtomicU64,
    /// Packets read from the endpoint
    pub rx_pkt: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_err: AtomicU64,
    /// Packets written to the endpoint
    pub tx_pkt: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_err: AtomicU64,
    pub rd_svc_time: Histogram,
    pub wr_svc_time: Histogram,
    rx_state: AtomicU8,
    tx_state: AtomicU8,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            rd_blk: AtomicU64::new(0),
            rd_blk_err: AtomicU64::new(0),
            rd_blk_miss: AtomicU64::new(0),
            rd_blk_stale: AtomicU64::new(0),
            rd_blk_data: AtomicU64::new(0),
            rd_blk_keep: AtomicU64::new(0),
            rd_err: AtomicU64::new(0),
            rd_svc_us: AtomicU64::new(0),
            wr_blk: AtomicU64::new(0),
            wr_blk_data: AtomicU64::new(0),
            wr_blk_keep: AtomicU64::new(0),
            wr_err: AtomicU64::new(0),
            wr_svc_us: AtomicU64::new(0),
            rx_pkt: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_err: AtomicU64::new(0),
            tx_pkt: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_err: AtomicU64::new(0),
            rd_svc_time: Histogram::default(),
            wr_svc_time: Histogram::default(),
            rx_state: AtomicU8::new(RxState::Init.code()),
            tx_state: AtomicU8::new(TxState::Up.code()),
        }
    }
}

/// Add `n` to a counter.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Increment a counter.
pub fn inc(counter: &AtomicU64) {
    add(counter, 1);
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Account one device read that took `us` microseconds.
    pub fn record_read_time(&self, us: u64) {
        add(&self.rd_svc_us, us);
        self.rd_svc_time.observe(us);
    }

    /// Account one device write that took `us` microseconds.
    pub fn record_write_time(&self, us: u64) {
        add(&self.wr_svc_us, us);
        self.wr_svc_time.observe(us);
    }

    pub fn set_rx_state(&self, state: RxState) {
        self.rx_state.store(state.code(), Ordering::Relaxed);
    }

    pub fn set_tx_state(&self, state: TxState) {
        self.tx_state.store(state.code(), Ordering::Relaxed);
    }

    pub fn rx_state(&self) -> RxState {
        RxState::from_code(self.rx_state.load(Ordering::Relaxed)).unwrap_or(RxState::Init)
    }

    pub fn tx_state(&self) -> TxState {
        TxState::from_code(self.tx_state.load(Ordering::Relaxed)).unwrap_or(TxState::Up)
    }

    pub fn snapshot(&self) -> Snapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Snapshot {
            rd_blk: get(&self.rd_blk),
            rd_blk_err: get(&self.rd_blk_err),
            rd_blk_miss: get(&self.rd_blk_miss),
            rd_blk_stale: get(&self.rd_blk_stale),
            rd_blk_data: get(&self.rd_blk_data),
            rd_blk_keep: get(&self.rd_blk_keep),
            rd_err: get(&self.rd_err),
            rd_svc_us: get(&self.rd_svc_us),
            wr_blk: get(&self.wr_blk),
            wr_blk_data: get(&self.wr_blk_data),
            wr_blk_keep: get(&self.wr_blk_keep),
            wr_err: get(&self.wr_err),
            wr_svc_us: get(&self.wr_svc_us),
            rx_pkt: get(&self.rx_pkt),
            rx_bytes: get(&self.rx_bytes),
            rx_err: get(&self.rx_err),
            tx_pkt: get(&self.tx_pkt),
            tx_bytes: get(&self.tx_bytes),
            tx_err: get(&self.tx_err),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub rd_blk: u64,
    pub rd_blk_err: u64,
    pub rd_blk_miss: u64,
    pub rd_blk_stale: u64,
    pub rd_blk_data: u64,
    pub rd_blk_keep: u64,
    pub rd_err: u64,
    pub rd_svc_us: u64,
    pub wr_blk: u64,
    pub wr_blk_data: u64,
    pub wr_blk_keep: u64,
    pub wr_err: u64,
    pub wr_svc_us: u64,
    pub rx_pkt: u64,
    pub rx_bytes: u64,
    pub rx_err: u64,
    pub tx_pkt: u64,
    pub tx_bytes: u64,
    pub tx_err: u64,
}

impl Snapshot {
    /// Counter increase since `prev`.
    pub fn since(&self, prev: &Snapshot) -> Snapshot {
        Snapshot {
            rd_blk: self.rd_blk.wrapping_sub(prev.rd_blk),
            rd_blk_err: self.rd_blk_err.wrapping_sub(prev.rd_blk_err),
            rd_blk_miss: self.rd_blk_miss.wrapping_sub(prev.rd_blk_miss),
            rd_blk_stale: self.rd_blk_stale.wrapping_sub(prev.rd_blk_stale),
            rd_blk_data: self.rd_blk_data.wrapping_sub(prev.rd_blk_data),
            rd_blk_keep: self.rd_blk_keep.wrapping_sub(prev.rd_blk_keep),
            rd_err: self.rd_err.wrapping_sub(prev.rd_err),
            rd_svc_us: self.rd_svc_us.wrapping_sub(prev.rd_svc_us),
            wr_blk: self.wr_blk.wrapping_sub(prev.wr_blk),
            wr_blk_data: self.wr_blk_data.wrapping_sub(prev.wr_blk_data),
            wr_blk_keep: self.wr_blk_keep.wrapping_sub(prev.wr_blk_keep),
            wr_err: self.wr_err.wrapping_sub(prev.wr_err),
            wr_svc_us: self.wr_svc_us.wrapping_sub(prev.wr_svc_us),
            rx_pkt: self.rx_pkt.wrapping_sub(prev.rx_pkt),
            rx_bytes: self.rx_bytes.wrapping_sub(prev.rx_bytes),
            rx_err: self.rx_err.wrapping_sub(prev.rx_err),
            tx_pkt: self.tx_pkt.wrapping_sub(prev.tx_pkt),
            tx_bytes: self.tx_bytes.wrapping_sub(prev.tx_bytes),
            tx_err: self.tx_err.wrapping_sub(prev.tx_err),
        }
    }
}

fn rate(count: u64, secs: f64) -> f64 {
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// Average service time in milliseconds per operation.
fn avg_ms(total_us: u64, ops: u64) -> f64 {
    if ops > 0 { total_us as f64 / ops as f64 / 1000.0 } else { 0.0 }
}

/// Render one report line for the counter increase `d` over `elapsed`.
pub fn format_report(rx: RxState, tx: TxState, d: &Snapshot, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    format!(
        "stats: rx:{} tx:{} \
         rdBlk:{} rdBlkErr:{} rdBlkMiss:{} rdBlkStale:{} rdBlkData:{} rdBlkKeep:{} \
         rdErr:{} rdBlk/s:{:.2} rdSvcTimeAvg:{:.2}ms \
         wrBlk:{} wrBlkData:{} wrBlkKeep:{} wrErr:{} wrBlk/s:{:.2} wrSvcTimeAvg:{:.2}ms \
         rxPkt:{} rxBytes:{} rxErr:{} rxPkt/s:{:.2} \
         txPkt:{} txBytes:{} txErr:{} txPkt/s:{:.2}",
        rx,
        tx,
        d.rd_blk,
        d.rd_blk_err,
        d.rd_blk_miss,
        d.rd_blk_stale,
        d.rd_blk_data,
        d.rd_blk_keep,
        d.rd_err,
        rate(d.rd_blk, secs),
        avg_ms(d.rd_svc_us, d.rd_blk + d.rd_blk_err),
        d.wr_blk,
        d.wr_blk_data,
        d.wr_blk_keep,
        d.wr_err,
        rate(d.wr_blk, secs),
        avg_ms(d.wr_svc_us, d.wr_blk),
        d.rx_pkt,
        d.rx_bytes,
        d.rx_err,
        rate(d.rx_pkt, secs),
        d.tx_pkt,
        d.tx_bytes,
        d.tx_err,
        rate(d.tx_pkt, secs),
    )
}

/// Log a report every `every` until the task is aborted.
pub async fn run_reporter(stats: Arc<Stats>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut prev = stats.snapshot();
    let mut prev_time = Instant::now();
    loop {
        let now = ticker.tick().await;
        let current = stats.snapshot();
        let line = format_report(
            stats.rx_state(),
            stats.tx_state(),
            &current.since(&prev),
            now.duration_since(prev_time),
        );
        info!("{}", line);
        prev = current;
        prev_time = now;
    }
}
