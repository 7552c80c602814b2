//! Command-line and environment configuration.

use clap::Parser;
use disktun_core::ConfigError;
use disktun_core::mailbox::check_blocks;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Shortest accepted disk poll interval.
pub const MIN_TICK: Duration = Duration::from_micros(1);

/// Largest accepted queue capacity.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 16;

#[derive(Parser, Debug, Clone)]
#[command(name = "disktun")]
#[command(about = "Tunnel IP packets between two hosts through a shared block device")]
pub struct Args {
    /// Shared block device (or file, with --buffered)
    #[arg(short, long, env = "DISK")]
    pub disk: PathBuf,

    /// TUN interface name (kernel picks one if omitted)
    #[arg(short, long, env = "TUN")]
    pub tun: Option<String>,

    /// Local tunnel address, e.g. 10.0.0.1/32
    #[arg(short, long, env = "ADDR")]
    pub addr: String,

    /// Remote tunnel address, e.g. 10.0.0.2/32
    #[arg(short, long, env = "PEER")]
    pub peer: String,

    /// Block index the peer writes to
    #[arg(short, long, env = "RBLK")]
    pub rblk: u64,

    /// Block index we write to
    #[arg(short, long, env = "WBLK")]
    pub wblk: u64,

    /// Outbound queue capacity (packets waiting for the disk)
    #[arg(long, default_value_t = 16, env = "TXQLEN")]
    pub txqlen: usize,

    /// Inbound queue capacity (packets waiting for the TUN device)
    #[arg(long, default_value_t = 16, env = "RXQLEN")]
    pub rxqlen: usize,

    /// Disk poll frequency in Hz
    #[arg(short = 'f', long, default_value_t = 10, env = "HZ")]
    pub hz: u32,

    /// Consecutive stale reads before the peer is considered down
    #[arg(long, default_value_t = 5, env = "MAXSTALE")]
    pub maxstale: u32,

    /// Seconds between statistics reports (0 disables)
    #[arg(short = 'i', long, default_value_t = 60, env = "STATS")]
    pub stats: u64,

    /// Serve Prometheus metrics on this address, e.g. 127.0.0.1:9100
    #[arg(long, env = "PROM")]
    pub prom: Option<SocketAddr>,

    /// Open the disk without O_DIRECT (for regular files)
    #[arg(long, env = "BUFFERED")]
    pub buffered: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Validated pipeline parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub read_block: u64,
    pub write_block: u64,
    /// Interval between disk polls
    pub tick: Duration,
    /// Staleness threshold shared by both liveness trackers
    pub threshold: u32,
    pub tx_capacity: usize,
    pub rx_capacity: usize,
    /// None when reporting is disabled
    pub stats_interval: Option<Duration>,
}

impl PipelineConfig {
    /// Check the values the pipeline relies on to start without panicking.
    pub fn check(&self) -> Result<(), ConfigError> {
        check_blocks(self.read_block, self.write_block)?;
        if self.tick < MIN_TICK {
            return Err(ConfigError::TickTooShort(self.tick));
        }
        if self.threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        check_capacity("txqlen", self.tx_capacity)?;
        check_capacity("rxqlen", self.rx_capacity)
    }
}

fn check_capacity(name: &'static str, capacity: usize) -> Result<(), ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::ZeroCapacity(name));
    }
    if capacity > MAX_QUEUE_CAPACITY {
        return Err(ConfigError::CapacityTooLarge(name, MAX_QUEUE_CAPACITY));
    }
    Ok(())
}

impl Args {
    /// Check every startup constraint before anything is opened.
    pub fn validate(&self) -> Result<PipelineConfig, ConfigError> {
        if self.hz == 0 {
            return Err(ConfigError::ZeroFrequency);
        }

        let config = PipelineConfig {
            read_block: self.rblk,
            write_block: self.wblk,
            tick: Duration::from_secs(1) / self.hz,
            threshold: self.maxstale,
            tx_capacity: self.txqlen,
            rx_capacity: self.rxqlen,
            stats_interval: (self.stats > 0).then(|| Duration::from_secs(self.stats)),
        };
        config.check()?;
        Ok(config)
    }
}
