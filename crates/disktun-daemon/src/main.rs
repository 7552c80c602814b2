//! disktun: Tunnel IP packets between two hosts through a shared block device.
//!
//! Each host reads the block the other one writes. Packets from the local
//! TUN interface go out through our block; packets in the peer's block come
//! back in through the TUN interface.

use anyhow::{Context, Result};
use clap::Parser;
use disktun_core::PAYLOAD_MAX;
use disktun_core::mailbox::Mailbox;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use disktun_daemon::metrics;
use disktun_daemon::stats::{self, Stats};
use disktun_daemon::{Args, DirectDisk, Pipeline, TunDevice};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,disktun_daemon=debug"
    } else {
        "info,disktun_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.validate().context("invalid configuration")?;

    let tun = TunDevice::create(args.tun.as_deref()).context("error setting up tun device")?;
    tun.configure(&args.addr, &args.peer, PAYLOAD_MAX)
        .await
        .context("error configuring tun device")?;

    let disk = if args.buffered {
        DirectDisk::open_buffered(&args.disk)
    } else {
        DirectDisk::open(&args.disk)
    }
    .with_context(|| format!("error opening disk {:?}", args.disk))?;
    info!(
        "Disk {:?}: reading block {}, writing block {}",
        disk.path(),
        config.read_block,
        config.write_block
    );
    let mailbox = Mailbox::new(disk, config.read_block, config.write_block)?;

    let name = tun.name().to_string();
    let stats = Stats::new();
    let pipeline = Pipeline::spawn(mailbox, tun, &config, rand::random(), stats.clone())?;

    let reporter = config
        .stats_interval
        .map(|every| tokio::spawn(stats::run_reporter(stats.clone(), every)));

    let exporter = args.prom.map(|addr| {
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, stats).await {
                error!("metrics endpoint on {} failed: {:#}", addr, e);
            }
        })
    });

    info!("Started up, running on {}", name);

    shutdown_signal().await?;

    info!("Shutting down");
    for task in reporter.into_iter().chain(exporter) {
        task.abort();
    }
    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
        _ = terminate.recv() => {},
    }

    info!("Shutdown signal received");
    Ok(())
}
