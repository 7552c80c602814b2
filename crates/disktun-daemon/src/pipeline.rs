//! The four loops moving packets between the endpoint and the mailbox.
//!
//! ```text
//! endpoint.recv -> EndpointReader -> outbound queue -> DiskWriter -> our slot
//! peer slot -> DiskReader -> inbound queue -> EndpointWriter -> endpoint.send
//! ```
//!
//! The disk loops are clocked by a shared tick; the endpoint loops run as
//! fast as packets arrive. Each loop owns the state it mutates: the reader
//! owns the Rx tracker, the writer owns the Tx tracker, and the two queues
//! are the only thing they share. Every step is exposed as `poll_once` so
//! tests can drive the loops one tick at a time.

use crate::config::PipelineConfig;
use crate::stats::{Stats, add, inc};
use disktun_core::ConfigError;
use disktun_core::block::{Block, BlockKind, DecodeError, PAYLOAD_MAX};
use disktun_core::endpoint::PacketEndpoint;
use disktun_core::mailbox::{BlockDevice, Mailbox, MailboxError};
use disktun_core::peer::{Peer, RxEvent, RxState, RxTracker, TxEvent, TxState, TxTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Result of one disk read tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Undecodable slot before the peer has ever been seen
    Ignored(DecodeError),
    /// Undecodable slot after the peer was seen
    Invalid(DecodeError),
    /// Device read failed
    Error,
    /// First valid block; its id becomes the baseline and it is not forwarded
    First { id: u32 },
    /// Slot unchanged since the last read
    Stale { id: u32 },
    /// Slot changed; Data payloads were queued for the endpoint
    New { id: u32, kind: BlockKind, missed: u32 },
    /// Inbound queue consumer is gone
    Closed,
}

/// Result of one disk write tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A block was written with this sequence id
    Wrote { id: u32, kind: BlockKind },
    /// Nothing to send and the link is not idle yet
    Skipped,
    /// Device write failed; the sequence id was not consumed
    Error,
    /// Outbound queue producer is gone
    Closed,
}

/// Result of one endpoint step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// One packet of this many bytes was moved
    Moved(usize),
    /// Empty read from the endpoint, nothing queued
    Empty,
    Error,
    Closed,
}

/// Build both liveness trackers with observers that publish state to `stats`.
pub fn trackers(
    threshold: u32,
    stats: &Arc<Stats>,
) -> Result<(RxTracker, TxTracker), ConfigError> {
    let rx_stats = Arc::clone(stats);
    let tx_stats = Arc::clone(stats);
    let peer = Peer::with_observers(
        threshold,
        move |_, to, _| rx_stats.set_rx_state(to),
        move |_, to, _| tx_stats.set_tx_state(to),
    )?;
    Ok(peer.split())
}

fn ticker(tick: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros().try_into().unwrap_or(u64::MAX)
}

// ==================== Disk reader ====================

/// Polls the peer's slot and forwards new Data payloads.
pub struct DiskReader<D> {
    mailbox: Arc<Mailbox<D>>,
    rx: RxTracker,
    prev_id: Option<u32>,
    inbound: mpsc::Sender<Vec<u8>>,
    stats: Arc<Stats>,
}

impl<D: BlockDevice> DiskReader<D> {
    pub fn new(
        mailbox: Arc<Mailbox<D>>,
        rx: RxTracker,
        inbound: mpsc::Sender<Vec<u8>>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            mailbox,
            rx,
            prev_id: None,
            inbound,
            stats,
        }
    }

    pub fn rx_state(&self) -> RxState {
        self.rx.state()
    }

    /// Read the slot once. Waits for inbound queue space when a Data block
    /// arrives and the queue is full.
    pub async fn poll_once(&mut self) -> ReadOutcome {
        let start = Instant::now();
        let result = self.mailbox.read_block().await;
        self.stats.record_read_time(elapsed_us(start));

        let block = match result {
            Ok(block) => block,
            Err(MailboxError::Decode(err)) => {
                inc(&self.stats.rd_blk_err);
                // The peer may not have written its slot yet, so garbage is expected
                if self.rx.state() == RxState::Init {
                    debug!("ignoring invalid block before first contact: {}", err);
                    return ReadOutcome::Ignored(err);
                }
                warn!("invalid block in read slot: {}", err);
                self.rx.event(RxEvent::ReadError);
                return ReadOutcome::Invalid(err);
            }
            Err(MailboxError::Io(err)) => {
                inc(&self.stats.rd_err);
                warn!("error reading from disk: {}", err);
                self.rx.event(RxEvent::ReadError);
                return ReadOutcome::Error;
            }
        };
        inc(&self.stats.rd_blk);

        // The first block may be left over from an earlier run
        let Some(prev) = self.prev_id.replace(block.id) else {
            debug!("first block seen in read slot, id {}", block.id);
            return ReadOutcome::First { id: block.id };
        };

        if block.id == prev {
            inc(&self.stats.rd_blk_stale);
            self.rx.event(RxEvent::ReadStale);
            return ReadOutcome::Stale { id: block.id };
        }
        self.rx.event(RxEvent::ReadNew);

        let gap = block.id.wrapping_sub(prev) as i32;
        let missed = if gap > 1 { (gap - 1) as u32 } else { 0 };
        add(&self.stats.rd_blk_miss, missed as u64);

        let Block { id, kind, payload } = block;
        match kind {
            BlockKind::Data => {
                inc(&self.stats.rd_blk_data);
                if self.inbound.send(payload).await.is_err() {
                    return ReadOutcome::Closed;
                }
            }
            BlockKind::Keepalive => inc(&self.stats.rd_blk_keep),
        }
        ReadOutcome::New { id, kind, missed }
    }

    /// Poll on every tick until the inbound queue is closed.
    pub async fn run(mut self, tick: Duration) {
        let mut ticker = ticker(tick);
        loop {
            ticker.tick().await;
            if self.poll_once().await == ReadOutcome::Closed {
                debug!("inbound queue closed, disk reader stopping");
                return;
            }
        }
    }
}

// ==================== Disk writer ====================

/// Writes queued payloads to our slot, or keepalives when idle.
pub struct DiskWriter<D> {
    mailbox: Arc<Mailbox<D>>,
    tx: TxTracker,
    seq: u32,
    outbound: mpsc::Receiver<Vec<u8>>,
    stats: Arc<Stats>,
}

impl<D: BlockDevice> DiskWriter<D> {
    /// `initial_seq` is the id of the first block written.
    pub fn new(
        mailbox: Arc<Mailbox<D>>,
        tx: TxTracker,
        initial_seq: u32,
        outbound: mpsc::Receiver<Vec<u8>>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            mailbox,
            tx,
            seq: initial_seq,
            outbound,
            stats,
        }
    }

    pub fn tx_state(&self) -> TxState {
        self.tx.state()
    }

    /// Id the next written block will carry.
    pub fn next_seq(&self) -> u32 {
        self.seq
    }

    /// Write at most one block. Never waits on the outbound queue.
    pub async fn poll_once(&mut self) -> WriteOutcome {
        let block = match self.outbound.try_recv() {
            Ok(payload) => Block::data(self.seq, payload),
            Err(TryRecvError::Empty) => {
                if self.tx.event(TxEvent::WriteSkipped) != TxState::Idle {
                    return WriteOutcome::Skipped;
                }
                Block::keepalive(self.seq)
            }
            Err(TryRecvError::Disconnected) => return WriteOutcome::Closed,
        };

        let start = Instant::now();
        let result = self.mailbox.write_block(&block).await;
        self.stats.record_write_time(elapsed_us(start));

        if let Err(err) = result {
            inc(&self.stats.wr_err);
            warn!("error writing to disk: {}", err);
            self.tx.event(TxEvent::WriteError);
            return WriteOutcome::Error;
        }

        self.tx.event(TxEvent::Written);
        inc(&self.stats.wr_blk);
        match block.kind {
            BlockKind::Data => inc(&self.stats.wr_blk_data),
            BlockKind::Keepalive => inc(&self.stats.wr_blk_keep),
        }
        self.seq = self.seq.wrapping_add(1);
        WriteOutcome::Wrote {
            id: block.id,
            kind: block.kind,
        }
    }

    /// Write on every tick until the outbound queue is closed.
    pub async fn run(mut self, tick: Duration) {
        let mut ticker = ticker(tick);
        loop {
            ticker.tick().await;
            if self.poll_once().await == WriteOutcome::Closed {
                debug!("outbound queue closed, disk writer stopping");
                return;
            }
        }
    }
}

// ==================== Endpoint loops ====================

/// Moves packets from the endpoint into the outbound queue.
pub struct EndpointReader<E> {
    endpoint: Arc<E>,
    outbound: mpsc::Sender<Vec<u8>>,
    stats: Arc<Stats>,
}

impl<E: PacketEndpoint> EndpointReader<E> {
    pub fn new(endpoint: Arc<E>, outbound: mpsc::Sender<Vec<u8>>, stats: Arc<Stats>) -> Self {
        Self {
            endpoint,
            outbound,
            stats,
        }
    }

    /// Receive one packet and queue it, waiting while the queue is full.
    pub async fn poll_once(&mut self) -> PacketOutcome {
        let mut buf = vec![0u8; PAYLOAD_MAX];
        let len = match self.endpoint.recv(&mut buf).await {
            Ok(0) => return PacketOutcome::Empty,
            Ok(len) => len,
            Err(err) => {
                inc(&self.stats.rx_err);
                warn!("error reading from endpoint: {}", err);
                return PacketOutcome::Error;
            }
        };
        buf.truncate(len);
        inc(&self.stats.rx_pkt);
        add(&self.stats.rx_bytes, len as u64);

        if self.outbound.send(buf).await.is_err() {
            return PacketOutcome::Closed;
        }
        PacketOutcome::Moved(len)
    }

    pub async fn run(mut self) {
        while self.poll_once().await != PacketOutcome::Closed {}
        debug!("outbound queue closed, endpoint reader stopping");
    }
}

/// Moves packets from the inbound queue to the endpoint.
pub struct EndpointWriter<E> {
    endpoint: Arc<E>,
    inbound: mpsc::Receiver<Vec<u8>>,
    stats: Arc<Stats>,
}

impl<E: PacketEndpoint> EndpointWriter<E> {
    pub fn new(endpoint: Arc<E>, inbound: mpsc::Receiver<Vec<u8>>, stats: Arc<Stats>) -> Self {
        Self {
            endpoint,
            inbound,
            stats,
        }
    }

    /// Wait for one queued packet and send it.
    pub async fn poll_once(&mut self) -> PacketOutcome {
        let Some(packet) = self.inbound.recv().await else {
            return PacketOutcome::Closed;
        };
        match self.endpoint.send(&packet).await {
            Ok(len) => {
                inc(&self.stats.tx_pkt);
                add(&self.stats.tx_bytes, len as u64);
                PacketOutcome::Moved(len)
            }
            Err(err) => {
                inc(&self.stats.tx_err);
                warn!("error writing to endpoint: {}", err);
                PacketOutcome::Error
            }
        }
    }

    pub async fn run(mut self) {
        while self.poll_once().await != PacketOutcome::Closed {}
        debug!("inbound queue closed, endpoint writer stopping");
    }
}

// ==================== Pipeline ====================

/// The four running loops.
pub struct Pipeline {
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Wire the loops together and spawn them on the current runtime.
    ///
    /// `config` is checked again here, so a hand-built config that would
    /// make the loops panic is rejected instead.
    pub fn spawn<D, E>(
        mailbox: Mailbox<D>,
        endpoint: E,
        config: &PipelineConfig,
        initial_seq: u32,
        stats: Arc<Stats>,
    ) -> Result<Self, ConfigError>
    where
        D: BlockDevice + 'static,
        E: PacketEndpoint + 'static,
    {
        config.check()?;
        let (rx, tx) = trackers(config.threshold, &stats)?;
        let mailbox = Arc::new(mailbox);
        let endpoint = Arc::new(endpoint);

        // disk -> endpoint
        let (inbound_tx, inbound_rx) = mpsc::channel(config.rx_capacity);
        // endpoint -> disk
        let (outbound_tx, outbound_rx) = mpsc::channel(config.tx_capacity);

        let reader = DiskReader::new(Arc::clone(&mailbox), rx, inbound_tx, Arc::clone(&stats));
        let writer = DiskWriter::new(
            mailbox,
            tx,
            initial_seq,
            outbound_rx,
            Arc::clone(&stats),
        );
        let ep_reader = EndpointReader::new(Arc::clone(&endpoint), outbound_tx, Arc::clone(&stats));
        let ep_writer = EndpointWriter::new(endpoint, inbound_rx, stats);

        let tick = config.tick;
        let tasks = vec![
            tokio::spawn(reader.run(tick)),
            tokio::spawn(writer.run(tick)),
            tokio::spawn(ep_reader.run()),
            tokio::spawn(ep_writer.run()),
        ];
        Ok(Self { tasks })
    }

    /// True once every loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Abort all loops and wait for them to unwind.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("pipeline task failed: {}", err);
                }
            }
        }
    }
}
