//! Pipeline tests for disktun-daemon.
//!
//! Drives the disk and endpoint loops one step at a time over an in-memory
//! device, then runs whole pipelines against each other on a paused clock.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use disktun_core::ConfigError;
use disktun_core::block::{Block, BlockBuf, BlockKind, DecodeError, PAYLOAD_MAX};
use disktun_core::endpoint::PacketEndpoint;
use disktun_core::mailbox::{Mailbox, MemDevice};
use disktun_core::peer::{RxState, TxState};
use disktun_daemon::pipeline::{
    DiskReader, DiskWriter, EndpointReader, EndpointWriter, PacketOutcome, Pipeline, ReadOutcome,
    WriteOutcome, trackers,
};
use disktun_daemon::{DirectDisk, PipelineConfig, Stats};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

const READ_SLOT: usize = 1;
const WRITE_SLOT: usize = 2;

/// Endpoint backed by two channels, standing in for a TUN device.
struct ChannelEndpoint {
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    outgoing: mpsc::Sender<Vec<u8>>,
}

/// Returns the endpoint, a sender that injects packets into it and a
/// receiver that collects the packets it sends.
fn channel_endpoint() -> (ChannelEndpoint, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    let (inject, incoming) = mpsc::channel(16);
    let (outgoing, collect) = mpsc::channel(16);
    let endpoint = ChannelEndpoint {
        incoming: Mutex::new(incoming),
        outgoing,
    };
    (endpoint, inject, collect)
}

#[async_trait]
impl PacketEndpoint for ChannelEndpoint {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }
}

fn mailbox(device: &Arc<MemDevice>) -> Arc<Mailbox<Arc<MemDevice>>> {
    Arc::new(Mailbox::new(Arc::clone(device), READ_SLOT as u64, WRITE_SLOT as u64).unwrap())
}

fn reader(
    device: &Arc<MemDevice>,
    capacity: usize,
) -> (DiskReader<Arc<MemDevice>>, mpsc::Receiver<Vec<u8>>, Arc<Stats>) {
    let stats = Stats::new();
    let (rx, _) = trackers(5, &stats).unwrap();
    let (inbound, queue) = mpsc::channel(capacity);
    let reader = DiskReader::new(mailbox(device), rx, inbound, Arc::clone(&stats));
    (reader, queue, stats)
}

fn writer(
    device: &Arc<MemDevice>,
    initial_seq: u32,
) -> (DiskWriter<Arc<MemDevice>>, mpsc::Sender<Vec<u8>>, Arc<Stats>) {
    let stats = Stats::new();
    let (_, tx) = trackers(5, &stats).unwrap();
    let (outbound, queue) = mpsc::channel(4);
    let writer = DiskWriter::new(mailbox(device), tx, initial_seq, queue, Arc::clone(&stats));
    (writer, outbound, stats)
}

fn config(read_block: u64, write_block: u64) -> PipelineConfig {
    PipelineConfig {
        read_block,
        write_block,
        tick: Duration::from_millis(100),
        threshold: 5,
        tx_capacity: 4,
        rx_capacity: 4,
        stats_interval: None,
    }
}

// ==================== Disk reader ====================

#[tokio::test]
async fn test_reader_ignores_garbage_before_first_contact() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, _queue, stats) = reader(&device, 4);

    for _ in 0..50 {
        let outcome = reader.poll_once().await;
        assert_eq!(outcome, ReadOutcome::Ignored(DecodeError::Version { found: 0 }));
    }

    assert_eq!(reader.rx_state(), RxState::Init);
    assert_eq!(stats.snapshot().rd_blk_err, 50);
    assert_eq!(stats.rx_state(), RxState::Init);
}

#[tokio::test]
async fn test_reader_ignores_bad_crc_before_first_contact() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, mut queue, stats) = reader(&device, 4);

    // Right version, wrong checksum: a torn or half-written first block
    let mut corrupt = Block::keepalive(1).encode();
    corrupt.as_bytes_mut()[100] ^= 0x01;
    device.put_raw(READ_SLOT, corrupt);

    for _ in 0..10 {
        let outcome = reader.poll_once().await;
        assert!(matches!(outcome, ReadOutcome::Ignored(DecodeError::Crc { .. })));
    }

    assert_eq!(reader.rx_state(), RxState::Init);
    assert_eq!(stats.rx_state(), RxState::Init);
    assert_eq!(stats.snapshot().rd_blk_err, 10);
    assert!(queue.try_recv().is_err());

    // The first valid block after the garbage is still only a baseline
    device.put_block(READ_SLOT, &Block::keepalive(2));
    assert_eq!(reader.poll_once().await, ReadOutcome::First { id: 2 });
    assert_eq!(reader.rx_state(), RxState::Init);
}

#[tokio::test]
async fn test_reader_id_sequence_ends_down() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, _queue, stats) = reader(&device, 4);

    let mut outcomes = Vec::new();
    for id in [1, 1, 2, 3, 3, 3, 3, 3, 3] {
        device.put_block(READ_SLOT, &Block::keepalive(id));
        outcomes.push(reader.poll_once().await);
        if outcomes.len() == 8 {
            // four stale reads after the last new block
            assert_eq!(reader.rx_state(), RxState::Up);
        }
    }

    let keepalive = |id| ReadOutcome::New {
        id,
        kind: BlockKind::Keepalive,
        missed: 0,
    };
    assert_eq!(
        outcomes,
        vec![
            ReadOutcome::First { id: 1 },
            ReadOutcome::Stale { id: 1 },
            keepalive(2),
            keepalive(3),
            ReadOutcome::Stale { id: 3 },
            ReadOutcome::Stale { id: 3 },
            ReadOutcome::Stale { id: 3 },
            ReadOutcome::Stale { id: 3 },
            ReadOutcome::Stale { id: 3 },
        ]
    );
    assert_eq!(reader.rx_state(), RxState::Down);
    assert_eq!(stats.rx_state(), RxState::Down);
    assert_eq!(stats.snapshot().rd_blk_stale, 6);
}

#[tokio::test]
async fn test_reader_forwards_data_and_counts_missed() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, mut queue, stats) = reader(&device, 4);

    device.put_block(READ_SLOT, &Block::data(10, b"stale".to_vec()));
    assert_eq!(reader.poll_once().await, ReadOutcome::First { id: 10 });

    device.put_block(READ_SLOT, &Block::data(13, b"abc".to_vec()));
    assert_eq!(
        reader.poll_once().await,
        ReadOutcome::New {
            id: 13,
            kind: BlockKind::Data,
            missed: 2
        }
    );

    assert_eq!(queue.try_recv().unwrap(), b"abc");
    assert!(queue.try_recv().is_err(), "first block must not be forwarded");

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.rd_blk_miss, 2);
    assert_eq!(snapshot.rd_blk_data, 1);
}

#[tokio::test]
async fn test_reader_missed_count_across_wraparound() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, _queue, stats) = reader(&device, 4);

    device.put_block(READ_SLOT, &Block::keepalive(u32::MAX));
    reader.poll_once().await;
    device.put_block(READ_SLOT, &Block::keepalive(1));

    assert_eq!(
        reader.poll_once().await,
        ReadOutcome::New {
            id: 1,
            kind: BlockKind::Keepalive,
            missed: 1
        }
    );
    assert_eq!(stats.snapshot().rd_blk_miss, 1);
}

#[tokio::test]
async fn test_reader_older_id_is_new_without_missed() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, _queue, _stats) = reader(&device, 4);

    device.put_block(READ_SLOT, &Block::keepalive(50));
    reader.poll_once().await;
    device.put_block(READ_SLOT, &Block::keepalive(7));

    assert_eq!(
        reader.poll_once().await,
        ReadOutcome::New {
            id: 7,
            kind: BlockKind::Keepalive,
            missed: 0
        }
    );
}

#[tokio::test]
async fn test_reader_invalid_block_after_contact_is_error() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, _queue, _stats) = reader(&device, 4);

    device.put_block(READ_SLOT, &Block::keepalive(1));
    reader.poll_once().await;
    device.put_block(READ_SLOT, &Block::keepalive(2));
    reader.poll_once().await;
    assert_eq!(reader.rx_state(), RxState::Up);

    let mut corrupt = Block::keepalive(3).encode();
    corrupt.as_bytes_mut()[100] ^= 0x01;
    device.put_raw(READ_SLOT, corrupt);

    let outcome = reader.poll_once().await;
    assert!(matches!(outcome, ReadOutcome::Invalid(DecodeError::Crc { .. })));
    assert_eq!(reader.rx_state(), RxState::Error);

    device.put_block(READ_SLOT, &Block::keepalive(4));
    reader.poll_once().await;
    assert_eq!(reader.rx_state(), RxState::Up);
}

#[tokio::test]
async fn test_reader_device_error_always_raised() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, _queue, stats) = reader(&device, 4);

    device.set_fail_reads(true);
    assert_eq!(reader.poll_once().await, ReadOutcome::Error);
    assert_eq!(reader.rx_state(), RxState::Error);
    assert_eq!(stats.snapshot().rd_err, 1);

    // Error is left, Init is never re-entered
    device.set_fail_reads(false);
    device.put_raw(READ_SLOT, BlockBuf::zeroed());
    assert!(matches!(reader.poll_once().await, ReadOutcome::Invalid(_)));
}

#[tokio::test]
async fn test_reader_waits_for_inbound_space() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, mut queue, _stats) = reader(&device, 1);

    device.put_block(READ_SLOT, &Block::keepalive(1));
    reader.poll_once().await;
    device.put_block(READ_SLOT, &Block::data(2, b"one".to_vec()));
    reader.poll_once().await;

    device.put_block(READ_SLOT, &Block::data(3, b"two".to_vec()));
    let pending = tokio::spawn(async move { reader.poll_once().await });

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!pending.is_finished(), "full queue must block the reader");

    assert_eq!(queue.recv().await.unwrap(), b"one");
    let outcome = pending.await.unwrap();
    assert!(matches!(outcome, ReadOutcome::New { id: 3, .. }));
    assert_eq!(queue.recv().await.unwrap(), b"two");
}

#[tokio::test]
async fn test_reader_closed_queue() {
    let device = Arc::new(MemDevice::new(4));
    let (mut reader, queue, _stats) = reader(&device, 1);
    drop(queue);

    device.put_block(READ_SLOT, &Block::keepalive(1));
    reader.poll_once().await;
    device.put_block(READ_SLOT, &Block::data(2, b"lost".to_vec()));
    assert_eq!(reader.poll_once().await, ReadOutcome::Closed);
}

// ==================== Disk writer ====================

#[tokio::test]
async fn test_writer_keepalive_after_idle_ticks() {
    let device = Arc::new(MemDevice::new(4));
    let (mut writer, _outbound, stats) = writer(&device, 100);

    for _ in 0..3 {
        assert_eq!(writer.poll_once().await, WriteOutcome::Skipped);
    }
    assert_eq!(device.raw(WRITE_SLOT), BlockBuf::zeroed());

    assert_eq!(
        writer.poll_once().await,
        WriteOutcome::Wrote {
            id: 100,
            kind: BlockKind::Keepalive
        }
    );
    assert_eq!(writer.tx_state(), TxState::Up);

    // The write resets the idle count
    for _ in 0..3 {
        assert_eq!(writer.poll_once().await, WriteOutcome::Skipped);
    }
    assert!(matches!(
        writer.poll_once().await,
        WriteOutcome::Wrote { id: 101, .. }
    ));

    let written = Block::decode(&device.raw(WRITE_SLOT)).unwrap();
    assert_eq!(written, Block::keepalive(101));
    assert_eq!(stats.snapshot().wr_blk_keep, 2);
}

#[tokio::test]
async fn test_failed_keepalive_is_write_error() {
    let device = Arc::new(MemDevice::new(4));
    let stats = Stats::new();
    let (_, tx) = trackers(5, &stats).unwrap();
    let (_outbound, queue) = mpsc::channel(1);
    let mut writer = DiskWriter::new(mailbox(&device), tx, 0, queue, Arc::clone(&stats));

    device.set_fail_writes(true);
    for _ in 0..4 {
        writer.poll_once().await;
    }

    // The keepalive attempt failed, so the tracker passed through Idle into Error
    assert_eq!(writer.tx_state(), TxState::Error);
    assert_eq!(stats.snapshot().wr_err, 1);
}

#[tokio::test]
async fn test_writer_sends_queued_payload() {
    let device = Arc::new(MemDevice::new(4));
    let (mut writer, outbound, stats) = writer(&device, 7);

    outbound.send(b"packet".to_vec()).await.unwrap();
    assert_eq!(
        writer.poll_once().await,
        WriteOutcome::Wrote {
            id: 7,
            kind: BlockKind::Data
        }
    );

    let written = Block::decode(&device.raw(WRITE_SLOT)).unwrap();
    assert_eq!(written, Block::data(7, b"packet".to_vec()));
    assert_eq!(writer.next_seq(), 8);
    assert_eq!(stats.snapshot().wr_blk_data, 1);
}

#[tokio::test]
async fn test_writer_sequence_advances_only_on_success() {
    let device = Arc::new(MemDevice::new(4));
    let (mut writer, outbound, stats) = writer(&device, u32::MAX);

    device.set_fail_writes(true);
    outbound.send(b"dropped".to_vec()).await.unwrap();
    assert_eq!(writer.poll_once().await, WriteOutcome::Error);
    assert_eq!(writer.tx_state(), TxState::Error);
    assert_eq!(stats.tx_state(), TxState::Error);
    assert_eq!(writer.next_seq(), u32::MAX);

    device.set_fail_writes(false);
    outbound.send(b"kept".to_vec()).await.unwrap();
    assert!(matches!(
        writer.poll_once().await,
        WriteOutcome::Wrote { id: u32::MAX, .. }
    ));
    assert_eq!(writer.tx_state(), TxState::Up);
    assert_eq!(writer.next_seq(), 0);
}

#[tokio::test]
async fn test_writer_closed_queue() {
    let device = Arc::new(MemDevice::new(4));
    let (mut writer, outbound, _stats) = writer(&device, 0);
    drop(outbound);

    assert_eq!(writer.poll_once().await, WriteOutcome::Closed);
}

// ==================== Endpoint loops ====================

#[tokio::test]
async fn test_endpoint_reader_truncates_to_payload_max() {
    let (endpoint, inject, _collect) = channel_endpoint();
    let stats = Stats::new();
    let (outbound, mut queue) = mpsc::channel(1);
    let mut reader = EndpointReader::new(Arc::new(endpoint), outbound, Arc::clone(&stats));

    inject.send(vec![0xAB; 600]).await.unwrap();
    assert_eq!(reader.poll_once().await, PacketOutcome::Moved(PAYLOAD_MAX));

    let packet = queue.recv().await.unwrap();
    assert_eq!(packet.len(), PAYLOAD_MAX);
    assert_eq!(stats.snapshot().rx_bytes, PAYLOAD_MAX as u64);
}

#[tokio::test]
async fn test_endpoint_reader_error_is_counted() {
    let (endpoint, inject, _collect) = channel_endpoint();
    drop(inject);
    let stats = Stats::new();
    let (outbound, _queue) = mpsc::channel(1);
    let mut reader = EndpointReader::new(Arc::new(endpoint), outbound, Arc::clone(&stats));

    assert_eq!(reader.poll_once().await, PacketOutcome::Error);
    assert_eq!(stats.snapshot().rx_err, 1);
}

#[tokio::test]
async fn test_endpoint_writer_delivers_and_stops() {
    let (endpoint, _inject, mut collect) = channel_endpoint();
    let stats = Stats::new();
    let (inbound, queue) = mpsc::channel(2);
    let mut writer = EndpointWriter::new(Arc::new(endpoint), queue, Arc::clone(&stats));

    inbound.send(b"hi".to_vec()).await.unwrap();
    assert_eq!(writer.poll_once().await, PacketOutcome::Moved(2));
    assert_eq!(collect.recv().await.unwrap(), b"hi");
    assert_eq!(stats.snapshot().tx_pkt, 1);

    drop(inbound);
    assert_eq!(writer.poll_once().await, PacketOutcome::Closed);
}

// ==================== Full pipelines ====================

#[tokio::test]
async fn test_spawn_rejects_unchecked_config() {
    let device = Arc::new(MemDevice::new(4));

    let bad_configs = [
        (
            PipelineConfig {
                tx_capacity: 0,
                ..config(1, 2)
            },
            ConfigError::ZeroCapacity("txqlen"),
        ),
        (
            PipelineConfig {
                rx_capacity: usize::MAX,
                ..config(1, 2)
            },
            ConfigError::CapacityTooLarge("rxqlen", disktun_daemon::config::MAX_QUEUE_CAPACITY),
        ),
        (
            PipelineConfig {
                tick: Duration::ZERO,
                ..config(1, 2)
            },
            ConfigError::TickTooShort(Duration::ZERO),
        ),
    ];

    for (bad, expected) in bad_configs {
        let (endpoint, _inject, _collect) = channel_endpoint();
        let mailbox = Mailbox::new(Arc::clone(&device), 1, 2).unwrap();
        let result = Pipeline::spawn(mailbox, endpoint, &bad, 0, Stats::new());
        assert_eq!(result.err(), Some(expected));
    }
}

#[tokio::test(start_paused = true)]
async fn test_unwritten_slot_keeps_peer_in_init() {
    let device = Arc::new(MemDevice::new(4));
    let (endpoint, _inject, _collect) = channel_endpoint();
    let stats = Stats::new();
    let mailbox = Mailbox::new(Arc::clone(&device), 1, 2).unwrap();

    let pipeline =
        Pipeline::spawn(mailbox, endpoint, &config(1, 2), 0, Arc::clone(&stats)).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(stats.rx_state(), RxState::Init);
    let snapshot = stats.snapshot();
    assert!(snapshot.rd_blk_err >= 20, "polled {} times", snapshot.rd_blk_err);
    assert_eq!(snapshot.rd_err, 0);
    assert!(!pipeline.is_finished());

    // Our own slot carries keepalives even with no peer
    let written = Block::decode(&device.raw(2)).unwrap();
    assert_eq!(written.kind, BlockKind::Keepalive);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_pipelines_exchange_packets() {
    let device = Arc::new(MemDevice::new(4));
    let (left_ep, left_in, mut left_out) = channel_endpoint();
    let (right_ep, right_in, mut right_out) = channel_endpoint();
    let left_stats = Stats::new();
    let right_stats = Stats::new();

    let left = Pipeline::spawn(
        Mailbox::new(Arc::clone(&device), 1, 2).unwrap(),
        left_ep,
        &config(1, 2),
        1000,
        Arc::clone(&left_stats),
    )
    .unwrap();
    let right = Pipeline::spawn(
        Mailbox::new(Arc::clone(&device), 2, 1).unwrap(),
        right_ep,
        &config(2, 1),
        5,
        Arc::clone(&right_stats),
    )
    .unwrap();

    // Let both sides see each other's keepalives
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(left_stats.rx_state(), RxState::Up);
    assert_eq!(right_stats.rx_state(), RxState::Up);

    left_in.send(b"ping".to_vec()).await.unwrap();
    let packet = timeout(Duration::from_secs(2), right_out.recv()).await.unwrap();
    assert_eq!(packet.unwrap(), b"ping");

    right_in.send(b"pong".to_vec()).await.unwrap();
    let packet = timeout(Duration::from_secs(2), left_out.recv()).await.unwrap();
    assert_eq!(packet.unwrap(), b"pong");

    assert_eq!(left_stats.snapshot().tx_pkt, 1);
    assert_eq!(right_stats.snapshot().rx_pkt, 1);

    left.shutdown().await;
    right.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_buffered_disk_pipeline() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(4 * 512).unwrap();

    let (left_ep, left_in, _left_out) = channel_endpoint();
    let (right_ep, _right_in, mut right_out) = channel_endpoint();
    let mut fast = config(1, 2);
    fast.tick = Duration::from_millis(10);

    let left = Pipeline::spawn(
        Mailbox::new(DirectDisk::open_buffered(file.path()).unwrap(), 1, 2).unwrap(),
        left_ep,
        &fast,
        1,
        Stats::new(),
    )
    .unwrap();
    let right_stats = Stats::new();
    let right = Pipeline::spawn(
        Mailbox::new(DirectDisk::open_buffered(file.path()).unwrap(), 2, 1).unwrap(),
        right_ep,
        &PipelineConfig {
            read_block: 2,
            write_block: 1,
            ..fast.clone()
        },
        1,
        Arc::clone(&right_stats),
    )
    .unwrap();

    // Wait until the right side has a baseline block from the left
    timeout(Duration::from_secs(5), async {
        while right_stats.rx_state() != RxState::Up {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    left_in.send(b"through a file".to_vec()).await.unwrap();
    let packet = timeout(Duration::from_secs(5), right_out.recv()).await.unwrap();
    assert_eq!(packet.unwrap(), b"through a file");

    left.shutdown().await;
    right.shutdown().await;
}
