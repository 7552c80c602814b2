//! Mailbox slots on a shared block device.
//!
//! A mailbox is a pair of fixed sectors on one device: we poll the remote
//! peer's sector and overwrite our own. Each slot holds only the latest
//! block, there is no queueing and no lock. The two peers never write the
//! same sector, which is why the read and write indexes must differ.
//!
//! Implementations of [`BlockDevice`]:
//! - `MemDevice` - For testing
//! - `DirectDisk` (in disktun-daemon) - Uses `O_DIRECT | O_SYNC` positional I/O

use crate::block::{BLOCK_SIZE, Block, BlockBuf, DecodeError};
use crate::config::ConfigError;
use async_trait::async_trait;
use std::io;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Device I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Block error: {0}")]
    Decode(#[from] DecodeError),
}

pub type Result<T> = std::result::Result<T, MailboxError>;

/// Raw sector access at byte offsets.
///
/// Reads must observe the most recent durable write from any process and
/// writes must be durable when they return, since the two peers have no
/// other way to synchronize.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Read the sector starting at `offset`.
    async fn read_block(&self, offset: u64) -> io::Result<BlockBuf>;

    /// Overwrite the sector starting at `offset`.
    async fn write_block(&self, offset: u64, buf: &BlockBuf) -> io::Result<()>;
}

/// Our outgoing slot and the peer's incoming slot on one device.
#[derive(Debug)]
pub struct Mailbox<D> {
    device: D,
    read_offset: u64,
    write_offset: u64,
}

impl<D: BlockDevice> Mailbox<D> {
    /// Bind a device to a pair of sector indexes.
    ///
    /// Fails when both indexes point at the same sector or an index has no
    /// valid byte offset; this is checked before anything touches the device.
    pub fn new(
        device: D,
        read_block: u64,
        write_block: u64,
    ) -> std::result::Result<Self, ConfigError> {
        let (read_offset, write_offset) = check_blocks(read_block, write_block)?;
        Ok(Self {
            device,
            read_offset,
            write_offset,
        })
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Read and validate the peer's slot.
    pub async fn read_block(&self) -> Result<Block> {
        let buf = self.device.read_block(self.read_offset).await?;
        Ok(Block::decode(&buf)?)
    }

    /// Overwrite our slot with `block`.
    pub async fn write_block(&self, block: &Block) -> Result<()> {
        let buf = block.encode();
        self.device.write_block(self.write_offset, &buf).await?;
        Ok(())
    }
}

/// Byte offset of sector `index`.
///
/// Offsets are `off_t` on the device side, so the whole sector must end at
/// or below `i64::MAX`.
pub fn block_offset(index: u64) -> std::result::Result<u64, ConfigError> {
    index
        .checked_mul(BLOCK_SIZE as u64)
        .filter(|offset| *offset <= i64::MAX as u64 - BLOCK_SIZE as u64)
        .ok_or(ConfigError::BlockOutOfRange(index))
}

/// Resolve a read/write index pair to byte offsets, rejecting a pair that
/// would make us read our own writes.
pub fn check_blocks(
    read_block: u64,
    write_block: u64,
) -> std::result::Result<(u64, u64), ConfigError> {
    let read_offset = block_offset(read_block)?;
    let write_offset = block_offset(write_block)?;
    if read_offset == write_offset {
        return Err(ConfigError::SameBlock(read_block));
    }
    Ok((read_offset, write_offset))
}

/// In-memory block device for testing.
///
/// Sectors that were never written read back as zeroes, like a wiped disk.
/// Reads and writes can be made to fail to exercise error paths.
#[derive(Debug)]
pub struct MemDevice {
    sectors: RwLock<Vec<BlockBuf>>,
    fail_reads: RwLock<bool>,
    fail_writes: RwLock<bool>,
}

impl MemDevice {
    pub fn new(block_count: usize) -> Self {
        Self {
            sectors: RwLock::new(vec![BlockBuf::zeroed(); block_count]),
            fail_reads: RwLock::new(false),
            fail_writes: RwLock::new(false),
        }
    }

    /// Overwrite a sector with raw bytes (for garbage and corruption tests).
    pub fn put_raw(&self, index: usize, buf: BlockBuf) {
        self.sectors.write().unwrap()[index] = buf;
    }

    /// Copy of a sector's raw bytes.
    pub fn raw(&self, index: usize) -> BlockBuf {
        self.sectors.read().unwrap()[index].clone()
    }

    /// Encode `block` straight into a sector, as the remote peer would.
    pub fn put_block(&self, index: usize, block: &Block) {
        self.put_raw(index, block.encode());
    }

    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.write().unwrap() = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.write().unwrap() = fail;
    }

    fn index(&self, offset: u64) -> io::Result<usize> {
        if offset % BLOCK_SIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unaligned offset {}", offset),
            ));
        }
        let index = (offset / BLOCK_SIZE as u64) as usize;
        if index >= self.sectors.read().unwrap().len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("offset {} past end of device", offset),
            ));
        }
        Ok(index)
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    async fn read_block(&self, offset: u64) -> io::Result<BlockBuf> {
        if *self.fail_reads.read().unwrap() {
            return Err(io::Error::other("injected read failure"));
        }
        let index = self.index(offset)?;
        Ok(self.sectors.read().unwrap()[index].clone())
    }

    async fn write_block(&self, offset: u64, buf: &BlockBuf) -> io::Result<()> {
        if *self.fail_writes.read().unwrap() {
            return Err(io::Error::other("injected write failure"));
        }
        let index = self.index(offset)?;
        self.sectors.write().unwrap()[index] = buf.clone();
        Ok(())
    }
}

#[async_trait]
impl<T: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<T> {
    async fn read_block(&self, offset: u64) -> io::Result<BlockBuf> {
        (**self).read_block(offset).await
    }

    async fn write_block(&self, offset: u64, buf: &BlockBuf) -> io::Result<()> {
        (**self).write_block(offset, buf).await
    }
}
