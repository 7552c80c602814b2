//! Fixed-size block framing for mailbox slots.
//!
//! Every block occupies exactly one 512-byte sector so that a single write
//! is atomic from the device's point of view.
//!
//! On-disk layout (big-endian):
//!
//! | offset | size | field   |
//! |--------|------|---------|
//! | 0      | 1    | version |
//! | 1      | 1    | kind    |
//! | 2      | 2    | length  |
//! | 4      | 4    | id      |
//! | 8      | 4    | crc     |
//! | 12     | 500  | payload (zero-padded) |
//!
//! The CRC-32 covers the header without the crc field plus the whole padded
//! payload area.

use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Size of an encoded block in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Size of the block header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Largest payload a single block can carry.
pub const PAYLOAD_MAX: usize = BLOCK_SIZE - HEADER_SIZE;

/// Protocol version written into every block.
pub const BLOCK_VERSION: u8 = 1;

const VERSION_OFFSET: usize = 0;
const KIND_OFFSET: usize = 1;
const LEN_OFFSET: usize = 2;
const ID_OFFSET: usize = 4;
const CRC_OFFSET: usize = 8;
const PAYLOAD_OFFSET: usize = HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Unsupported block version: {found} (expected {})", BLOCK_VERSION)]
    Version { found: u8 },

    #[error("Payload length too big: {len} (max {})", PAYLOAD_MAX)]
    Length { len: usize },

    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Crc { stored: u32, computed: u32 },

    #[error("Unknown block kind: {0}")]
    Kind(u8),
}

/// What a block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// A tunnelled packet
    Data = 0,
    /// Heartbeat with no payload, written only to change the slot id
    Keepalive = 1,
}

impl BlockKind {
    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(Self::Data),
            1 => Ok(Self::Keepalive),
            other => Err(DecodeError::Kind(other)),
        }
    }
}

impl Display for BlockKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("data"),
            Self::Keepalive => f.write_str("keepalive"),
        }
    }
}

/// One sector worth of bytes, aligned for direct I/O.
#[derive(Clone, PartialEq, Eq)]
#[repr(C, align(512))]
pub struct BlockBuf([u8; BLOCK_SIZE]);

impl BlockBuf {
    /// An all-zero buffer (what a freshly wiped device returns).
    pub fn zeroed() -> Self {
        Self([0u8; BLOCK_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.0
    }
}

impl Default for BlockBuf {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl From<[u8; BLOCK_SIZE]> for BlockBuf {
    fn from(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for BlockBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuf")
            .field("header", &&self.0[..HEADER_SIZE])
            .finish_non_exhaustive()
    }
}

/// A decoded mailbox block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: u32,
    pub kind: BlockKind,
    pub payload: Vec<u8>,
}

impl Block {
    /// Create a block.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is longer than [`PAYLOAD_MAX`]. Callers size their
    /// read buffers to `PAYLOAD_MAX`, so a larger payload is a bug.
    pub fn new(id: u32, kind: BlockKind, payload: Vec<u8>) -> Self {
        assert!(
            payload.len() <= PAYLOAD_MAX,
            "payload size is too big: {} > {}",
            payload.len(),
            PAYLOAD_MAX
        );
        Self { id, kind, payload }
    }

    pub fn data(id: u32, payload: Vec<u8>) -> Self {
        Self::new(id, BlockKind::Data, payload)
    }

    pub fn keepalive(id: u32) -> Self {
        Self::new(id, BlockKind::Keepalive, Vec::new())
    }

    /// Serialize into a full, checksummed sector.
    pub fn encode(&self) -> BlockBuf {
        assert!(self.payload.len() <= PAYLOAD_MAX);

        let mut buf = BlockBuf::zeroed();
        let bytes = buf.as_bytes_mut();
        bytes[VERSION_OFFSET] = BLOCK_VERSION;
        bytes[KIND_OFFSET] = self.kind as u8;
        bytes[LEN_OFFSET..ID_OFFSET].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes[ID_OFFSET..CRC_OFFSET].copy_from_slice(&self.id.to_be_bytes());
        bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + self.payload.len()].copy_from_slice(&self.payload);

        let crc = checksum(bytes);
        bytes[CRC_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parse and validate a sector.
    ///
    /// Checks run in a fixed order: version, length, checksum, kind. A version
    /// mismatch is reported even when the checksum happens to be valid.
    pub fn decode(buf: &BlockBuf) -> Result<Self, DecodeError> {
        let bytes = buf.as_bytes();

        let version = bytes[VERSION_OFFSET];
        if version != BLOCK_VERSION {
            return Err(DecodeError::Version { found: version });
        }

        let len = u16::from_be_bytes([bytes[LEN_OFFSET], bytes[LEN_OFFSET + 1]]) as usize;
        if len > PAYLOAD_MAX {
            return Err(DecodeError::Length { len });
        }

        let stored = read_u32(bytes, CRC_OFFSET);
        let computed = checksum(bytes);
        if stored != computed {
            return Err(DecodeError::Crc { stored, computed });
        }

        let kind = BlockKind::from_byte(bytes[KIND_OFFSET])?;
        let id = read_u32(bytes, ID_OFFSET);
        let payload = bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + len].to_vec();

        Ok(Self { id, kind, payload })
    }
}

fn read_u32(bytes: &[u8; BLOCK_SIZE], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn checksum(bytes: &[u8; BLOCK_SIZE]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..CRC_OFFSET]);
    hasher.update(&bytes[PAYLOAD_OFFSET..]);
    hasher.finalize()
}
