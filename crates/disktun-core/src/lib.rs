//! disktun-core: Packet tunnelling over a shared block device.
//!
//! This crate provides:
//! - Fixed-size block framing with a CRC-32 integrity check
//! - Mailbox slots on a shared device (one we write, one the peer writes)
//! - A small debounced state machine and the Rx/Tx peer liveness trackers
//! - BlockDevice and PacketEndpoint trait abstractions

pub mod block;
pub mod config;
pub mod endpoint;
pub mod fsm;
pub mod mailbox;
pub mod peer;

pub use block::{BLOCK_SIZE, Block, BlockBuf, BlockKind, DecodeError, PAYLOAD_MAX};
pub use config::ConfigError;
pub use endpoint::PacketEndpoint;
pub use fsm::{Fsm, Transition, UnmatchedTransition};
pub use mailbox::{BlockDevice, Mailbox, MailboxError, MemDevice};
pub use peer::{Peer, RxEvent, RxState, RxTracker, TxEvent, TxState, TxTracker};
