//! Startup configuration errors.
//!
//! Everything here is checked before any device is opened; none of these
//! conditions can appear at runtime.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Read and write block indexes can't be equal (both {0})")]
    SameBlock(u64),

    #[error("Block index {0} is past the largest addressable offset")]
    BlockOutOfRange(u64),

    #[error("Stale threshold must be at least 1")]
    ZeroThreshold,

    #[error("Poll frequency must be at least 1 Hz")]
    ZeroFrequency,

    #[error("Poll interval {0:?} is too short")]
    TickTooShort(Duration),

    #[error("Queue capacity for {0} must be at least 1")]
    ZeroCapacity(&'static str),

    #[error("Queue capacity for {0} can't exceed {1}")]
    CapacityTooLarge(&'static str, usize),
}
