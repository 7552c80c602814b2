//! disktun-daemon library: Exposes the daemon components for testing.
//!
//! The binary in `main.rs` is a thin layer that parses arguments, opens the
//! disk and TUN device, and spawns the pipeline.

pub mod config;
pub mod disk;
pub mod metrics;
pub mod pipeline;
pub mod stats;
pub mod tun;

// Re-export key types for convenience
pub use config::{Args, PipelineConfig};
pub use disk::DirectDisk;
pub use pipeline::{DiskReader, DiskWriter, EndpointReader, EndpointWriter, Pipeline};
pub use stats::Stats;
pub use tun::TunDevice;
