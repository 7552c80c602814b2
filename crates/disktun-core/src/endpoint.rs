//! Packet-oriented network endpoint.
//!
//! One call moves one whole packet. The TUN device in disktun-daemon is the
//! production implementation; tests use channel-backed endpoints.

use async_trait::async_trait;
use std::io;

#[async_trait]
pub trait PacketEndpoint: Send + Sync {
    /// Wait for the next packet and copy it into `buf`.
    ///
    /// Returns the packet length. Packets longer than `buf` are truncated.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one packet, returning the number of bytes accepted.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl<T: PacketEndpoint + ?Sized> PacketEndpoint for std::sync::Arc<T> {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf).await
    }
}
