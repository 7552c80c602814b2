//! Linux TUN interface as a packet endpoint.
//!
//! The interface runs in `IFF_TUN | IFF_NO_PI` mode, so every read and write
//! is exactly one raw IP packet with no extra header.

use async_trait::async_trait;
use disktun_core::endpoint::PacketEndpoint;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tracing::{debug, info};

const TUN_CLONE_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// `struct ifreq` restricted to the name and flags members.
#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TunDevice {
    fd: AsyncFd<File>,
    name: String,
}

impl TunDevice {
    /// Create (or attach to) a TUN interface.
    ///
    /// With no name the kernel picks one (`tun0`, `tun1`, ...).
    pub fn create(name: Option<&str>) -> io::Result<Self> {
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        if let Some(name) = name {
            let bytes = name.as_bytes();
            if bytes.len() >= libc::IFNAMSIZ {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("interface name {:?} is too long", name),
                ));
            }
            req.name[..bytes.len()].copy_from_slice(bytes);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_CLONE_DEVICE)?;

        // SAFETY: the fd is open for the duration of the call and `req` is a
        // properly sized, writable ifreq.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let len = req.name.iter().position(|&b| b == 0).unwrap_or(req.name.len());
        let name = String::from_utf8_lossy(&req.name[..len]).into_owned();
        debug!("Attached to TUN interface {}", name);

        Ok(Self {
            fd: AsyncFd::new(file)?,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assign the point-to-point addresses, set the MTU and bring the link up.
    pub async fn configure(&self, local: &str, peer: &str, mtu: usize) -> io::Result<()> {
        ip(&["addr", "add", local, "peer", peer, "dev", &self.name]).await?;
        ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()]).await?;
        ip(&["link", "set", "dev", &self.name, "up"]).await?;
        info!("{}: {} peer {} mtu {}", self.name, local, peer, mtu);
        Ok(())
    }
}

async fn ip(args: &[&str]) -> io::Result<()> {
    let output = Command::new("ip").args(args).output().await?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl PacketEndpoint for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice").field("name", &self.name).finish()
    }
}
