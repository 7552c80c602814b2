//! Shared disk access with positional sector I/O.
//!
//! The device is opened with `O_SYNC | O_DIRECT` so every read goes to the
//! medium and every write is durable before it returns. Without that the
//! page cache would hide the peer's writes from us.

use async_trait::async_trait;
use disktun_core::block::BlockBuf;
use disktun_core::mailbox::BlockDevice;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Block device backed by a raw disk or, in buffered mode, a regular file.
#[derive(Debug, Clone)]
pub struct DirectDisk {
    file: Arc<File>,
    path: PathBuf,
}

impl DirectDisk {
    /// Open `path` read/write with direct, synchronous I/O.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::open_with(path.as_ref(), libc::O_SYNC | libc::O_DIRECT)
    }

    /// Open `path` with synchronous but cached I/O.
    ///
    /// Many filesystems (tmpfs among them) refuse `O_DIRECT`; this mode
    /// lets two processes on one host share a plain file instead.
    pub fn open_buffered(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::open_with(path.as_ref(), libc::O_SYNC)
    }

    fn open_with(path: &Path, flags: i32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)?;
        debug!("Opened {:?} (flags {:#x})", path, flags);
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn joined<T>(result: Result<io::Result<T>, tokio::task::JoinError>) -> io::Result<T> {
    result.map_err(io::Error::other)?
}

#[async_trait]
impl BlockDevice for DirectDisk {
    async fn read_block(&self, offset: u64) -> io::Result<BlockBuf> {
        let file = Arc::clone(&self.file);
        joined(
            tokio::task::spawn_blocking(move || {
                let mut buf = BlockBuf::zeroed();
                file.read_exact_at(buf.as_bytes_mut(), offset)?;
                Ok(buf)
            })
            .await,
        )
    }

    async fn write_block(&self, offset: u64, buf: &BlockBuf) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        let buf = buf.clone();
        joined(
            tokio::task::spawn_blocking(move || file.write_all_at(buf.as_bytes(), offset)).await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disktun_core::block::{BLOCK_SIZE, Block};
    use disktun_core::mailbox::Mailbox;
    use tempfile::NamedTempFile;

    fn disk_file(blocks: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(blocks * BLOCK_SIZE as u64).unwrap();
        file
    }

    #[tokio::test]
    async fn test_buffered_round_trip() {
        let file = disk_file(4);
        let disk = DirectDisk::open_buffered(file.path()).unwrap();

        let block = Block::data(42, b"hello".to_vec());
        disk.write_block(1024, &block.encode()).await.unwrap();

        let buf = disk.read_block(1024).await.unwrap();
        assert_eq!(Block::decode(&buf).unwrap(), block);
    }

    #[tokio::test]
    async fn test_fresh_file_reads_zeroes() {
        let file = disk_file(2);
        let disk = DirectDisk::open_buffered(file.path()).unwrap();
        assert_eq!(disk.path(), file.path());

        assert_eq!(disk.read_block(512).await.unwrap(), BlockBuf::zeroed());
    }

    #[tokio::test]
    async fn test_short_read_is_error() {
        let file = disk_file(1);
        let disk = DirectDisk::open_buffered(file.path()).unwrap();

        let err = disk.read_block(512).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_two_handles_share_slots() {
        let file = disk_file(4);
        let left = Mailbox::new(DirectDisk::open_buffered(file.path()).unwrap(), 1, 2).unwrap();
        let right = Mailbox::new(DirectDisk::open_buffered(file.path()).unwrap(), 2, 1).unwrap();

        left.write_block(&Block::data(7, b"over the disk".to_vec()))
            .await
            .unwrap();

        let block = right.read_block().await.unwrap();
        assert_eq!(block.id, 7);
        assert_eq!(block.payload, b"over the disk");
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectDisk::open_buffered(dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
