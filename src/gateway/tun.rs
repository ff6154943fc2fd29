//! Tunnel device I/O.
//!
//! The tunnel is a character device: one raw IPv4 packet per read, one per
//! write. Reads block on the device; writes are serialized by a mutex so a
//! packet is always written whole before the next begins.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Tunnel frames are raw IPv4 packets at this MTU.
pub const TUN_MTU: usize = 1500;

#[async_trait::async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one packet from the tunnel.
    async fn recv(&self) -> io::Result<Vec<u8>>;

    /// Write one packet into the tunnel, atomically with respect to other
    /// writers.
    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// A tunnel backed by a raw file descriptor handed over by the OS (the
/// VPN-service fd on mobile platforms).
pub struct FdTun {
    reader: Mutex<tokio::fs::File>,
    writer: Mutex<tokio::fs::File>,
    mtu: usize,
}

#[cfg(unix)]
impl FdTun {
    /// Take ownership of `fd` and split it into read and write handles.
    ///
    /// # Safety
    /// `fd` must be a valid, open tunnel descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: std::os::unix::io::RawFd) -> io::Result<Self> {
        use std::os::unix::io::FromRawFd;
        let read = std::fs::File::from_raw_fd(fd);
        let write = read.try_clone()?;
        Ok(Self {
            reader: Mutex::new(tokio::fs::File::from_std(read)),
            writer: Mutex::new(tokio::fs::File::from_std(write)),
            mtu: TUN_MTU,
        })
    }
}

#[async_trait::async_trait]
impl TunDevice for FdTun {
    async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut file = self.reader.lock().await;
        let mut buf = vec![0u8; self.mtu];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tunnel closed",
            ));
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        let mut file = self.writer.lock().await;
        file.write_all(packet).await?;
        file.flush().await
    }
}
