//! Upstream stream dialing through a SOCKS5 proxy.

use std::net::{SocketAddr, SocketAddrV4};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// How flow upstreams are established. Sessions only see this seam; the
/// production implementation speaks SOCKS5 CONNECT.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dst: SocketAddrV4) -> Result<TcpStream>;
}

/// Minimal SOCKS5 client: no authentication, CONNECT only.
pub struct SocksDialer {
    proxy: SocketAddr,
}

impl SocksDialer {
    pub fn new(proxy: SocketAddr) -> Self {
        Self { proxy }
    }
}

#[async_trait::async_trait]
impl Dialer for SocksDialer {
    async fn dial(&self, dst: SocketAddrV4) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.proxy)
            .await
            .context("connect to SOCKS proxy")?;

        // Greeting: version 5, one method, no auth.
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await?;
        if method != [0x05, 0x00] {
            bail!("SOCKS5 method negotiation failed: {:02x?}", method);
        }

        // CONNECT to an IPv4 address.
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&dst.ip().octets());
        request.extend_from_slice(&dst.port().to_be_bytes());
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != 0x05 {
            bail!("not a SOCKS5 reply");
        }
        if head[1] != 0x00 {
            bail!("SOCKS5 connect refused (rep={:#04x})", head[1]);
        }

        // Consume the bound address, whatever its type.
        let bound_len = match head[3] {
            0x01 => 4 + 2,
            0x04 => 16 + 2,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            other => bail!("SOCKS5 reply with unknown address type {:#04x}", other),
        };
        let mut bound = vec![0u8; bound_len];
        stream.read_exact(&mut bound).await?;

        Ok(stream)
    }
}
