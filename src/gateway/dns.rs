//! DNS relay.
//!
//! Each intercepted query gets its own task, its own upstream datagram
//! socket, and a bounded share of the relay's concurrency. Failures of any
//! kind are silent: the application's stub resolver retries on its own.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::trace;

use super::packet::{Ipv4Packet, UdpDatagram, PROTO_UDP};
use super::tun::TunDevice;

/// In-flight resolution bound.
const MAX_IN_FLIGHT: usize = 32;

/// Upstream read deadline per query.
const READ_DEADLINE: Duration = Duration::from_secs(5);

const REPLY_BUF: usize = 4096;

/// Hook invoked on each fresh upstream socket before any traffic, so the
/// host can exempt it from the tunnel (VpnService.protect and friends).
pub type ProtectFn = Arc<dyn Fn(&UdpSocket) -> std::io::Result<()> + Send + Sync>;

pub struct DnsRelay {
    tun: Arc<dyn TunDevice>,
    upstream: SocketAddr,
    permits: Arc<Semaphore>,
    protect: Option<ProtectFn>,
    ident: AtomicU16,
}

impl DnsRelay {
    pub fn new(tun: Arc<dyn TunDevice>, upstream: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            tun,
            upstream,
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            protect: None,
            ident: AtomicU16::new(rand::random()),
        })
    }

    pub fn with_protect(tun: Arc<dyn TunDevice>, upstream: SocketAddr, protect: ProtectFn) -> Arc<Self> {
        Arc::new(Self {
            tun,
            upstream,
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            protect: Some(protect),
            ident: AtomicU16::new(rand::random()),
        })
    }

    /// Launch one async resolution for a query datagram seen in the tunnel.
    pub fn spawn_query(
        self: &Arc<Self>,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        query: Vec<u8>,
    ) {
        let relay = self.clone();
        tokio::spawn(async move {
            relay.resolve(src_ip, src_port, dst_ip, dst_port, query).await;
        });
    }

    async fn resolve(
        &self,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        query: Vec<u8>,
    ) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)).await else {
            return;
        };
        if let Some(protect) = &self.protect {
            if protect(&socket).is_err() {
                return;
            }
        }

        if socket.send_to(&query, self.upstream).await.is_err() {
            return;
        }

        let mut buf = vec![0u8; REPLY_BUF];
        let n = match tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => n,
            _ => return,
        };

        // The reply must echo the query's transaction id.
        if n < 2 || query.len() < 2 || buf[..2] != query[..2] {
            trace!("discarding DNS reply with mismatched transaction id");
            return;
        }

        // Wrap the answer with source and destination swapped and hand it
        // back to the tunnel.
        let reply = UdpDatagram::serialize(dst_ip, src_ip, dst_port, src_port, &buf[..n]);
        let packet = Ipv4Packet::serialize(
            dst_ip,
            src_ip,
            PROTO_UDP,
            self.ident.fetch_add(1, Ordering::Relaxed),
            64,
            &reply,
        );
        let _ = self.tun.send(&packet).await;
    }
}
