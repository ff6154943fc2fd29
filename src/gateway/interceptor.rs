//! Packet classification and dispatch.
//!
//! The sole entry point from the tunnel into the TCP core and the DNS
//! relay. Everything that is not well-formed IPv4 carrying TCP, or UDP
//! destined to port 53, is silently dropped — ICMP included.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::dns::DnsRelay;
use super::manager::SessionManager;
use super::packet::{Ipv4Packet, TcpSegment, UdpDatagram, PROTO_TCP, PROTO_UDP};
use super::tun::TunDevice;

const DNS_PORT: u16 = 53;

pub struct Interceptor {
    tun: Arc<dyn TunDevice>,
    sessions: Arc<SessionManager>,
    dns: Arc<DnsRelay>,
}

impl Interceptor {
    pub fn new(
        tun: Arc<dyn TunDevice>,
        sessions: Arc<SessionManager>,
        dns: Arc<DnsRelay>,
    ) -> Self {
        Self { tun, sessions, dns }
    }

    /// Tunnel read loop. Per-packet errors never propagate; only a fatal
    /// tunnel failure (or cancellation) ends the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("interceptor running");
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("interceptor stopping");
                    return Ok(());
                }
                read = self.tun.recv() => read.context("tunnel read")?,
            };
            self.dispatch(&packet).await;
        }
    }

    /// Classify one inbound IP packet and hand it to the right core.
    pub async fn dispatch(&self, packet: &[u8]) {
        if packet.len() < 20 {
            return;
        }
        if packet[0] >> 4 != 4 {
            return;
        }
        let Ok(ip) = Ipv4Packet::parse(packet) else {
            return;
        };

        match ip.protocol {
            PROTO_TCP => {
                let Ok(seg) = TcpSegment::parse(ip.payload) else {
                    return;
                };
                self.sessions.handle_segment(ip.src, ip.dst, seg).await;
            }
            PROTO_UDP => {
                let Ok(dgram) = UdpDatagram::parse(ip.payload) else {
                    return;
                };
                if dgram.dst_port == DNS_PORT {
                    self.dns.spawn_query(
                        ip.src,
                        dgram.src_port,
                        ip.dst,
                        dgram.dst_port,
                        dgram.payload.to_vec(),
                    );
                }
            }
            _ => {}
        }
    }
}
