mod common;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use common::{next_packet, ChannelTun, PendingDialer};
use torvm::gateway::packet::{Ipv4Packet, UdpDatagram, PROTO_UDP};
use torvm::gateway::{DnsRelay, Interceptor, SessionManager};

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const RESOLVER_IN_TUNNEL: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
const CLIENT_PORT: u16 = 44444;

fn dns_query_packet(payload: &[u8]) -> Vec<u8> {
    let dgram = UdpDatagram::serialize(CLIENT, RESOLVER_IN_TUNNEL, CLIENT_PORT, 53, payload);
    Ipv4Packet::serialize(CLIENT, RESOLVER_IN_TUNNEL, PROTO_UDP, 7, 64, &dgram)
}

/// An upstream resolver that sends back a fixed reply for each datagram.
async fn spawn_resolver(reply: Vec<u8>) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((_, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let _ = socket.send_to(&reply, from).await;
        }
    });
    addr
}

#[tokio::test]
async fn relays_a_query_and_swaps_addresses() {
    let mut reply = vec![0xab, 0xcd];
    reply.extend_from_slice(&[0x11; 30]);
    assert_eq!(reply.len(), 32);
    let upstream = spawn_resolver(reply.clone()).await;

    let (tun, mut out) = ChannelTun::new();
    let dns = DnsRelay::new(tun.clone(), upstream);
    let sessions = SessionManager::new(tun.clone(), Arc::new(PendingDialer));
    let interceptor = Interceptor::new(tun, sessions, dns);

    let mut query = vec![0xab, 0xcd];
    query.extend_from_slice(b"\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00");
    interceptor.dispatch(&dns_query_packet(&query)).await;

    let packet = next_packet(&mut out, 5).await;
    let ip = Ipv4Packet::parse(&packet).unwrap();
    assert_eq!(ip.protocol, PROTO_UDP);
    assert_eq!(ip.src, RESOLVER_IN_TUNNEL);
    assert_eq!(ip.dst, CLIENT);
    assert!(ip.checksum_ok(&packet));

    let dgram = UdpDatagram::parse(ip.payload).unwrap();
    assert_eq!(dgram.src_port, 53);
    assert_eq!(dgram.dst_port, CLIENT_PORT);
    assert_eq!(dgram.payload, &reply[..]);
    assert!(dgram.checksum_ok(ip.src, ip.dst, ip.payload));
}

#[tokio::test]
async fn reply_with_wrong_transaction_id_is_discarded() {
    let mut reply = vec![0xff, 0xff];
    reply.extend_from_slice(&[0x22; 30]);
    let upstream = spawn_resolver(reply).await;

    let (tun, mut out) = ChannelTun::new();
    let dns = DnsRelay::new(tun, upstream);

    let query = vec![0xab, 0xcd, 0x01, 0x00];
    dns.spawn_query(CLIENT, CLIENT_PORT, RESOLVER_IN_TUNNEL, 53, query);

    assert!(
        tokio::time::timeout(Duration::from_millis(500), out.recv())
            .await
            .is_err(),
        "mismatched reply must not reach the tunnel"
    );
}

#[tokio::test]
async fn protect_callback_sees_every_upstream_socket() {
    let mut reply = vec![0xab, 0xcd];
    reply.extend_from_slice(&[0x33; 10]);
    let upstream = spawn_resolver(reply).await;

    let protected = Arc::new(AtomicUsize::new(0));
    let seen = protected.clone();
    let (tun, mut out) = ChannelTun::new();
    let dns = DnsRelay::with_protect(
        tun,
        upstream,
        Arc::new(move |_socket| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    dns.spawn_query(CLIENT, CLIENT_PORT, RESOLVER_IN_TUNNEL, 53, vec![0xab, 0xcd]);
    let _ = next_packet(&mut out, 5).await;
    assert_eq!(protected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn interceptor_drops_everything_but_tcp_and_dns() {
    let (tun, mut out) = ChannelTun::new();
    let upstream = spawn_resolver(vec![0xab, 0xcd]).await;
    let dns = DnsRelay::new(tun.clone(), upstream);
    let sessions = SessionManager::new(tun.clone(), Arc::new(PendingDialer));
    let interceptor = Interceptor::new(tun, sessions.clone(), dns);

    // ICMP echo request.
    let icmp = Ipv4Packet::serialize(CLIENT, RESOLVER_IN_TUNNEL, 1, 9, 64, &[8, 0, 0, 0]);
    interceptor.dispatch(&icmp).await;

    // UDP to a non-DNS port.
    let dgram = UdpDatagram::serialize(CLIENT, RESOLVER_IN_TUNNEL, 5000, 8080, b"hi");
    let udp = Ipv4Packet::serialize(CLIENT, RESOLVER_IN_TUNNEL, PROTO_UDP, 10, 64, &dgram);
    interceptor.dispatch(&udp).await;

    // Truncated and non-IPv4 garbage.
    interceptor.dispatch(&[0x45, 0x00, 0x00]).await;
    interceptor.dispatch(&[0x60; 40]).await;

    assert_eq!(sessions.len().await, 0);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), out.recv())
            .await
            .is_err(),
        "dropped packets must produce no tunnel output"
    );
}
