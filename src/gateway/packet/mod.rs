pub mod checksum;
pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use ipv4::Ipv4Packet;
pub use tcp::TcpSegment;
pub use udp::UdpDatagram;

/// IP protocol numbers the interceptor cares about.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated packet")]
    Truncated,
    #[error("{0}")]
    Invalid(&'static str),
}
