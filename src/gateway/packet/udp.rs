use std::net::Ipv4Addr;

use super::checksum::{ones_complement_finish, ones_complement_sum, pseudo_header_sum, verifies};
use super::{ParseError, PROTO_UDP};

/// A parsed UDP datagram borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, ParseError> {
        if buf.len() < 8 {
            return Err(ParseError::Truncated);
        }
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if length < 8 || buf.len() < length {
            return Err(ParseError::Truncated);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            length: length as u16,
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
            payload: &buf[8..length],
        })
    }

    pub fn checksum_ok(&self, src: Ipv4Addr, dst: Ipv4Addr, buf: &[u8]) -> bool {
        // An all-zero transmitted checksum means "not computed".
        if self.checksum == 0 {
            return true;
        }
        let sum = pseudo_header_sum(src, dst, PROTO_UDP, self.length);
        verifies(ones_complement_sum(sum, &buf[..self.length as usize]))
    }

    /// Build a UDP datagram with a freshly computed pseudo-header checksum.
    pub fn serialize(
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let length = 8 + payload.len();
        let mut out = vec![0u8; 8];
        out[0..2].copy_from_slice(&src_port.to_be_bytes());
        out[2..4].copy_from_slice(&dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(payload);

        let sum = pseudo_header_sum(src_ip, dst_ip, PROTO_UDP, length as u16);
        let mut csum = ones_complement_finish(ones_complement_sum(sum, &out));
        // RFC 768: a computed zero checksum is transmitted as all ones.
        if csum == 0 {
            csum = 0xffff;
        }
        out[6..8].copy_from_slice(&csum.to_be_bytes());
        out
    }
}
