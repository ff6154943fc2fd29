use std::net::Ipv4Addr;

use super::checksum::{ones_complement_finish, ones_complement_sum, pseudo_header_sum, verifies};
use super::{ParseError, PROTO_TCP};

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

/// A parsed TCP segment borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, ParseError> {
        if buf.len() < 20 {
            return Err(ParseError::Truncated);
        }
        let data_offset = (buf[12] >> 4) as usize * 4;
        if data_offset < 20 {
            return Err(ParseError::Invalid("TCP data offset below minimum"));
        }
        if data_offset > buf.len() {
            return Err(ParseError::Truncated);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: buf[13],
            window: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
            options: &buf[20..data_offset],
            payload: &buf[data_offset..],
        })
    }

    pub fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & FLAG_RST != 0
    }

    /// Whether the stored checksum is consistent with the segment and the
    /// given pseudo-header addresses.
    pub fn checksum_ok(&self, src: Ipv4Addr, dst: Ipv4Addr, buf: &[u8]) -> bool {
        let sum = pseudo_header_sum(src, dst, PROTO_TCP, buf.len() as u16);
        verifies(ones_complement_sum(sum, buf))
    }

    /// Build a TCP segment with a freshly computed pseudo-header checksum.
    /// `options` must be a multiple of four bytes (pad with NOPs).
    #[allow(clippy::too_many_arguments)]
    pub fn serialize(
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        options: &[u8],
        payload: &[u8],
    ) -> Vec<u8> {
        debug_assert!(options.len() % 4 == 0, "TCP options must be 32-bit aligned");
        let header_len = 20 + options.len();
        let total_len = header_len + payload.len();

        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&src_port.to_be_bytes());
        out.extend_from_slice(&dst_port.to_be_bytes());
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&ack.to_be_bytes());
        out.push(((header_len / 4) as u8) << 4);
        out.push(flags);
        out.extend_from_slice(&window.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
        out.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
        out.extend_from_slice(options);
        out.extend_from_slice(payload);

        let sum = pseudo_header_sum(src_ip, dst_ip, PROTO_TCP, total_len as u16);
        let csum = ones_complement_finish(ones_complement_sum(sum, &out));
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        out
    }
}

/// The MSS option advertised in our SYN+ACK.
pub fn mss_option(mss: u16) -> [u8; 4] {
    [2, 4, (mss >> 8) as u8, (mss & 0xff) as u8]
}
