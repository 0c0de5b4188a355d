//! TCP (Transmission Control Protocol) wire format
//!
//! This module provides TCP segment parsing and building (RFC 793), the connection state
//! enumeration and wrapping sequence-number comparisons. The connection state machine itself
//! lives in [`crate::transport::connection`].

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::BitOr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ensure_len, WireError};
use crate::network::{checksum_with_seed, protocol, pseudo_header_seed};

pub const TCP_HEADER_LEN: usize = 20;

const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;
const OPTION_MSS: u8 = 2;

/// MSS assumed when the peer does not send the option (RFC 879).
pub const DEFAULT_MSS: u16 = 536;

/// TCP connection states as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which application data may still be queued for sending.
    pub fn can_send(self) -> bool {
        matches!(
            self,
            TcpState::SynSent | TcpState::SynReceived | TcpState::Established | TcpState::CloseWait
        )
    }
}

/// TCP control bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 6] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::URG, "URG"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", names.join("|"))
    }
}

/// TCP packet header structure
///
/// Represents the TCP header as defined in RFC 793. Of the options only the MSS is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    pub mss: Option<u16>,
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, flags: TcpFlags) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            flags,
            window_size: 0,
            checksum: 0,
            urgent_ptr: 0,
            mss: None,
        }
    }

    /// Parse TCP header from byte slice
    ///
    /// Returns the header and the header length in bytes.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), WireError> {
        ensure_len(data, TCP_HEADER_LEN)?;
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < TCP_HEADER_LEN {
            return Err(WireError::Malformed("TCP data offset below 5"));
        }
        ensure_len(data, data_offset)?;

        let header = TcpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            seq_number: BigEndian::read_u32(&data[4..8]),
            ack_number: BigEndian::read_u32(&data[8..12]),
            flags: TcpFlags(data[13] & 0x3f),
            window_size: BigEndian::read_u16(&data[14..16]),
            checksum: BigEndian::read_u16(&data[16..18]),
            urgent_ptr: BigEndian::read_u16(&data[18..20]),
            mss: parse_mss(&data[TCP_HEADER_LEN..data_offset])?,
        };
        Ok((header, data_offset))
    }

    /// Convert TCP header to bytes (checksum field as stored)
    pub fn to_bytes(&self) -> Vec<u8> {
        let header_len = if self.mss.is_some() {
            TCP_HEADER_LEN + 4
        } else {
            TCP_HEADER_LEN
        };
        let mut bytes = vec![0u8; header_len];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u32(&mut bytes[4..8], self.seq_number);
        BigEndian::write_u32(&mut bytes[8..12], self.ack_number);
        bytes[12] = ((header_len / 4) as u8) << 4;
        bytes[13] = self.flags.0;
        BigEndian::write_u16(&mut bytes[14..16], self.window_size);
        BigEndian::write_u16(&mut bytes[16..18], self.checksum);
        BigEndian::write_u16(&mut bytes[18..20], self.urgent_ptr);
        if let Some(mss) = self.mss {
            bytes[20] = OPTION_MSS;
            bytes[21] = 4;
            BigEndian::write_u16(&mut bytes[22..24], mss);
        }
        bytes
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn is_psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }
}

/// Minimal options parser: end-of-options, no-op and MSS. Other options are skipped.
fn parse_mss(mut options: &[u8]) -> Result<Option<u16>, WireError> {
    let mut mss = None;
    while let Some(&kind) = options.first() {
        match kind {
            OPTION_END => break,
            OPTION_NOP => options = &options[1..],
            _ => {
                let len = *options
                    .get(1)
                    .ok_or(WireError::Malformed("TCP option without length"))?
                    as usize;
                if len < 2 || len > options.len() {
                    return Err(WireError::Malformed("TCP option length"));
                }
                if kind == OPTION_MSS {
                    if len != 4 {
                        return Err(WireError::Malformed("TCP MSS option length"));
                    }
                    mss = Some(BigEndian::read_u16(&options[2..4]));
                }
                options = &options[len..];
            }
        }
    }
    Ok(mss)
}

/// Validate a TCP segment against its pseudo header and split off the payload.
pub fn parse_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    segment: &[u8],
) -> Result<(TcpHeader, &[u8]), WireError> {
    let seed = pseudo_header_seed(src_ip, dst_ip, protocol::TCP, segment.len() as u16);
    if checksum_with_seed(segment, seed) != 0 {
        return Err(WireError::BadChecksum);
    }
    let (header, header_len) = TcpHeader::from_bytes(segment)?;
    Ok((header, &segment[header_len..]))
}

/// Serialize a segment with its checksum filled in.
pub fn build_segment(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, header: &TcpHeader, payload: &[u8]) -> Vec<u8> {
    let mut header = *header;
    header.checksum = 0;
    let mut segment = header.to_bytes();
    segment.extend_from_slice(payload);
    let seed = pseudo_header_seed(src_ip, dst_ip, protocol::TCP, segment.len() as u16);
    let sum = checksum_with_seed(&segment, seed);
    BigEndian::write_u16(&mut segment[16..18], sum);
    segment
}

/// `a` precedes `b` in modulo-2^32 sequence space.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}
