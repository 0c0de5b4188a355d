//! IPv4 protocol implementation
//!
//! This module provides IPv4 header parsing, validation and serialization (RFC 791).
//!
//! Features:
//! - Header parsing with version and checksum validation
//! - Serialization with automatic checksum and total length
//! - Flag and fragment offset accessors

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ensure_len, WireError};
use crate::network::addr::read_ipv4;
use crate::network::checksum;

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)
pub const DEFAULT_TTL: u8 = 64;

/// IPv4 packet header structure
///
/// Represents the IPv4 header as defined in RFC 791, options included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub ihl: u8, // Internet Header Length
    pub tos: u8, // DSCP/ECN
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16, // Flags and Fragment Offset
    pub ttl: u8,                // Time to Live
    pub protocol: u8,           // Next Protocol
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Create a header for `payload_len` bytes of payload with default TTL and no options.
    pub fn new(protocol: u8, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, payload_len: usize) -> Self {
        Ipv4Header {
            ihl: DEFAULT_IHL,
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            id: 0,
            flags_frag_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
            options: Vec::new(),
        }
    }

    /// Parse and validate an IPv4 header
    ///
    /// Rejects packets whose version is not 4, whose lengths are inconsistent, or whose header
    /// checksum does not sum to zero.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        ensure_len(data, IPV4_HEADER_LEN)?;

        let version = (data[0] & 0xF0) >> 4;
        if version != IPV4_VERSION {
            return Err(WireError::Unsupported("IP version other than 4"));
        }
        let ihl = data[0] & 0x0F;
        if ihl < DEFAULT_IHL {
            return Err(WireError::Malformed("IHL below 5"));
        }
        let header_len = ihl as usize * 4;
        ensure_len(data, header_len)?;

        let total_len = BigEndian::read_u16(&data[2..4]);
        if (total_len as usize) < header_len {
            return Err(WireError::Malformed("total length shorter than header"));
        }
        ensure_len(data, total_len as usize)?;

        if checksum(&data[..header_len]) != 0 {
            return Err(WireError::BadChecksum);
        }

        Ok(Ipv4Header {
            ihl,
            tos: data[1],
            total_len,
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src_addr: read_ipv4(&data[12..16]),
            dst_addr: read_ipv4(&data[16..20]),
            options: data[IPV4_HEADER_LEN..header_len].to_vec(),
        })
    }

    /// Serialize the header, filling in IHL and a fresh checksum.
    ///
    /// Options are zero-padded to a multiple of four bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let options_len = (self.options.len() + 3) & !3;
        let header_len = IPV4_HEADER_LEN + options_len;
        let mut bytes = vec![0u8; header_len];
        bytes[0] = (IPV4_VERSION << 4) | (header_len / 4) as u8;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], self.total_len);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset);
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        bytes[12..16].copy_from_slice(&self.src_addr.octets());
        bytes[16..20].copy_from_slice(&self.dst_addr.octets());
        bytes[IPV4_HEADER_LEN..IPV4_HEADER_LEN + self.options.len()].copy_from_slice(&self.options);

        let sum = checksum(&bytes);
        BigEndian::write_u16(&mut bytes[10..12], sum);
        bytes
    }

    /// Create a complete IPv4 packet with payload
    ///
    /// The total length field is set from the payload and the checksum recomputed.
    pub fn packet(&self, payload: &[u8]) -> Vec<u8> {
        let mut header = self.clone();
        header.total_len = (header.serialized_len() + payload.len()) as u16;
        let mut packet = header.to_bytes();
        packet.extend_from_slice(payload);
        packet
    }

    /// Get the header length in bytes as carried in IHL
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Header length this header serializes to (options padded).
    pub fn serialized_len(&self) -> usize {
        IPV4_HEADER_LEN + ((self.options.len() + 3) & !3)
    }

    /// Get payload length
    ///
    /// Returns the length of the payload (total length - header length)
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_frag_offset & flags::DONT_FRAGMENT != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.flags_frag_offset & flags::MORE_FRAGMENTS != 0
    }

    /// Fragment offset in bytes.
    pub fn fragment_offset(&self) -> usize {
        (self.flags_frag_offset & flags::FRAGMENT_OFFSET_MASK) as usize * 8
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Set MF and the fragment offset (in bytes, must be a multiple of 8), keeping DF.
    pub fn set_fragment(&mut self, more_fragments: bool, offset: usize) {
        let mut value = self.flags_frag_offset & flags::DONT_FRAGMENT;
        if more_fragments {
            value |= flags::MORE_FRAGMENTS;
        }
        value |= ((offset / 8) as u16) & flags::FRAGMENT_OFFSET_MASK;
        self.flags_frag_offset = value;
    }

    /// Options carried into every fragment after the first: those with the copy bit set.
    /// A malformed option ends the walk.
    pub fn copied_options(&self) -> Vec<u8> {
        let mut copied = Vec::new();
        let mut i = 0;
        while i < self.options.len() {
            match self.options[i] {
                option::END => break,
                option::NOP => i += 1,
                kind => {
                    let Some(&len) = self.options.get(i + 1) else { break };
                    let len = len as usize;
                    if len < 2 || i + len > self.options.len() {
                        break;
                    }
                    if kind & option::COPY_FLAG != 0 {
                        copied.extend_from_slice(&self.options[i..i + len]);
                    }
                    i += len;
                }
            }
        }
        copied
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

/// IPv4 option type octets
pub mod option {
    pub const END: u8 = 0x00;
    pub const NOP: u8 = 0x01;
    pub const COPY_FLAG: u8 = 0x80;
}
