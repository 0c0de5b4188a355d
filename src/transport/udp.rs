//! UDP (User Datagram Protocol) implementation
//!
//! This module provides UDP datagram parsing, validation and building (RFC 768).

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ensure_len, WireError};
use crate::network::route::InterfaceId;
use crate::network::{checksum_with_seed, protocol, pseudo_header_seed};

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse UDP header from byte slice
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        ensure_len(data, UDP_HEADER_LEN)?;

        Ok(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    /// Convert UDP header to bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

/// A datagram delivered to a UDP listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub interface: InterfaceId,
    pub data: Vec<u8>,
}

/// Calculate UDP checksum with pseudo header
///
/// A computed value of zero is sent as 0xFFFF; zero on the wire means "no checksum".
pub fn udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, udp_packet: &[u8]) -> u16 {
    let seed = pseudo_header_seed(src_ip, dst_ip, protocol::UDP, udp_packet.len() as u16);
    match checksum_with_seed(udp_packet, seed) {
        0 => 0xFFFF,
        sum => sum,
    }
}

/// Validate a UDP datagram and return its header and payload.
///
/// The length field must cover the header; bytes past it (link padding) are ignored. A
/// non-zero checksum must verify against the pseudo header.
pub fn parse_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    packet: &[u8],
) -> Result<(UdpHeader, &[u8]), WireError> {
    let header = UdpHeader::from_bytes(packet)?;
    let length = header.length as usize;
    if length < UDP_HEADER_LEN {
        return Err(WireError::Malformed("UDP length shorter than header"));
    }
    ensure_len(packet, length)?;
    let packet = &packet[..length];

    if header.checksum != 0 {
        let seed = pseudo_header_seed(src_ip, dst_ip, protocol::UDP, length as u16);
        if checksum_with_seed(packet, seed) != 0 {
            return Err(WireError::BadChecksum);
        }
    }

    Ok((header, &packet[UDP_HEADER_LEN..]))
}

/// Creates a complete UDP datagram with proper checksum
pub fn build_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_udp_len = UDP_HEADER_LEN + payload.len();
    let udp_header = UdpHeader {
        src_port,
        dst_port,
        length: total_udp_len as u16,
        checksum: 0,
    };

    let mut udp_packet = Vec::with_capacity(total_udp_len);
    udp_packet.extend_from_slice(&udp_header.to_bytes());
    udp_packet.extend_from_slice(payload);

    let checksum = udp_checksum(src_ip, dst_ip, &udp_packet);
    BigEndian::write_u16(&mut udp_packet[6..8], checksum);
    udp_packet
}
