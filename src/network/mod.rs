//! Link and network layer protocols
//!
//! This module contains the wire codecs and tables below the transport layer:
//! - Ethernet framing and ARP
//! - IPv4 header codec, fragmentation/reassembly and routing
//! - ICMP echo

pub mod addr;
pub mod arp;
pub mod ethernet;
pub mod fragment;
pub mod icmp;
pub mod ipv4;
pub mod route;

use std::net::Ipv4Addr;

// Re-export commonly used items
pub use addr::{MacAddr, Subnet};
pub use ethernet::{EtherType, EthernetHeader};
pub use icmp::{IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
pub use ipv4::{flags, protocol, Ipv4Header};

/// Calculate Internet checksum
///
/// Sums the data in big-endian 16-bit words (an odd trailing byte is the high byte of a
/// zero-padded word), folds the carries and returns the one's complement.
pub fn checksum(data: &[u8]) -> u16 {
    checksum_with_seed(data, 0)
}

/// Internet checksum starting from a partial sum, e.g. a [`pseudo_header_seed`].
pub fn checksum_with_seed(data: &[u8], seed: u32) -> u16 {
    let mut sum = seed;

    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = add_folded(sum, u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = add_folded(sum, (*last as u32) << 8);
    }

    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn add_folded(sum: u32, word: u32) -> u32 {
    let sum = sum + word;
    (sum & 0xFFFF) + (sum >> 16)
}

/// Partial sum of the IPv4 pseudo header used by the TCP and UDP checksums.
pub fn pseudo_header_seed(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let src = src.octets();
    let dst = dst.octets();
    let words = [
        u16::from_be_bytes([src[0], src[1]]),
        u16::from_be_bytes([src[2], src[3]]),
        u16::from_be_bytes([dst[0], dst[1]]),
        u16::from_be_bytes([dst[2], dst[3]]),
        protocol as u16,
        length,
    ];
    words.iter().fold(0u32, |sum, &w| add_folded(sum, w as u32))
}
