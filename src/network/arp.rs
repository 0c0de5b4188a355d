//! ARP packet codec (RFC 826, Ethernet/IPv4 only)

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ensure_len, WireError};
use crate::network::addr::{read_ipv4, MacAddr};

pub const ARP_PACKET_LEN: usize = 28;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

impl ArpOperation {
    fn code(self) -> u16 {
        match self {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpPacket {
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// Reply answering `request` on behalf of `our_mac`.
    pub fn reply_to(request: &ArpPacket, our_mac: MacAddr) -> Self {
        ArpPacket {
            operation: ArpOperation::Reply,
            sender_mac: our_mac,
            sender_ip: request.target_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        ensure_len(data, ARP_PACKET_LEN)?;
        if BigEndian::read_u16(&data[0..2]) != HTYPE_ETHERNET
            || BigEndian::read_u16(&data[2..4]) != PTYPE_IPV4
        {
            return Err(WireError::Unsupported("ARP for non Ethernet/IPv4"));
        }
        if data[4] != 6 || data[5] != 4 {
            return Err(WireError::Malformed("ARP address lengths"));
        }
        let operation = match BigEndian::read_u16(&data[6..8]) {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            _ => return Err(WireError::Unsupported("ARP operation")),
        };
        Ok(ArpPacket {
            operation,
            sender_mac: MacAddr::from_bytes(&data[8..14]).ok_or(WireError::Malformed("sha"))?,
            sender_ip: read_ipv4(&data[14..18]),
            target_mac: MacAddr::from_bytes(&data[18..24]).ok_or(WireError::Malformed("tha"))?,
            target_ip: read_ipv4(&data[24..28]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_LEN] {
        let mut bytes = [0u8; ARP_PACKET_LEN];
        BigEndian::write_u16(&mut bytes[0..2], HTYPE_ETHERNET);
        BigEndian::write_u16(&mut bytes[2..4], PTYPE_IPV4);
        bytes[4] = 6;
        bytes[5] = 4;
        BigEndian::write_u16(&mut bytes[6..8], self.operation.code());
        bytes[8..14].copy_from_slice(&self.sender_mac.0);
        bytes[14..18].copy_from_slice(&self.sender_ip.octets());
        bytes[18..24].copy_from_slice(&self.target_mac.0);
        bytes[24..28].copy_from_slice(&self.target_ip.octets());
        bytes
    }
}
