//! Hardware and IPv4 address value types.
//!
//! IPv4 addresses are plain [`std::net::Ipv4Addr`] values; this module adds the 6-byte
//! hardware address and an address/prefix pair used for interface configuration and routing.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::WireError;

/// 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = data.get(..6)?.try_into().ok()?;
        Some(MacAddr(bytes))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set (includes broadcast).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or(WireError::Malformed("hardware address too short"))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| WireError::Malformed("hardware address octet is not hex"))?;
        }
        if parts.next().is_some() {
            return Err(WireError::Malformed("hardware address too long"));
        }
        Ok(MacAddr(bytes))
    }
}

/// Reads a 4-byte IPv4 address from the start of `data`.
pub(crate) fn read_ipv4(data: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(data[0], data[1], data[2], data[3])
}

/// Builds the netmask for a prefix length (clamped to 32).
pub fn prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    let prefix_len = prefix_len.min(32) as u32;
    let bits = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits)
}

/// Converts a netmask to a prefix length by counting its leading ones.
pub fn mask_to_prefix(mask: Ipv4Addr) -> u8 {
    u32::from(mask).leading_ones() as u8
}

/// Address with a prefix length, e.g. `192.168.2.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    pub const fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Subnet { addr, prefix_len }
    }

    pub fn mask(&self) -> Ipv4Addr {
        prefix_to_mask(self.prefix_len)
    }

    /// The subnet with host bits cleared.
    pub fn network(&self) -> Subnet {
        let addr = u32::from(self.addr) & u32::from(self.mask());
        Subnet::new(Ipv4Addr::from(addr), self.prefix_len)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask());
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }

    /// Directed broadcast address of the subnet.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.mask()))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or(WireError::Malformed("CIDR is missing '/'"))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| WireError::Malformed("invalid IPv4 address"))?;
        let prefix_len = prefix
            .parse::<u8>()
            .map_err(|_| WireError::Malformed("invalid prefix length"))?;
        if prefix_len > 32 {
            return Err(WireError::Malformed("prefix length above 32"));
        }
        Ok(Subnet::new(addr, prefix_len))
    }
}

/// True for addresses that are delivered to a single host.
pub fn is_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_broadcast() || ip.is_multicast() || ip.is_unspecified())
}
