//! Stack and interface configuration.

use std::fmt;
use std::str::FromStr;

use crate::error::StackError;
use crate::network::addr::{MacAddr, Subnet};
use crate::network::ipv4::DEFAULT_TTL;
use crate::time::Millis;

/// Timeouts and protocol constants. The defaults are the values the protocols are tuned for;
/// tests shorten nothing and drive a virtual clock instead.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// How long ARP waiters wait for a reply.
    pub arp_timeout: Millis,
    /// Incomplete datagrams older than this are dropped.
    pub fragment_max_age: Millis,
    pub fragment_sweep_interval: Millis,
    /// Period of the TCP retransmission check.
    pub tcp_tick: Millis,
    /// An unacknowledged segment older than this is retransmitted.
    pub tcp_retransmit_after: Millis,
    /// Retransmissions before the connection is reset.
    pub tcp_max_retransmits: u32,
    /// Receive window advertised on every segment.
    pub tcp_window: u16,
    pub default_ttl: u8,
    pub dhcp_retry_interval: Millis,
    pub dns_timeout: Millis,
    /// Seed for ISNs, ports and transaction ids. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            arp_timeout: 10_000,
            fragment_max_age: 30_000,
            fragment_sweep_interval: 1_000,
            tcp_tick: 1_000,
            tcp_retransmit_after: 1_000,
            tcp_max_retransmits: 3,
            tcp_window: 65535,
            default_ttl: DEFAULT_TTL,
            dhcp_retry_interval: 5_000,
            dns_timeout: 10_000,
            rng_seed: None,
        }
    }
}

/// How frames cross the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceMode {
    /// Routed IP-only: frames are bare IPv4 packets, no link header, no ARP.
    Plain,
    /// Ethernet bridging with a statically assigned address.
    Bridged,
    /// Ethernet bridging; the address comes from DHCP.
    BridgedDhcp,
}

impl InterfaceMode {
    pub fn is_ethernet(self) -> bool {
        !matches!(self, InterfaceMode::Plain)
    }

    fn token(self) -> &'static str {
        match self {
            InterfaceMode::Plain => "ip",
            InterfaceMode::Bridged => "eth",
            InterfaceMode::BridgedDhcp => "dhcp",
        }
    }
}

impl FromStr for InterfaceMode {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(InterfaceMode::Plain),
            "eth" => Ok(InterfaceMode::Bridged),
            "dhcp" => Ok(InterfaceMode::BridgedDhcp),
            _ => Err(StackError::Handshake("unknown interface mode")),
        }
    }
}

impl fmt::Display for InterfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

pub const DEFAULT_MTU: usize = 1500;

/// Smallest MTU every IPv4 host must handle (RFC 791).
const MIN_MTU: usize = 68;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub mode: InterfaceMode,
    pub mac: MacAddr,
    /// Address and prefix; `None` until configured (e.g. by DHCP).
    pub address: Option<Subnet>,
    pub gateway: Option<std::net::Ipv4Addr>,
    pub mtu: usize,
}

impl InterfaceConfig {
    pub fn new(mode: InterfaceMode, mac: MacAddr) -> Self {
        InterfaceConfig {
            mode,
            mac,
            address: None,
            gateway: None,
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_address(mut self, address: Subnet) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_gateway(mut self, gateway: std::net::Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Parse the transport's control string `mode|cidr-or-empty|mtu`, e.g. `eth|10.0.0.2/24|1500`.
    pub fn from_handshake(line: &str, mac: MacAddr) -> Result<Self, StackError> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split('|');
        let mode: InterfaceMode = fields
            .next()
            .ok_or(StackError::Handshake("missing mode"))?
            .parse()?;
        let cidr = fields
            .next()
            .ok_or(StackError::Handshake("missing address field"))?;
        let mtu = fields
            .next()
            .ok_or(StackError::Handshake("missing MTU"))?
            .parse::<usize>()
            .map_err(|_| StackError::Handshake("MTU is not a number"))?;
        if fields.next().is_some() {
            return Err(StackError::Handshake("too many fields"));
        }
        if mtu < MIN_MTU {
            return Err(StackError::Handshake("MTU below 68"));
        }

        let address = if cidr.is_empty() {
            None
        } else {
            Some(
                cidr.parse::<Subnet>()
                    .map_err(|_| StackError::Handshake("invalid CIDR"))?,
            )
        };
        if address.is_none() && mode != InterfaceMode::BridgedDhcp {
            return Err(StackError::Handshake("address required unless DHCP"));
        }

        Ok(InterfaceConfig {
            mode,
            mac,
            address,
            gateway: None,
            mtu,
        })
    }

    /// The control string this configuration was parsed from.
    pub fn to_handshake(&self) -> String {
        let cidr = self.address.map(|a| a.to_string()).unwrap_or_default();
        format!("{}|{}|{}", self.mode, cidr, self.mtu)
    }
}
