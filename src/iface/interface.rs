//! Network interface state
//!
//! One `NetworkInterface` per attached link: its mode, hardware and protocol addresses, MTU
//! and (for Ethernet links) the ARP resolver. Address checks used by inbound dispatch live
//! here as well.

use std::net::Ipv4Addr;

use crate::config::{InterfaceConfig, InterfaceMode};
use crate::iface::arp::{ArpResolver, LinkIdentity};
use crate::iface::stack::ArpWaiter;
use crate::network::addr::{MacAddr, Subnet};
use crate::network::route::InterfaceId;

/// Network interface for packet processing
pub struct NetworkInterface {
    pub id: InterfaceId,
    pub mode: InterfaceMode,
    pub mac: MacAddr,
    /// Local IPv4 address and prefix; `None` until configured.
    pub address: Option<Subnet>,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: usize,
    pub(crate) arp: ArpResolver<ArpWaiter>,
}

impl NetworkInterface {
    pub fn new(id: InterfaceId, config: &InterfaceConfig) -> Self {
        NetworkInterface {
            id,
            mode: config.mode,
            mac: config.mac,
            address: config.address,
            gateway: config.gateway,
            mtu: config.mtu,
            arp: ArpResolver::new(),
        }
    }

    /// Our address, or 0.0.0.0 while unconfigured.
    pub fn local_addr(&self) -> Ipv4Addr {
        self.address.map_or(Ipv4Addr::UNSPECIFIED, |a| a.addr)
    }

    pub fn is_configured(&self) -> bool {
        self.address.is_some()
    }

    pub(crate) fn link_identity(&self) -> LinkIdentity {
        LinkIdentity {
            mac: self.mac,
            addr: self.local_addr(),
            subnet: self.address,
            gateway: self.gateway,
        }
    }

    /// Check if packet is destined for this interface
    ///
    /// An unconfigured interface accepts everything so that DHCP offers sent to the offered
    /// address still arrive.
    pub fn is_for_us(&self, dst_addr: Ipv4Addr) -> bool {
        let Some(address) = self.address else {
            return true;
        };
        dst_addr == address.addr
            || dst_addr.is_loopback()
            || dst_addr.is_multicast()
            || self.is_broadcast_address(dst_addr)
    }

    /// Limited broadcast, or the directed broadcast of our subnet.
    pub fn is_broadcast_address(&self, addr: Ipv4Addr) -> bool {
        if addr.is_broadcast() {
            return true;
        }
        self.address
            .is_some_and(|a| a.prefix_len < 31 && a.broadcast() == addr)
    }

    /// Check if address is in the same network
    pub fn is_same_network(&self, addr: Ipv4Addr) -> bool {
        self.address.is_some_and(|a| a.contains(addr))
    }

    /// Largest TCP payload that fits one unfragmented packet on this link.
    pub fn tcp_mss(&self) -> u16 {
        self.mtu.saturating_sub(40).min(u16::MAX as usize) as u16
    }
}
