//! ARP cache and pending-resolution queue for one Ethernet interface.
//!
//! The resolver only keeps state. The stack sends the request frames, arms the timeout and
//! decides what a waiter is (a queued packet or an application callback).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{debug, trace};

use crate::network::addr::{is_unicast, MacAddr, Subnet};
use crate::time::TimerId;

/// What the resolver needs to know about the interface it serves.
#[derive(Debug, Clone, Copy)]
pub struct LinkIdentity {
    pub mac: MacAddr,
    pub addr: Ipv4Addr,
    pub subnet: Option<Subnet>,
    pub gateway: Option<Ipv4Addr>,
}

impl LinkIdentity {
    /// The address to resolve for `dst` when no route has picked a next hop: the gateway for
    /// off-subnet unicast, `dst` itself otherwise.
    pub fn first_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        match (self.subnet, self.gateway) {
            (Some(subnet), Some(gateway)) if is_unicast(dst) && !subnet.contains(dst) => gateway,
            _ => dst,
        }
    }
}

#[derive(Debug)]
pub enum Resolution<W> {
    /// Known right away; the waiter is handed back.
    Resolved(MacAddr, W),
    /// First waiter for `target`: broadcast a request and arm the timeout.
    Request { target: Ipv4Addr },
    /// A request for this address is already outstanding.
    Queued,
}

struct Pending<W> {
    waiters: Vec<W>,
    timer: Option<TimerId>,
}

pub struct ArpResolver<W> {
    cache: HashMap<Ipv4Addr, MacAddr>,
    pending: HashMap<Ipv4Addr, Pending<W>>,
}

impl<W> Default for ArpResolver<W> {
    fn default() -> Self {
        ArpResolver {
            cache: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl<W> ArpResolver<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.cache.get(&ip).copied()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_pending(&self, ip: Ipv4Addr) -> bool {
        self.pending.contains_key(&ip)
    }

    /// Map the next hop `target` to a hardware address, or queue `waiter` until it is known.
    ///
    /// `target` is resolved as given. Broadcast and multicast map to the broadcast MAC; our own
    /// address maps to our MAC. Only the first waiter for an address triggers a request.
    pub fn resolve(&mut self, target: Ipv4Addr, link: &LinkIdentity, waiter: W) -> Resolution<W> {
        if let Some(mac) = self.lookup(target) {
            return Resolution::Resolved(mac, waiter);
        }
        let directed_broadcast = link
            .subnet
            .is_some_and(|s| s.prefix_len < 31 && s.broadcast() == target);
        if !is_unicast(target) || directed_broadcast {
            return Resolution::Resolved(MacAddr::BROADCAST, waiter);
        }
        if target == link.addr || target.is_loopback() {
            return Resolution::Resolved(link.mac, waiter);
        }

        match self.pending.get_mut(&target) {
            Some(pending) => {
                pending.waiters.push(waiter);
                trace!(%target, waiters = pending.waiters.len(), "ARP resolution already pending");
                Resolution::Queued
            }
            None => {
                self.pending.insert(
                    target,
                    Pending {
                        waiters: vec![waiter],
                        timer: None,
                    },
                );
                debug!(%target, "ARP resolution started");
                Resolution::Request { target }
            }
        }
    }

    /// Remember the timeout armed for a pending resolution.
    pub fn arm(&mut self, target: Ipv4Addr, timer: TimerId) {
        if let Some(pending) = self.pending.get_mut(&target) {
            pending.timer = Some(timer);
        }
    }

    /// Record a mapping learned from the wire. Returns the released waiters and the timeout to
    /// cancel when a resolution was pending.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: MacAddr) -> Option<(Vec<W>, Option<TimerId>)> {
        if self.cache.insert(ip, mac) != Some(mac) {
            debug!(%ip, %mac, "ARP cache updated");
        }
        self.pending
            .remove(&ip)
            .map(|pending| (pending.waiters, pending.timer))
    }

    /// Give up on a pending resolution.
    pub fn expire(&mut self, ip: Ipv4Addr) -> Vec<W> {
        match self.pending.remove(&ip) {
            Some(pending) => {
                debug!(%ip, waiters = pending.waiters.len(), "ARP resolution timed out");
                pending.waiters
            }
            None => Vec::new(),
        }
    }
}
