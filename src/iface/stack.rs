//! The stack context: interfaces, routing, timers and the outbound frame queue.
//!
//! `Stack` owns every table and performs no I/O. A driver feeds received frames to
//! [`Stack::process_frame`], advances time with [`Stack::poll`] and writes whatever
//! [`Stack::dequeue_output`] yields to the matching link. Application callbacks receive
//! `&mut Stack` so they can send from inside a handler.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::app::dhcp::DhcpClient;
use crate::app::dns::DnsResolver;
use crate::config::{InterfaceConfig, InterfaceMode, StackConfig};
use crate::error::{Result, StackError};
use crate::iface::arp::Resolution;
use crate::iface::interface::NetworkInterface;
use crate::iface::tcp::TcpTable;
use crate::iface::udp::UdpTable;
use crate::network::addr::{MacAddr, Subnet};
use crate::network::arp::{ArpOperation, ArpPacket};
use crate::network::ethernet::{EtherType, EthernetHeader};
use crate::network::fragment::{fragment, Reassembler};
use crate::network::icmp::{IcmpHeader, ICMP_TYPE_ECHO_REQUEST};
use crate::network::ipv4::{flags, protocol, Ipv4Header};
use crate::network::route::{InterfaceId, NextHop, Route, RoutingTable, STATIC_SUBNETS};
use crate::time::{Millis, TimerId, TimerQueue};

pub type ArpCallback = Box<dyn FnOnce(&mut Stack, Option<MacAddr>)>;
pub type EchoHandler = Box<dyn FnMut(&mut Stack, EchoReply)>;

/// Something waiting for a hardware address.
pub(crate) enum ArpWaiter {
    /// A serialized IPv4 packet to frame and send.
    Packet(Vec<u8>),
    Callback(ArpCallback),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    ArpTimeout { iface: InterfaceId, ip: Ipv4Addr },
    FragmentSweep,
    TcpCycle,
    DhcpRetry(InterfaceId),
    DhcpRenew(InterfaceId),
    DnsTimeout(u16),
}

/// Per-packet overrides for [`Stack::send_ip`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub dont_fragment: bool,
    pub ttl: Option<u8>,
    /// Send out this interface instead of consulting the routing table.
    pub interface: Option<InterfaceId>,
    /// Source address; defaults to the outgoing interface's address.
    pub src_addr: Option<Ipv4Addr>,
}

/// An ICMP echo reply addressed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub src_addr: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    pub data: Vec<u8>,
}

pub struct Stack {
    pub(crate) config: StackConfig,
    pub(crate) now: Millis,
    pub(crate) rng: StdRng,
    pub(crate) interfaces: Vec<NetworkInterface>,
    routes: RoutingTable,
    pub(crate) reassembler: Reassembler,
    pub(crate) timers: TimerQueue<TimerEvent>,
    output: VecDeque<(InterfaceId, Vec<u8>)>,
    next_ip_id: u16,
    pub(crate) tcp: TcpTable,
    pub(crate) udp: UdpTable,
    echo_handler: Option<EchoHandler>,
    pub(crate) dhcp: HashMap<InterfaceId, DhcpClient>,
    pub(crate) dns: DnsResolver,
}

impl Stack {
    /// Create an empty stack at virtual time 0.
    pub fn new(config: StackConfig) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut timers = TimerQueue::new();
        timers.schedule(config.fragment_sweep_interval, TimerEvent::FragmentSweep);
        timers.schedule(config.tcp_tick, TimerEvent::TcpCycle);

        Stack {
            now: 0,
            next_ip_id: rng.gen(),
            rng,
            interfaces: Vec::new(),
            routes: RoutingTable::new(),
            reassembler: Reassembler::new(),
            timers,
            output: VecDeque::new(),
            tcp: TcpTable::default(),
            udp: UdpTable::default(),
            echo_handler: None,
            dhcp: HashMap::new(),
            dns: DnsResolver::default(),
            config,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Current virtual time.
    pub fn now(&self) -> Millis {
        self.now
    }

    /// Attach an interface. The first one also carries the static broadcast, multicast and
    /// link-local routes.
    pub fn add_interface(&mut self, config: InterfaceConfig) -> InterfaceId {
        let id = InterfaceId(self.interfaces.len());
        self.interfaces.push(NetworkInterface::new(id, &config));
        info!(iface = id.0, handshake = %config.to_handshake(), mac = %config.mac, "interface added");

        if id.0 == 0 {
            for subnet in STATIC_SUBNETS {
                self.routes.add(Route::on_link(subnet, id));
            }
        }
        if let Some(address) = config.address {
            self.routes.add(Route::on_link(address, id));
        }
        match (config.mode, config.gateway) {
            (_, Some(gateway)) => self.routes.add(Route::via(Subnet::new(Ipv4Addr::UNSPECIFIED, 0), gateway, id)),
            // Everything not on-link leaves through an IP-only tunnel.
            (InterfaceMode::Plain, None) => self.routes.add(Route::on_link(Subnet::new(Ipv4Addr::UNSPECIFIED, 0), id)),
            _ => {}
        }
        if config.mode == InterfaceMode::BridgedDhcp && config.address.is_none() {
            if let Err(err) = self.start_dhcp(id) {
                warn!(iface = id.0, %err, "could not start DHCP");
            }
        }
        id
    }

    pub fn interface(&self, id: InterfaceId) -> Result<&NetworkInterface> {
        self.interfaces
            .get(id.0)
            .ok_or(StackError::UnknownInterface(id.0))
    }

    pub(crate) fn interface_mut(&mut self, id: InterfaceId) -> Result<&mut NetworkInterface> {
        self.interfaces
            .get_mut(id.0)
            .ok_or(StackError::UnknownInterface(id.0))
    }

    pub fn interfaces(&self) -> &[NetworkInterface] {
        &self.interfaces
    }

    /// Set the interface address, keeping the prefix (a host route if none was set).
    pub fn set_ip(&mut self, id: InterfaceId, ip: Ipv4Addr) -> Result<()> {
        let prefix_len = self.interface(id)?.address.map_or(32, |a| a.prefix_len);
        self.configure_address(id, Some(Subnet::new(ip, prefix_len)))
    }

    /// Change the prefix length of a configured interface.
    pub fn set_subnet(&mut self, id: InterfaceId, prefix_len: u8) -> Result<()> {
        let ip = self.interface(id)?.local_addr();
        self.configure_address(id, Some(Subnet::new(ip, prefix_len.min(32))))
    }

    /// Replace the interface address and its on-link route.
    pub fn configure_address(&mut self, id: InterfaceId, address: Option<Subnet>) -> Result<()> {
        let iface = self.interface_mut(id)?;
        let old = std::mem::replace(&mut iface.address, address);
        if old == address {
            return Ok(());
        }
        if let Some(old) = old {
            self.routes.remove(old, Some(id));
        }
        if let Some(new) = address {
            self.routes.add(Route::on_link(new, id));
        }
        info!(iface = id.0, old = ?old, new = ?address, "interface address changed");
        Ok(())
    }

    /// Set or clear the default gateway reached through `id`.
    pub fn set_gateway(&mut self, id: InterfaceId, gateway: Option<Ipv4Addr>) -> Result<()> {
        self.interface_mut(id)?.gateway = gateway;
        let default = Subnet::new(Ipv4Addr::UNSPECIFIED, 0);
        self.routes.remove(default, Some(id));
        if let Some(gateway) = gateway {
            self.routes.add(Route::via(default, gateway, id));
        }
        Ok(())
    }

    pub fn add_route(&mut self, route: Route) -> Result<()> {
        self.interface(route.interface)?;
        self.routes.add(route);
        Ok(())
    }

    pub fn remove_route(&mut self, subnet: Subnet, interface: Option<InterfaceId>) -> usize {
        self.routes.remove(subnet, interface)
    }

    pub fn routes(&self) -> &[Route] {
        self.routes.routes()
    }

    /// Longest-prefix lookup.
    pub fn route(&self, dst: Ipv4Addr) -> Result<NextHop> {
        self.routes.lookup(dst).ok_or(StackError::NoRoute(dst))
    }

    /// Source address the stack uses toward `dst`.
    pub(crate) fn source_addr_for(&self, dst: Ipv4Addr, interface: Option<InterfaceId>) -> Result<Ipv4Addr> {
        let id = match interface {
            Some(id) => id,
            None => self.route(dst)?.interface,
        };
        Ok(self.interface(id)?.local_addr())
    }

    /// Hand one received frame to the stack.
    pub fn process_frame(&mut self, id: InterfaceId, frame: &[u8]) {
        let Some(iface) = self.interfaces.get(id.0) else {
            warn!(iface = id.0, "frame for unknown interface");
            return;
        };
        if !iface.mode.is_ethernet() {
            self.process_ipv4_packet(id, frame);
            return;
        }

        let header = match EthernetHeader::from_bytes(frame) {
            Ok(header) => header,
            Err(err) => {
                debug!(iface = id.0, %err, "dropping malformed Ethernet frame");
                return;
            }
        };
        if header.dst != iface.mac && !header.dst.is_broadcast() && !header.dst.is_multicast() {
            trace!(iface = id.0, dst = %header.dst, "frame not addressed to us");
            return;
        }
        let payload = &frame[crate::network::ethernet::ETHERNET_HEADER_LEN..];
        match header.ethertype {
            EtherType::Arp => self.process_arp(id, payload),
            EtherType::Ipv4 => self.process_ipv4_packet(id, payload),
            EtherType::Other(ethertype) => trace!(iface = id.0, ethertype, "ignoring frame"),
        }
    }

    /// Advance the clock to `now` and run every timer that has come due.
    pub fn poll(&mut self, now: Millis) {
        if now > self.now {
            self.now = now;
        }
        while let Some(event) = self.timers.pop_due(self.now) {
            self.handle_timer(event);
        }
    }

    /// When the next timer fires; drivers can sleep until then.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    /// Next frame to write to a link.
    pub fn dequeue_output(&mut self) -> Option<(InterfaceId, Vec<u8>)> {
        self.output.pop_front()
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    pub(crate) fn requeue_output(&mut self, id: InterfaceId, frame: Vec<u8>) {
        self.output.push_back((id, frame));
    }

    pub(crate) fn schedule(&mut self, after: Millis, event: TimerEvent) -> TimerId {
        self.timers.schedule(self.now + after, event)
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        trace!(now = self.now, ?event, "timer fired");
        match event {
            TimerEvent::ArpTimeout { iface, ip } => {
                let waiters = match self.interfaces.get_mut(iface.0) {
                    Some(iface) => iface.arp.expire(ip),
                    None => Vec::new(),
                };
                self.release_arp_waiters(iface, waiters, None);
            }
            TimerEvent::FragmentSweep => {
                self.reassembler.sweep(self.now, self.config.fragment_max_age);
                self.schedule(self.config.fragment_sweep_interval, TimerEvent::FragmentSweep);
            }
            TimerEvent::TcpCycle => {
                self.tcp_cycle();
                self.schedule(self.config.tcp_tick, TimerEvent::TcpCycle);
            }
            TimerEvent::DhcpRetry(iface) => self.dhcp_retry(iface),
            TimerEvent::DhcpRenew(iface) => self.dhcp_renew(iface),
            TimerEvent::DnsTimeout(id) => self.dns_timeout(id),
        }
    }

    /// Send `payload` as one or more IPv4 packets.
    ///
    /// Routes the destination (unless an interface is forced), fragments to the interface MTU
    /// and, on Ethernet links, resolves the next hop before framing.
    pub fn send_ip(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8], options: SendOptions) -> Result<()> {
        let hop = match options.interface {
            Some(id) => {
                let link = self.interface(id)?.link_identity();
                let addr = link.first_hop(dst);
                NextHop {
                    addr,
                    gateway: (addr != dst).then_some(addr),
                    interface: id,
                }
            }
            None => self.route(dst)?,
        };
        let iface = self.interface(hop.interface)?;
        let src = options.src_addr.unwrap_or_else(|| iface.local_addr());
        let mtu = iface.mtu;

        let mut header = Ipv4Header::new(protocol, src, dst, payload.len());
        header.id = self.next_ip_id;
        self.next_ip_id = self.next_ip_id.wrapping_add(1);
        header.ttl = options.ttl.unwrap_or(self.config.default_ttl);
        if options.dont_fragment {
            header.flags_frag_offset |= flags::DONT_FRAGMENT;
        }

        for packet in fragment(&header, payload, mtu)? {
            self.transmit_ip(hop.interface, hop.addr, packet);
        }
        trace!(%src, %dst, protocol, len = payload.len(), iface = hop.interface.0, "IPv4 packet queued");
        Ok(())
    }

    /// Send an ICMP echo request.
    pub fn ping(&mut self, dst: Ipv4Addr, identifier: u16, sequence: u16, data: &[u8]) -> Result<()> {
        let message = IcmpHeader::echo(ICMP_TYPE_ECHO_REQUEST, identifier, sequence).message(data);
        self.send_ip(dst, protocol::ICMP, &message, SendOptions::default())
    }

    /// Register the handler for echo replies, replacing any previous one.
    pub fn on_echo_reply<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Stack, EchoReply) + 'static,
    {
        self.echo_handler = Some(Box::new(handler));
    }

    pub(crate) fn deliver_echo_reply(&mut self, reply: EchoReply) {
        let Some(mut handler) = self.echo_handler.take() else {
            debug!(src = %reply.src_addr, "echo reply without handler");
            return;
        };
        handler(self, reply);
        if self.echo_handler.is_none() {
            self.echo_handler = Some(handler);
        }
    }

    /// Resolve `ip` to a hardware address on `id`. The callback gets `None` after the ARP
    /// timeout, or right away on an IP-only interface.
    pub fn resolve_hardware<F>(&mut self, id: InterfaceId, ip: Ipv4Addr, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Stack, Option<MacAddr>) + 'static,
    {
        let iface = self.interface(id)?;
        if !iface.mode.is_ethernet() {
            callback(self, None);
            return Ok(());
        }
        let target = iface.link_identity().first_hop(ip);
        self.resolve_with(id, target, ArpWaiter::Callback(Box::new(callback)));
        Ok(())
    }

    /// `next_hop` comes from the routing table and is resolved without further rewriting.
    fn transmit_ip(&mut self, id: InterfaceId, next_hop: Ipv4Addr, packet: Vec<u8>) {
        if self.interfaces[id.0].mode.is_ethernet() {
            self.resolve_with(id, next_hop, ArpWaiter::Packet(packet));
        } else {
            self.output.push_back((id, packet));
        }
    }

    fn resolve_with(&mut self, id: InterfaceId, ip: Ipv4Addr, waiter: ArpWaiter) {
        let iface = &mut self.interfaces[id.0];
        let link = iface.link_identity();
        match iface.arp.resolve(ip, &link, waiter) {
            Resolution::Resolved(mac, waiter) => self.release_arp_waiters(id, vec![waiter], Some(mac)),
            Resolution::Request { target } => {
                let request = ArpPacket::request(link.mac, link.addr, target);
                self.emit_ethernet(id, MacAddr::BROADCAST, EtherType::Arp, &request.to_bytes());
                let timer = self.schedule(self.config.arp_timeout, TimerEvent::ArpTimeout { iface: id, ip: target });
                self.interfaces[id.0].arp.arm(target, timer);
            }
            Resolution::Queued => {}
        }
    }

    fn release_arp_waiters(&mut self, id: InterfaceId, waiters: Vec<ArpWaiter>, mac: Option<MacAddr>) {
        for waiter in waiters {
            match (waiter, mac) {
                (ArpWaiter::Packet(packet), Some(mac)) => self.emit_ethernet(id, mac, EtherType::Ipv4, &packet),
                (ArpWaiter::Packet(packet), None) => {
                    debug!(iface = id.0, len = packet.len(), "dropping packet: next hop unresolved")
                }
                (ArpWaiter::Callback(callback), mac) => callback(self, mac),
            }
        }
    }

    fn process_arp(&mut self, id: InterfaceId, payload: &[u8]) {
        let packet = match ArpPacket::from_bytes(payload) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(iface = id.0, %err, "dropping malformed ARP packet");
                return;
            }
        };
        let iface = &self.interfaces[id.0];
        let (our_mac, our_ip, configured) = (iface.mac, iface.local_addr(), iface.is_configured());

        match packet.operation {
            ArpOperation::Reply => self.learn_hardware(id, packet.sender_ip, packet.sender_mac),
            ArpOperation::Request if configured && packet.target_ip == our_ip => {
                self.learn_hardware(id, packet.sender_ip, packet.sender_mac);
                let reply = ArpPacket::reply_to(&packet, our_mac);
                self.emit_ethernet(id, packet.sender_mac, EtherType::Arp, &reply.to_bytes());
                debug!(iface = id.0, asker = %packet.sender_ip, "answered ARP request");
            }
            ArpOperation::Request => trace!(iface = id.0, target = %packet.target_ip, "ARP request for another host"),
        }
    }

    fn learn_hardware(&mut self, id: InterfaceId, ip: Ipv4Addr, mac: MacAddr) {
        if let Some((waiters, timer)) = self.interfaces[id.0].arp.learn(ip, mac) {
            if let Some(timer) = timer {
                self.timers.cancel(timer);
            }
            self.release_arp_waiters(id, waiters, Some(mac));
        }
    }

    fn emit_ethernet(&mut self, id: InterfaceId, dst: MacAddr, ethertype: EtherType, payload: &[u8]) {
        let header = EthernetHeader {
            dst,
            src: self.interfaces[id.0].mac,
            ethertype,
        };
        self.output.push_back((id, header.frame(payload)));
    }
}

/// Ephemeral range used for outgoing TCP connections and unbound UDP listeners.
pub(crate) const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Pick a random unused ephemeral port, falling back to a scan when the range is crowded.
pub(crate) fn pick_ephemeral_port(rng: &mut StdRng, in_use: impl Fn(u16) -> bool) -> Result<u16> {
    for _ in 0..64 {
        let port = rng.gen_range(EPHEMERAL_PORTS);
        if !in_use(port) {
            return Ok(port);
        }
    }
    EPHEMERAL_PORTS
        .find(|port| !in_use(*port))
        .ok_or(StackError::NoFreePort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ethernet::ETHERNET_HEADER_LEN;

    const OUR_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const PEER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
    const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

    fn bridged() -> (Stack, InterfaceId) {
        let mut stack = Stack::new(StackConfig {
            rng_seed: Some(7),
            ..StackConfig::default()
        });
        let id = stack.add_interface(
            InterfaceConfig::new(InterfaceMode::Bridged, OUR_MAC)
                .with_address(Subnet::new(OUR_IP, 24))
                .with_gateway(Ipv4Addr::new(10, 0, 0, 1)),
        );
        (stack, id)
    }

    fn arp_frame(packet: &ArpPacket, dst: MacAddr) -> Vec<u8> {
        EthernetHeader {
            dst,
            src: packet.sender_mac,
            ethertype: EtherType::Arp,
        }
        .frame(&packet.to_bytes())
    }

    fn drain(stack: &mut Stack) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| stack.dequeue_output().map(|(_, frame)| frame)).collect()
    }

    #[test]
    fn answers_arp_requests_for_our_address() {
        let (mut stack, id) = bridged();
        let request = ArpPacket::request(PEER_MAC, PEER_IP, OUR_IP);
        stack.process_frame(id, &arp_frame(&request, MacAddr::BROADCAST));

        let frames = drain(&mut stack);
        assert_eq!(frames.len(), 1);
        let reply = ArpPacket::from_bytes(&frames[0][ETHERNET_HEADER_LEN..]).unwrap();
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.sender_mac, OUR_MAC);
        assert_eq!(reply.target_ip, PEER_IP);

        let other = ArpPacket::request(PEER_MAC, PEER_IP, Ipv4Addr::new(10, 0, 0, 99));
        stack.process_frame(id, &arp_frame(&other, MacAddr::BROADCAST));
        assert!(drain(&mut stack).is_empty());
    }

    #[test]
    fn queued_packet_leaves_after_arp_reply() {
        let (mut stack, id) = bridged();
        stack.send_ip(PEER_IP, protocol::UDP, b"payload", SendOptions::default()).unwrap();
        let frames = drain(&mut stack);
        assert_eq!(frames.len(), 1);
        let header = EthernetHeader::from_bytes(&frames[0]).unwrap();
        assert_eq!(header.ethertype, EtherType::Arp);
        assert_eq!(header.dst, MacAddr::BROADCAST);

        let reply = ArpPacket::reply_to(&ArpPacket::request(OUR_MAC, OUR_IP, PEER_IP), PEER_MAC);
        stack.process_frame(id, &arp_frame(&reply, OUR_MAC));
        let frames = drain(&mut stack);
        assert_eq!(frames.len(), 1);
        let header = EthernetHeader::from_bytes(&frames[0]).unwrap();
        assert_eq!(header.dst, PEER_MAC);
        assert_eq!(header.ethertype, EtherType::Ipv4);
    }

    #[test]
    fn resolve_callback_times_out() {
        let (mut stack, id) = bridged();
        let result = std::rc::Rc::new(std::cell::Cell::new(Some(OUR_MAC)));
        let seen = result.clone();
        stack
            .resolve_hardware(id, PEER_IP, move |_, mac| seen.set(mac))
            .unwrap();
        stack.poll(9_999);
        assert_eq!(result.get(), Some(OUR_MAC));
        stack.poll(10_000);
        assert_eq!(result.get(), None);
    }

    #[test]
    fn set_ip_moves_on_link_route() {
        let (mut stack, id) = bridged();
        stack.set_ip(id, Ipv4Addr::new(172, 16, 0, 5)).unwrap();
        stack.set_subnet(id, 16).unwrap();
        assert_eq!(stack.route(Ipv4Addr::new(172, 16, 9, 9)).unwrap().gateway, None);
        assert_eq!(
            stack.route(Ipv4Addr::new(10, 0, 0, 3)).unwrap().gateway,
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert!(matches!(stack.set_ip(InterfaceId(5), OUR_IP), Err(StackError::UnknownInterface(5))));
    }

    #[test]
    fn frames_for_other_hosts_are_ignored() {
        let (mut stack, id) = bridged();
        let request = ArpPacket::request(PEER_MAC, PEER_IP, OUR_IP);
        stack.process_frame(id, &arp_frame(&request, MacAddr([0x02, 9, 9, 9, 9, 9])));
        assert_eq!(stack.pending_output(), 0);
    }

    #[test]
    fn ephemeral_ports_skip_used_ones() {
        let mut rng = StdRng::seed_from_u64(1);
        let port = pick_ephemeral_port(&mut rng, |p| p != 65535).unwrap();
        assert_eq!(port, 65535);
        assert!(pick_ephemeral_port(&mut rng, |_| true).is_err());
    }
}
