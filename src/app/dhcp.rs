//! DHCP client (RFC 2131) with classless static routes (RFC 3442).
//!
//! One negotiator per interface. DISCOVER is retried every few seconds with a growing `secs`
//! field until an OFFER arrives; the REQUEST that follows either binds the lease (address,
//! prefix, routes and DNS servers are installed) or, on NAK or silence, restarts from scratch.
//! Renewal starts at half the lease lifetime with a unicast REQUEST to the leasing server.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::error::{ensure_len, Result, WireError};
use crate::iface::stack::{SendOptions, Stack, TimerEvent};
use crate::network::addr::{mask_to_prefix, read_ipv4, MacAddr, Subnet};
use crate::network::route::{InterfaceId, Route};
use crate::time::{Millis, TimerId};
use crate::transport::udp::UdpDatagram;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

const HTYPE_ETHERNET: u8 = 1;
const COOKIE_OFFSET: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const OPTIONS_OFFSET: usize = COOKIE_OFFSET + 4;
const FLAG_BROADCAST: u16 = 0x8000;
const INFINITE_LEASE: u32 = u32::MAX;
/// Prefix assumed when the server sends no subnet mask.
const FALLBACK_PREFIX: u8 = 24;

/// DHCP option codes (RFC 2132)
pub mod option {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVERS: u8 = 6;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST: u8 = 55;
    pub const CLASSLESS_ROUTES: u8 = 121;
    pub const END: u8 = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => DhcpMessageType::Discover,
            2 => DhcpMessageType::Offer,
            3 => DhcpMessageType::Request,
            4 => DhcpMessageType::Decline,
            5 => DhcpMessageType::Ack,
            6 => DhcpMessageType::Nak,
            7 => DhcpMessageType::Release,
            8 => DhcpMessageType::Inform,
            _ => return None,
        })
    }
}

/// A destination reached through `router` (0.0.0.0 means on-link).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClasslessRoute {
    pub subnet: Subnet,
    pub router: Ipv4Addr,
}

/// BOOTP/DHCP message. Options are kept raw, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub options: Vec<(u8, Vec<u8>)>,
}

impl DhcpMessage {
    pub fn new(op: u8, xid: u32, chaddr: MacAddr) -> Self {
        DhcpMessage {
            op,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, code: u8, value: impl Into<Vec<u8>>) -> Self {
        self.options.push((code, value.into()));
        self
    }

    /// Parse a message, requiring the magic cookie and an END-terminated option list.
    pub fn parse(data: &[u8]) -> std::result::Result<Self, WireError> {
        ensure_len(data, OPTIONS_OFFSET)?;
        if data[COOKIE_OFFSET..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(WireError::Malformed("DHCP magic cookie"));
        }

        let mut options = Vec::new();
        let mut pos = OPTIONS_OFFSET;
        loop {
            let Some(&code) = data.get(pos) else {
                return Err(WireError::Malformed("DHCP options not terminated"));
            };
            match code {
                option::PAD => pos += 1,
                option::END => break,
                _ => {
                    ensure_len(data, pos + 2)?;
                    let len = data[pos + 1] as usize;
                    ensure_len(data, pos + 2 + len)?;
                    options.push((code, data[pos + 2..pos + 2 + len].to_vec()));
                    pos += 2 + len;
                }
            }
        }

        Ok(DhcpMessage {
            op: data[0],
            xid: BigEndian::read_u32(&data[4..8]),
            secs: BigEndian::read_u16(&data[8..10]),
            flags: BigEndian::read_u16(&data[10..12]),
            ciaddr: read_ipv4(&data[12..16]),
            yiaddr: read_ipv4(&data[16..20]),
            siaddr: read_ipv4(&data[20..24]),
            giaddr: read_ipv4(&data[24..28]),
            chaddr: MacAddr::from_bytes(&data[28..34]).ok_or(WireError::Malformed("DHCP chaddr"))?,
            options,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; OPTIONS_OFFSET];
        bytes[0] = self.op;
        bytes[1] = HTYPE_ETHERNET;
        bytes[2] = 6;
        BigEndian::write_u32(&mut bytes[4..8], self.xid);
        BigEndian::write_u16(&mut bytes[8..10], self.secs);
        BigEndian::write_u16(&mut bytes[10..12], self.flags);
        bytes[12..16].copy_from_slice(&self.ciaddr.octets());
        bytes[16..20].copy_from_slice(&self.yiaddr.octets());
        bytes[20..24].copy_from_slice(&self.siaddr.octets());
        bytes[24..28].copy_from_slice(&self.giaddr.octets());
        bytes[28..34].copy_from_slice(&self.chaddr.octets());
        bytes[COOKIE_OFFSET..OPTIONS_OFFSET].copy_from_slice(&MAGIC_COOKIE);
        for (code, value) in &self.options {
            bytes.push(*code);
            bytes.push(value.len() as u8);
            bytes.extend_from_slice(value);
        }
        bytes.push(option::END);
        bytes
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, value)| value.as_slice())
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.option(option::MESSAGE_TYPE)
            .and_then(|v| v.first().copied())
            .and_then(DhcpMessageType::from_u8)
    }

    fn addr_option(&self, code: u8) -> Option<Ipv4Addr> {
        self.option(code).filter(|v| v.len() >= 4).map(read_ipv4)
    }

    fn addr_list_option(&self, code: u8) -> Vec<Ipv4Addr> {
        self.option(code)
            .map(|v| v.chunks_exact(4).map(read_ipv4).collect())
            .unwrap_or_default()
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.addr_option(option::SUBNET_MASK)
    }

    pub fn routers(&self) -> Vec<Ipv4Addr> {
        self.addr_list_option(option::ROUTER)
    }

    pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
        self.addr_list_option(option::DNS_SERVERS)
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.addr_option(option::SERVER_ID)
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.option(option::LEASE_TIME)
            .filter(|v| v.len() >= 4)
            .map(BigEndian::read_u32)
    }

    pub fn classless_routes(&self) -> std::result::Result<Vec<ClasslessRoute>, WireError> {
        self.option(option::CLASSLESS_ROUTES)
            .map(parse_classless_routes)
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Decode option 121: width, significant destination octets, router.
pub fn parse_classless_routes(mut data: &[u8]) -> std::result::Result<Vec<ClasslessRoute>, WireError> {
    let mut routes = Vec::new();
    while let Some(&width) = data.first() {
        if width > 32 {
            return Err(WireError::Malformed("classless route prefix above 32"));
        }
        let significant = (width as usize).div_ceil(8);
        ensure_len(data, 1 + significant + 4)?;
        let mut dest = [0u8; 4];
        dest[..significant].copy_from_slice(&data[1..1 + significant]);
        routes.push(ClasslessRoute {
            subnet: Subnet::new(Ipv4Addr::from(dest), width).network(),
            router: read_ipv4(&data[1 + significant..]),
        });
        data = &data[1 + significant + 4..];
    }
    Ok(routes)
}

pub fn encode_classless_routes(routes: &[ClasslessRoute]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for route in routes {
        let significant = (route.subnet.prefix_len as usize).div_ceil(8);
        bytes.push(route.subnet.prefix_len);
        bytes.extend_from_slice(&route.subnet.addr.octets()[..significant]);
        bytes.extend_from_slice(&route.router.octets());
    }
    bytes
}

/// Configuration granted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub routes: Vec<ClasslessRoute>,
    pub server: Ipv4Addr,
    pub lease_secs: u32,
}

impl DhcpLease {
    fn from_ack(ack: &DhcpMessage, server: Ipv4Addr) -> Self {
        let routes = ack.classless_routes().unwrap_or_else(|err| {
            debug!(%err, "ignoring malformed classless routes");
            Vec::new()
        });
        DhcpLease {
            address: ack.yiaddr,
            prefix_len: ack.subnet_mask().map_or(FALLBACK_PREFIX, mask_to_prefix),
            gateway: ack.routers().first().copied(),
            dns_servers: ack.dns_servers(),
            routes,
            server: ack.server_id().unwrap_or(server),
            lease_secs: ack.lease_time().unwrap_or(INFINITE_LEASE),
        }
    }

    /// Routes to install: option 121 takes precedence over the router option.
    fn routes_for(&self, id: InterfaceId) -> Vec<Route> {
        if !self.routes.is_empty() {
            return self
                .routes
                .iter()
                .map(|r| {
                    if r.router.is_unspecified() {
                        Route::on_link(r.subnet, id)
                    } else {
                        Route::via(r.subnet, r.router, id)
                    }
                })
                .collect();
        }
        self.gateway
            .map(|gw| Route::via(Subnet::new(Ipv4Addr::UNSPECIFIED, 0), gw, id))
            .into_iter()
            .collect()
    }

    fn default_router(&self) -> Option<Ipv4Addr> {
        if self.routes.is_empty() {
            return self.gateway;
        }
        self.routes
            .iter()
            .find(|r| r.subnet.prefix_len == 0 && !r.router.is_unspecified())
            .map(|r| r.router)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    /// DISCOVER sent, waiting for an OFFER.
    Selecting,
    /// REQUEST sent for an offered address.
    Requesting { offered: Ipv4Addr, server: Ipv4Addr },
    Bound,
    /// Unicast REQUEST sent to extend the lease.
    Renewing { expires_at: Millis },
}

pub type DhcpCallback = Box<dyn FnOnce(&mut Stack, DhcpLease)>;

pub(crate) struct DhcpClient {
    state: DhcpState,
    xid: u32,
    secs: u16,
    lease: Option<DhcpLease>,
    bound_at: Millis,
    retry_timer: Option<TimerId>,
    renew_timer: Option<TimerId>,
    installed: Vec<Route>,
    on_bound: Option<DhcpCallback>,
}

impl DhcpClient {
    fn new(on_bound: Option<DhcpCallback>) -> Self {
        DhcpClient {
            state: DhcpState::Selecting,
            xid: 0,
            secs: 0,
            lease: None,
            bound_at: 0,
            retry_timer: None,
            renew_timer: None,
            installed: Vec::new(),
            on_bound,
        }
    }
}

const REQUESTED_PARAMETERS: [u8; 6] = [
    option::SUBNET_MASK,
    option::ROUTER,
    option::DNS_SERVERS,
    option::LEASE_TIME,
    option::SERVER_ID,
    option::CLASSLESS_ROUTES,
];

impl Stack {
    /// Start (or restart) DHCP negotiation on an interface.
    pub fn start_dhcp(&mut self, id: InterfaceId) -> Result<()> {
        self.start_dhcp_inner(id, None)
    }

    /// Like [`Stack::start_dhcp`]; `on_bound` runs once the first lease is installed.
    pub fn start_dhcp_then<F>(&mut self, id: InterfaceId, on_bound: F) -> Result<()>
    where
        F: FnOnce(&mut Stack, DhcpLease) + 'static,
    {
        self.start_dhcp_inner(id, Some(Box::new(on_bound)))
    }

    fn start_dhcp_inner(&mut self, id: InterfaceId, on_bound: Option<DhcpCallback>) -> Result<()> {
        self.interface(id)?;
        if !self.udp.is_bound(DHCP_CLIENT_PORT) {
            self.udp_listen(DHCP_CLIENT_PORT, |stack, datagram| stack.handle_dhcp(datagram))?;
        }
        if let Some(old) = self.dhcp.insert(id, DhcpClient::new(on_bound)) {
            self.cancel_dhcp_timers(&old);
            self.uninstall_routes(old.installed);
        }
        info!(iface = id.0, "DHCP negotiation started");
        self.dhcp_discover(id);
        Ok(())
    }

    pub fn dhcp_state(&self, id: InterfaceId) -> Option<DhcpState> {
        self.dhcp.get(&id).map(|client| client.state)
    }

    pub fn dhcp_lease(&self, id: InterfaceId) -> Option<&DhcpLease> {
        self.dhcp.get(&id).and_then(|client| client.lease.as_ref())
    }

    /// Fresh transaction: drop whatever the old lease installed and broadcast DISCOVER.
    fn dhcp_discover(&mut self, id: InterfaceId) {
        let xid = self.rng.gen();
        let Some(client) = self.dhcp.get_mut(&id) else {
            return;
        };
        client.state = DhcpState::Selecting;
        client.xid = xid;
        client.secs = 0;
        let had_lease = client.lease.take().is_some();
        let installed = std::mem::take(&mut client.installed);
        if let Some(timer) = client.renew_timer.take() {
            self.timers.cancel(timer);
        }
        self.uninstall_routes(installed);
        if had_lease {
            if let Err(err) = self.configure_address(id, None) {
                warn!(iface = id.0, %err, "could not clear leased address");
            }
        }
        debug!(iface = id.0, xid, "DHCP -> SELECTING");
        self.send_dhcp(id, DhcpMessageType::Discover);
        self.arm_dhcp_retry(id);
    }

    fn send_dhcp(&mut self, id: InterfaceId, kind: DhcpMessageType) {
        let Some(client) = self.dhcp.get(&id) else {
            return;
        };
        let Ok(iface) = self.interface(id) else {
            return;
        };

        let mut message = DhcpMessage::new(BOOTREQUEST, client.xid, iface.mac)
            .with_option(option::MESSAGE_TYPE, [kind as u8])
            .with_option(option::PARAMETER_REQUEST, REQUESTED_PARAMETERS);
        message.secs = client.secs;
        message.flags = FLAG_BROADCAST;

        let (src, dst) = match (client.state, client.lease.as_ref()) {
            (DhcpState::Requesting { offered, server }, _) => {
                message = message
                    .with_option(option::REQUESTED_IP, offered.octets())
                    .with_option(option::SERVER_ID, server.octets());
                (Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST)
            }
            (DhcpState::Renewing { .. }, Some(lease)) => {
                message.ciaddr = lease.address;
                message.flags = 0;
                (lease.address, lease.server)
            }
            _ => (Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST),
        };

        let options = SendOptions {
            interface: Some(id),
            src_addr: Some(src),
            ..SendOptions::default()
        };
        let bytes = message.to_bytes();
        match self.udp_send_with(DHCP_CLIENT_PORT, dst, DHCP_SERVER_PORT, &bytes, options) {
            Ok(()) => trace!(iface = id.0, ?kind, %dst, "DHCP message sent"),
            Err(err) => warn!(iface = id.0, ?kind, %err, "could not send DHCP message"),
        }
    }

    fn arm_dhcp_retry(&mut self, id: InterfaceId) {
        let timer = self.schedule(self.config.dhcp_retry_interval, TimerEvent::DhcpRetry(id));
        if let Some(client) = self.dhcp.get_mut(&id) {
            if let Some(old) = client.retry_timer.replace(timer) {
                self.timers.cancel(old);
            }
        }
    }

    fn cancel_dhcp_timers(&mut self, client: &DhcpClient) {
        for timer in [client.retry_timer, client.renew_timer].into_iter().flatten() {
            self.timers.cancel(timer);
        }
    }

    fn uninstall_routes(&mut self, routes: Vec<Route>) {
        for route in routes {
            self.remove_route(route.subnet, Some(route.interface));
        }
    }

    pub(crate) fn dhcp_retry(&mut self, id: InterfaceId) {
        let step = (self.config.dhcp_retry_interval / 1000) as u16;
        let now = self.now;
        let Some(client) = self.dhcp.get_mut(&id) else {
            return;
        };
        client.retry_timer = None;
        match client.state {
            DhcpState::Selecting => {
                client.secs = client.secs.saturating_add(step);
                debug!(iface = id.0, secs = client.secs, "DHCP DISCOVER retry");
                self.send_dhcp(id, DhcpMessageType::Discover);
                self.arm_dhcp_retry(id);
            }
            DhcpState::Requesting { .. } => {
                warn!(iface = id.0, "no answer to DHCP REQUEST, restarting");
                self.dhcp_discover(id);
            }
            DhcpState::Renewing { expires_at } if now >= expires_at => {
                warn!(iface = id.0, "DHCP lease expired without renewal, restarting");
                self.dhcp_discover(id);
            }
            DhcpState::Renewing { .. } => {
                client.secs = client.secs.saturating_add(step);
                self.send_dhcp(id, DhcpMessageType::Request);
                self.arm_dhcp_retry(id);
            }
            DhcpState::Bound => {}
        }
    }

    pub(crate) fn dhcp_renew(&mut self, id: InterfaceId) {
        let xid = self.rng.gen();
        let now = self.now;
        let Some(client) = self.dhcp.get_mut(&id) else {
            return;
        };
        client.renew_timer = None;
        let (DhcpState::Bound, Some(lease)) = (client.state, client.lease.as_ref()) else {
            return;
        };
        let expires_at = client.bound_at + lease.lease_secs as Millis * 1000;
        client.state = DhcpState::Renewing {
            expires_at: expires_at.max(now),
        };
        client.xid = xid;
        client.secs = 0;
        debug!(iface = id.0, xid, "DHCP -> RENEWING");
        self.send_dhcp(id, DhcpMessageType::Request);
        self.arm_dhcp_retry(id);
    }

    pub(crate) fn handle_dhcp(&mut self, datagram: UdpDatagram) {
        let id = datagram.interface;
        let message = match DhcpMessage::parse(&datagram.data) {
            Ok(message) => message,
            Err(err) => {
                debug!(iface = id.0, %err, "dropping malformed DHCP message");
                return;
            }
        };
        let Some(client) = self.dhcp.get(&id) else {
            return;
        };
        let Ok(iface) = self.interface(id) else {
            return;
        };
        if message.op != BOOTREPLY || message.xid != client.xid || message.chaddr != iface.mac {
            trace!(iface = id.0, xid = message.xid, "ignoring DHCP message for another transaction");
            return;
        }

        match (message.message_type(), client.state) {
            (Some(DhcpMessageType::Offer), DhcpState::Selecting) => {
                let server = message.server_id().unwrap_or(datagram.src_addr);
                debug!(iface = id.0, offered = %message.yiaddr, %server, "DHCP offer, -> REQUESTING");
                if let Some(client) = self.dhcp.get_mut(&id) {
                    client.state = DhcpState::Requesting {
                        offered: message.yiaddr,
                        server,
                    };
                }
                self.send_dhcp(id, DhcpMessageType::Request);
                self.arm_dhcp_retry(id);
            }
            (Some(DhcpMessageType::Ack), DhcpState::Requesting { server, .. }) => {
                self.bind_lease(id, &message, server)
            }
            (Some(DhcpMessageType::Ack), DhcpState::Renewing { .. }) => {
                let server = client.lease.as_ref().map_or(datagram.src_addr, |l| l.server);
                self.bind_lease(id, &message, server)
            }
            (Some(DhcpMessageType::Nak), DhcpState::Requesting { .. } | DhcpState::Renewing { .. }) => {
                warn!(iface = id.0, "DHCP NAK, restarting");
                self.dhcp_discover(id);
            }
            (kind, state) => trace!(iface = id.0, ?kind, ?state, "unexpected DHCP message"),
        }
    }

    fn bind_lease(&mut self, id: InterfaceId, ack: &DhcpMessage, server: Ipv4Addr) {
        let lease = DhcpLease::from_ack(ack, server);
        let Some(client) = self.dhcp.get_mut(&id) else {
            return;
        };
        let old_routes = std::mem::take(&mut client.installed);
        let timers = [client.retry_timer.take(), client.renew_timer.take()];
        for timer in timers.into_iter().flatten() {
            self.timers.cancel(timer);
        }
        self.uninstall_routes(old_routes);

        if let Err(err) = self.configure_address(id, Some(Subnet::new(lease.address, lease.prefix_len))) {
            warn!(iface = id.0, %err, "could not install leased address");
            return;
        }
        let routes = lease.routes_for(id);
        for route in &routes {
            self.install_route(*route);
        }
        if let Ok(iface) = self.interface_mut(id) {
            iface.gateway = lease.default_router();
        }
        if !lease.dns_servers.is_empty() {
            self.set_dns_servers(lease.dns_servers.clone());
        }
        let renew_timer = (lease.lease_secs != INFINITE_LEASE)
            .then(|| self.schedule(lease.lease_secs as Millis * 500, TimerEvent::DhcpRenew(id)));

        info!(
            iface = id.0,
            address = %lease.address,
            prefix = lease.prefix_len,
            gateway = ?lease.gateway,
            lease_secs = lease.lease_secs,
            "DHCP lease bound"
        );
        let now = self.now;
        let Some(client) = self.dhcp.get_mut(&id) else {
            return;
        };
        client.state = DhcpState::Bound;
        client.bound_at = now;
        client.installed = routes;
        client.renew_timer = renew_timer;
        client.lease = Some(lease.clone());
        if let Some(on_bound) = client.on_bound.take() {
            on_bound(self, lease);
        }
    }

    fn install_route(&mut self, route: Route) {
        if let Err(err) = self.add_route(route) {
            warn!(%err, "could not install DHCP route");
        }
    }
}
