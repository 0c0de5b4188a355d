//! UDP listeners and sending.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;

use tracing::{debug, info, trace, warn};

use crate::error::{Result, StackError};
use crate::iface::stack::{pick_ephemeral_port, SendOptions, Stack};
use crate::network::ipv4::{protocol, Ipv4Header};
use crate::network::route::InterfaceId;
use crate::transport::udp::{build_datagram, parse_datagram, UdpDatagram};

type UdpHandler = Rc<RefCell<dyn FnMut(&mut Stack, UdpDatagram)>>;

#[derive(Default)]
pub(crate) struct UdpTable {
    listeners: HashMap<u16, UdpHandler>,
}

impl UdpTable {
    pub(crate) fn is_bound(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }
}

impl Stack {
    /// Bind `port` and deliver every datagram for it to `handler`. Port 0 picks a free
    /// ephemeral port. Returns the bound port.
    pub fn udp_listen<F>(&mut self, port: u16, handler: F) -> Result<u16>
    where
        F: FnMut(&mut Stack, UdpDatagram) + 'static,
    {
        let port = if port == 0 {
            let table = &self.udp;
            pick_ephemeral_port(&mut self.rng, |p| table.is_bound(p))?
        } else if self.udp.is_bound(port) {
            return Err(StackError::PortInUse(port));
        } else {
            port
        };
        self.udp.listeners.insert(port, Rc::new(RefCell::new(handler)));
        info!(port, "UDP listener bound");
        Ok(port)
    }

    /// Release a port. Returns false if nothing was bound.
    pub fn udp_close(&mut self, port: u16) -> bool {
        let removed = self.udp.listeners.remove(&port).is_some();
        if removed {
            info!(port, "UDP listener closed");
        }
        removed
    }

    pub fn udp_send(&mut self, src_port: u16, dst: Ipv4Addr, dst_port: u16, data: &[u8]) -> Result<()> {
        self.udp_send_with(src_port, dst, dst_port, data, SendOptions::default())
    }

    /// Send a datagram with explicit IP options (forced interface, source address).
    pub fn udp_send_with(
        &mut self,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        data: &[u8],
        options: SendOptions,
    ) -> Result<()> {
        let src = match options.src_addr {
            Some(src) => src,
            None => self.source_addr_for(dst, options.interface)?,
        };
        let datagram = build_datagram(src, dst, src_port, dst_port, data);
        trace!(%src, src_port, %dst, dst_port, len = data.len(), "UDP send");
        self.send_ip(
            dst,
            protocol::UDP,
            &datagram,
            SendOptions {
                src_addr: Some(src),
                ..options
            },
        )
    }

    pub(crate) fn process_udp(&mut self, id: InterfaceId, ip_header: &Ipv4Header, payload: &[u8]) {
        let (udp_header, data) = match parse_datagram(ip_header.src_addr, ip_header.dst_addr, payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%err, src = %ip_header.src_addr, "dropping invalid UDP datagram");
                return;
            }
        };

        let Some(handler) = self.udp.listeners.get(&udp_header.dst_port).cloned() else {
            trace!(port = udp_header.dst_port, "no UDP listener");
            return;
        };
        let datagram = UdpDatagram {
            src_addr: ip_header.src_addr,
            src_port: udp_header.src_port,
            dst_addr: ip_header.dst_addr,
            dst_port: udp_header.dst_port,
            interface: id,
            data: data.to_vec(),
        };
        match handler.try_borrow_mut() {
            Ok(mut handler) => (&mut *handler)(self, datagram),
            Err(_) => warn!(port = udp_header.dst_port, "dropping datagram delivered re-entrantly"),
        };
    }
}
