//! TCP socket API: listeners, connection table and segment dispatch.
//!
//! Connections are identified by their [`ConnKey`]. Events are queued and delivered one at a
//! time, so a handler may call back into the stack (send, close, kill) without its own
//! events being delivered re-entrantly.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::rc::Rc;

use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StackError};
use crate::iface::stack::{pick_ephemeral_port, SendOptions, Stack};
use crate::network::ipv4::{protocol, Ipv4Header};
use crate::network::route::InterfaceId;
use crate::transport::connection::{ConnEvent, ConnKey, ConnParams, OutSegment, Output, TcpConnection};
use crate::transport::tcp::{build_segment, parse_segment, TcpFlags, TcpHeader, TcpState};

/// Handle to an open connection.
pub type ConnectionId = ConnKey;

type TcpHandler = Rc<RefCell<dyn FnMut(&mut Stack, ConnectionId, ConnEvent)>>;
type AckCallback = Box<dyn FnOnce(&mut Stack)>;

struct TcpSocket {
    conn: TcpConnection<AckCallback>,
    handler: TcpHandler,
}

#[derive(Default)]
pub(crate) struct TcpTable {
    listeners: HashMap<u16, TcpHandler>,
    connections: HashMap<ConnKey, TcpSocket>,
    events: VecDeque<(TcpHandler, ConnKey, ConnEvent)>,
    dispatching: bool,
}

impl TcpTable {
    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.contains_key(&port) || self.connections.keys().any(|key| key.local_port == port)
    }
}

impl Stack {
    /// Accept connections on `port`. Every accepted connection reports to `handler`, starting
    /// with [`ConnEvent::Connected`]. Port 0 picks an ephemeral port; the bound port is returned.
    pub fn tcp_listen<F>(&mut self, port: u16, handler: F) -> Result<u16>
    where
        F: FnMut(&mut Stack, ConnectionId, ConnEvent) + 'static,
    {
        let port = if port == 0 {
            let table = &self.tcp;
            pick_ephemeral_port(&mut self.rng, |p| table.port_in_use(p))?
        } else if self.tcp.listeners.contains_key(&port) {
            return Err(StackError::PortInUse(port));
        } else {
            port
        };
        self.tcp.listeners.insert(port, Rc::new(RefCell::new(handler)));
        info!(port, "TCP listener bound");
        Ok(port)
    }

    /// Stop accepting on `port`. Established connections are unaffected.
    pub fn tcp_unlisten(&mut self, port: u16) -> bool {
        self.tcp.listeners.remove(&port).is_some()
    }

    /// Active open toward `dst:port` from a random ephemeral port.
    pub fn tcp_connect<F>(&mut self, dst: Ipv4Addr, port: u16, handler: F) -> Result<ConnectionId>
    where
        F: FnMut(&mut Stack, ConnectionId, ConnEvent) + 'static,
    {
        let hop = self.route(dst)?;
        let mss = self.interface(hop.interface)?.tcp_mss();
        let local_port = {
            let table = &self.tcp;
            pick_ephemeral_port(&mut self.rng, |p| table.port_in_use(p))?
        };
        let key = ConnKey {
            remote_addr: dst,
            local_port,
            remote_port: port,
        };
        let params = ConnParams {
            isn: self.rng.gen(),
            mss,
            window: self.config.tcp_window,
        };
        let (conn, out) = TcpConnection::connect(key, params, self.now);
        self.tcp.connections.insert(
            key,
            TcpSocket {
                conn,
                handler: Rc::new(RefCell::new(handler)),
            },
        );
        info!(?key, "TCP connect");
        self.apply_tcp_output(key, out);
        Ok(key)
    }

    /// Queue `data` on an open connection.
    pub fn tcp_send(&mut self, id: ConnectionId, data: &[u8]) -> Result<()> {
        self.tcp_write(id, data, None)
    }

    /// Queue `data`; `on_ack` runs once the peer has acknowledged all of it.
    pub fn tcp_send_then<F>(&mut self, id: ConnectionId, data: &[u8], on_ack: F) -> Result<()>
    where
        F: FnOnce(&mut Stack) + 'static,
    {
        self.tcp_write(id, data, Some(Box::new(on_ack)))
    }

    fn tcp_write(&mut self, id: ConnectionId, data: &[u8], done: Option<AckCallback>) -> Result<()> {
        let now = self.now;
        let socket = self
            .tcp
            .connections
            .get_mut(&id)
            .ok_or(StackError::UnknownConnection)?;
        let out = socket.conn.send(data, done, now)?;
        self.apply_tcp_output(id, out);
        Ok(())
    }

    /// Send FIN after any queued data.
    pub fn tcp_close(&mut self, id: ConnectionId) -> Result<()> {
        self.tcp_shutdown(id, None)
    }

    /// Send FIN after any queued data; `on_ack` runs once the FIN is acknowledged.
    pub fn tcp_close_then<F>(&mut self, id: ConnectionId, on_ack: F) -> Result<()>
    where
        F: FnOnce(&mut Stack) + 'static,
    {
        self.tcp_shutdown(id, Some(Box::new(on_ack)))
    }

    fn tcp_shutdown(&mut self, id: ConnectionId, done: Option<AckCallback>) -> Result<()> {
        let now = self.now;
        let socket = self
            .tcp
            .connections
            .get_mut(&id)
            .ok_or(StackError::UnknownConnection)?;
        let out = socket.conn.close(done, now);
        self.apply_tcp_output(id, out);
        Ok(())
    }

    /// Abort the connection with RST.
    pub fn tcp_kill(&mut self, id: ConnectionId) -> Result<()> {
        let socket = self
            .tcp
            .connections
            .get_mut(&id)
            .ok_or(StackError::UnknownConnection)?;
        let out = socket.conn.kill();
        self.apply_tcp_output(id, out);
        Ok(())
    }

    /// Buffer received data until the peer sets PSH.
    pub fn tcp_set_push_mode(&mut self, id: ConnectionId, enabled: bool) -> Result<()> {
        self.tcp
            .connections
            .get_mut(&id)
            .ok_or(StackError::UnknownConnection)?
            .conn
            .set_push_mode(enabled);
        Ok(())
    }

    pub fn tcp_state(&self, id: ConnectionId) -> Option<TcpState> {
        self.tcp.connections.get(&id).map(|socket| socket.conn.state())
    }

    pub fn tcp_connections(&self) -> Vec<ConnectionId> {
        self.tcp.connections.keys().copied().collect()
    }

    /// Retransmission pass over every connection.
    pub(crate) fn tcp_cycle(&mut self) {
        let (now, retransmit_after, max_retransmits) =
            (self.now, self.config.tcp_retransmit_after, self.config.tcp_max_retransmits);
        for key in self.tcp_connections() {
            if let Some(socket) = self.tcp.connections.get_mut(&key) {
                let out = socket.conn.cycle(now, retransmit_after, max_retransmits);
                self.apply_tcp_output(key, out);
            }
        }
    }

    pub(crate) fn process_tcp(&mut self, id: InterfaceId, ip_header: &Ipv4Header, payload: &[u8]) {
        let (header, data) = match parse_segment(ip_header.src_addr, ip_header.dst_addr, payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%err, src = %ip_header.src_addr, "dropping invalid TCP segment");
                return;
            }
        };
        let key = ConnKey {
            remote_addr: ip_header.src_addr,
            local_port: header.dst_port,
            remote_port: header.src_port,
        };

        if let Some(socket) = self.tcp.connections.get_mut(&key) {
            let out = socket.conn.on_segment(&header, data, self.now);
            self.apply_tcp_output(key, out);
            return;
        }

        if header.is_syn() && !header.is_ack() {
            if let Some(handler) = self.tcp.listeners.get(&header.dst_port).cloned() {
                let params = ConnParams {
                    isn: self.rng.gen(),
                    mss: self.interfaces[id.0].tcp_mss(),
                    window: self.config.tcp_window,
                };
                let (conn, out) = TcpConnection::accept(key, &header, params, self.now);
                self.tcp.connections.insert(key, TcpSocket { conn, handler });
                info!(?key, "TCP connection accepted");
                self.apply_tcp_output(key, out);
                return;
            }
        }

        if !header.is_rst() {
            trace!(?key, flags = ?header.flags, "segment for unknown connection, sending RST");
            self.send_tcp_reset(ip_header, &header, data.len());
        }
    }

    /// Send the connection's segments, then run completions, then report events.
    fn apply_tcp_output(&mut self, key: ConnKey, out: Output<AckCallback>) {
        for segment in &out.segments {
            self.send_tcp_segment(key, segment);
        }

        let Some(socket) = self.tcp.connections.get(&key) else {
            return;
        };
        let handler = socket.handler.clone();
        if socket.conn.is_closed() {
            self.tcp.connections.remove(&key);
            debug!(?key, "TCP connection removed");
        }

        for done in out.completed {
            done(self);
        }
        for event in out.events {
            self.tcp.events.push_back((handler.clone(), key, event));
        }
        self.dispatch_tcp_events();
    }

    fn dispatch_tcp_events(&mut self) {
        if self.tcp.dispatching {
            return;
        }
        self.tcp.dispatching = true;
        while let Some((handler, key, event)) = self.tcp.events.pop_front() {
            match handler.try_borrow_mut() {
                Ok(mut handler) => (&mut *handler)(self, key, event),
                Err(_) => warn!(?key, ?event, "TCP handler busy, event dropped"),
            }
        }
        self.tcp.dispatching = false;
    }

    fn send_tcp_segment(&mut self, key: ConnKey, segment: &OutSegment) {
        let result = self
            .source_addr_for(key.remote_addr, None)
            .and_then(|src| {
                let bytes = build_segment(src, key.remote_addr, &segment.header, &segment.payload);
                let options = SendOptions {
                    src_addr: Some(src),
                    ..SendOptions::default()
                };
                self.send_ip(key.remote_addr, protocol::TCP, &bytes, options)
            });
        match result {
            Ok(()) => trace!(?key, flags = ?segment.header.flags, seq = segment.header.seq_number, len = segment.payload.len(), "segment sent"),
            Err(err) => warn!(?key, %err, "could not send TCP segment"),
        }
    }

    /// Reset answering a segment that matches no connection (RFC 793, "reset generation").
    fn send_tcp_reset(&mut self, ip_header: &Ipv4Header, header: &TcpHeader, payload_len: usize) {
        let reset = if header.is_ack() {
            TcpHeader::new(header.dst_port, header.src_port, header.ack_number, 0, TcpFlags::RST)
        } else {
            let seg_len = payload_len as u32 + header.is_syn() as u32 + header.is_fin() as u32;
            TcpHeader::new(
                header.dst_port,
                header.src_port,
                0,
                header.seq_number.wrapping_add(seg_len),
                TcpFlags::RST | TcpFlags::ACK,
            )
        };
        let src = ip_header.dst_addr;
        let bytes = build_segment(src, ip_header.src_addr, &reset, &[]);
        let options = SendOptions {
            src_addr: Some(src),
            ..SendOptions::default()
        };
        if let Err(err) = self.send_ip(ip_header.src_addr, protocol::TCP, &bytes, options) {
            debug!(%err, "could not send RST");
        }
    }
}
