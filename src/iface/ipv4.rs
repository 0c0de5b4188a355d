//! Inbound IPv4 processing: validation, reassembly and protocol dispatch.

use tracing::{debug, trace, warn};

use crate::iface::stack::{EchoReply, SendOptions, Stack};
use crate::network::addr::is_unicast;
use crate::network::icmp::{echo_reply, IcmpHeader, ICMP_HEADER_LEN, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
use crate::network::ipv4::{protocol, Ipv4Header};
use crate::network::route::InterfaceId;

impl Stack {
    pub(crate) fn process_ipv4_packet(&mut self, id: InterfaceId, packet: &[u8]) {
        let ip_header = match Ipv4Header::from_bytes(packet) {
            Ok(header) => header,
            Err(err) => {
                debug!(iface = id.0, %err, "dropping invalid IPv4 packet");
                return;
            }
        };

        // Validate packet is for us (unicast to our address or broadcast)
        if !self.interfaces[id.0].is_for_us(ip_header.dst_addr) {
            trace!(iface = id.0, dst = %ip_header.dst_addr, "IPv4 packet not for us");
            return;
        }

        let payload = &packet[ip_header.header_len()..ip_header.total_len as usize];
        if ip_header.is_fragment() {
            if let Some((header, datagram)) = self.reassembler.insert(&ip_header, payload, self.now) {
                self.dispatch_ipv4(id, &header, &datagram);
            }
        } else {
            self.dispatch_ipv4(id, &ip_header, payload);
        }
    }

    fn dispatch_ipv4(&mut self, id: InterfaceId, ip_header: &Ipv4Header, payload: &[u8]) {
        // Dispatch based on protocol
        match ip_header.protocol {
            protocol::ICMP => self.process_icmpv4(id, ip_header, payload),
            protocol::TCP => self.process_tcp(id, ip_header, payload),
            protocol::UDP => self.process_udp(id, ip_header, payload),
            other => debug!(protocol = other, src = %ip_header.src_addr, "unsupported protocol"),
        }
    }

    fn process_icmpv4(&mut self, id: InterfaceId, ip_header: &Ipv4Header, payload: &[u8]) {
        let icmp_header = match IcmpHeader::from_bytes(payload) {
            Ok(header) => header,
            Err(err) => {
                debug!(%err, src = %ip_header.src_addr, "dropping invalid ICMP message");
                return;
            }
        };

        match icmp_header.msg_type {
            ICMP_TYPE_ECHO_REQUEST => {
                let Some(reply) = echo_reply(payload) else {
                    return;
                };
                // Answer from the address that was pinged unless that was a broadcast.
                let dst = ip_header.dst_addr;
                let src_addr = (is_unicast(dst) && !self.interfaces[id.0].is_broadcast_address(dst)).then_some(dst);
                let options = SendOptions {
                    src_addr,
                    ..SendOptions::default()
                };
                match self.send_ip(ip_header.src_addr, protocol::ICMP, &reply, options) {
                    Ok(()) => debug!(dst = %ip_header.src_addr, seq = icmp_header.sequence(), "ICMP echo reply sent"),
                    Err(err) => warn!(dst = %ip_header.src_addr, %err, "could not send ICMP echo reply"),
                }
            }
            ICMP_TYPE_ECHO_REPLY => self.deliver_echo_reply(EchoReply {
                src_addr: ip_header.src_addr,
                identifier: icmp_header.identifier(),
                sequence: icmp_header.sequence(),
                data: payload[ICMP_HEADER_LEN..].to_vec(),
            }),
            other => trace!(msg_type = other, "unsupported ICMP type"),
        }
    }
}
