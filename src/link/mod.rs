//! Raw-frame transport boundary.
//!
//! The stack never touches a device. A [`Link`] moves whole frames (Ethernet on bridged
//! interfaces, bare IPv4 on plain ones) between a device and the stack.

pub mod tun;

use std::io;

use tracing::trace;

use crate::error::Result;
use crate::iface::stack::Stack;
use crate::network::route::InterfaceId;

pub use tun::TunLink;

pub trait Link {
    /// Write one frame.
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Block until a frame arrives; returns its length in `buf`.
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write every queued outbound frame for `id` to `link`, keeping frames for other interfaces
/// queued in order. Returns the number of frames written.
pub fn flush_output(stack: &mut Stack, id: InterfaceId, link: &mut impl Link) -> Result<usize> {
    let mut others = Vec::new();
    let mut written = 0;
    while let Some((iface, frame)) = stack.dequeue_output() {
        if iface != id {
            others.push((iface, frame));
            continue;
        }
        link.send_frame(&frame)?;
        trace!(iface = id.0, len = frame.len(), "frame written");
        written += 1;
    }
    for (iface, frame) in others {
        stack.requeue_output(iface, frame);
    }
    Ok(written)
}

/// Read one frame from `link` and hand it to the stack.
pub fn receive_one(stack: &mut Stack, id: InterfaceId, link: &mut impl Link, buf: &mut [u8]) -> Result<usize> {
    let len = link.recv_frame(buf)?;
    stack.process_frame(id, &buf[..len]);
    Ok(len)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::config::{InterfaceConfig, InterfaceMode, StackConfig};
    use crate::network::addr::{MacAddr, Subnet};
    use crate::network::icmp::{IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
    use crate::network::ipv4::{protocol, Ipv4Header};

    #[derive(Default)]
    struct MemoryLink {
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl Link for MemoryLink {
        fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let frame = self
                .inbound
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no frame"))?;
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }
    }

    #[test]
    fn ping_round_trip_over_link() {
        let ours = Ipv4Addr::new(10, 0, 0, 1);
        let peer = Ipv4Addr::new(10, 0, 0, 254);
        let mut stack = Stack::new(StackConfig::default());
        let id = stack.add_interface(
            InterfaceConfig::new(InterfaceMode::Plain, MacAddr::ZERO).with_address(Subnet::new(ours, 24)),
        );

        let request = IcmpHeader::echo(ICMP_TYPE_ECHO_REQUEST, 1, 1).message(b"hi");
        let mut link = MemoryLink::default();
        link.inbound
            .push_back(Ipv4Header::new(protocol::ICMP, peer, ours, request.len()).packet(&request));

        let mut buf = [0u8; 1500];
        receive_one(&mut stack, id, &mut link, &mut buf).unwrap();
        assert_eq!(flush_output(&mut stack, id, &mut link).unwrap(), 1);

        let reply = &link.sent[0];
        let header = Ipv4Header::from_bytes(reply).unwrap();
        assert_eq!((header.src_addr, header.dst_addr), (ours, peer));
        let icmp = IcmpHeader::from_bytes(&reply[header.header_len()..]).unwrap();
        assert_eq!(icmp.msg_type, ICMP_TYPE_ECHO_REPLY);

        assert!(matches!(
            receive_one(&mut stack, id, &mut link, &mut buf),
            Err(crate::error::StackError::Io(_))
        ));
    }

    #[test]
    fn frames_for_other_interfaces_stay_queued() {
        let mut stack = Stack::new(StackConfig::default());
        let a = stack.add_interface(
            InterfaceConfig::new(InterfaceMode::Plain, MacAddr::ZERO)
                .with_address(Subnet::new(Ipv4Addr::new(10, 0, 0, 1), 24)),
        );
        let b = stack.add_interface(
            InterfaceConfig::new(InterfaceMode::Plain, MacAddr::ZERO)
                .with_address(Subnet::new(Ipv4Addr::new(10, 1, 0, 1), 24)),
        );
        stack.ping(Ipv4Addr::new(10, 1, 0, 9), 1, 1, b"").unwrap();
        stack.ping(Ipv4Addr::new(10, 0, 0, 9), 1, 2, b"").unwrap();

        let mut link = MemoryLink::default();
        assert_eq!(flush_output(&mut stack, a, &mut link).unwrap(), 1);
        assert_eq!(stack.pending_output(), 1);
        assert_eq!(stack.dequeue_output().map(|(iface, _)| iface), Some(b));
    }
}
