//! A user-space TCP/IP stack in Rust
//!
//! This library implements the protocols a single host needs on top of a raw-frame link:
//! - Ethernet framing and ARP address resolution
//! - IPv4 routing, fragmentation and reassembly
//! - ICMP echo request/reply
//! - UDP and TCP (connection state machine with retransmission)
//! - DHCP and DNS clients
//!
//! Everything lives in a [`Stack`], which performs no I/O and keeps time on a caller-supplied
//! millisecond clock. See [`link`] for moving frames between a device and the stack.

pub mod app;
pub mod config;
pub mod error;
pub mod iface;
pub mod link;
pub mod network;
pub mod time;
pub mod transport;

// Re-export commonly used types
pub use app::{DhcpLease, DnsAnswer, DnsError, DnsType};
pub use config::{InterfaceConfig, InterfaceMode, StackConfig};
pub use error::{Result, StackError, WireError};
pub use iface::{ConnectionId, EchoReply, SendOptions, Stack};
pub use network::addr::{MacAddr, Subnet};
pub use network::route::{InterfaceId, Route};
pub use time::Millis;
pub use transport::{ConnEvent, TcpState, UdpDatagram};
