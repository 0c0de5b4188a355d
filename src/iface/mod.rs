//! Network interface abstraction layer
//!
//! This module holds the [`Stack`] and the per-interface state it drives:
//! - Interface configuration and address resolution
//! - Inbound IPv4 dispatch and ICMP handling
//! - TCP and UDP socket operations

pub mod arp;
pub mod interface;
pub mod ipv4;
pub mod stack;
pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use interface::NetworkInterface;
pub use stack::{EchoReply, SendOptions, Stack};
pub use tcp::ConnectionId;
