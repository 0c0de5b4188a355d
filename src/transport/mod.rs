//! Transport layer protocols implementation
//!
//! This module contains implementations for transport layer protocols:
//! - TCP: segment codec plus the per-connection state machine
//! - UDP: User Datagram Protocol

pub mod connection;
pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use connection::{ConnEvent, ConnKey, TcpConnection};
pub use tcp::{TcpFlags, TcpHeader, TcpState};
pub use udp::{UdpDatagram, UdpHeader};
