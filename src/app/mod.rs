//! Protocol clients built on the stack: DHCP configures interfaces, DNS resolves names.

pub mod dhcp;
pub mod dns;

pub use dhcp::{DhcpLease, DhcpMessage, DhcpState};
pub use dns::{DnsAnswer, DnsError, DnsMessage, DnsType};
