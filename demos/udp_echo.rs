//! UDP echo server on a TUN device
//!
//! Answers every datagram sent to 10.0.0.1:7 with the same payload.
//!
//! To run this example:
//!
//! ```sh
//! cargo run --example udp_echo
//! echo hello | nc -u 10.0.0.1 7
//! ```
//!
//! Note: Root/sudo privileges are required to create and configure the TUN device.

mod utils;

use toy_network::link::TunLink;
use toy_network::{InterfaceConfig, InterfaceMode, MacAddr, Stack, StackConfig};
use tracing::{info, warn};
use utils::network::{configure_interface, init_tracing, run};

const PORT: u16 = 7;

fn main() -> toy_network::Result<()> {
    init_tracing();

    let mut link = TunLink::open("tun0", InterfaceMode::Plain)?;
    configure_interface(link.name(), "10.0.0.254/24")?;

    let mut stack = Stack::new(StackConfig::default());
    let id = stack.add_interface(InterfaceConfig::from_handshake("ip|10.0.0.1/24|1500", MacAddr::ZERO)?);

    stack.udp_listen(PORT, |stack, datagram| {
        info!(src = %datagram.src_addr, port = datagram.src_port, len = datagram.data.len(), "echoing datagram");
        if let Err(err) = stack.udp_send(PORT, datagram.src_addr, datagram.src_port, &datagram.data) {
            warn!(%err, "echo failed");
        }
    })?;

    run(&mut stack, id, &mut link)
}
