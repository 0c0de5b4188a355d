//! TCP echo server on a TAP device
//!
//! Brings up an Ethernet interface at 10.0.0.1/24, answers ARP and ping, and echoes back
//! whatever a TCP client sends to port 7. Lines reading `quit` close the connection.
//!
//! To run this example:
//!
//! ```sh
//! cargo run --example tcp_echo
//! nc 10.0.0.1 7
//! ```
//!
//! Note: Root/sudo privileges are required to create and configure the TAP device.

mod utils;

use toy_network::link::TunLink;
use toy_network::{ConnEvent, InterfaceConfig, InterfaceMode, MacAddr, Stack, StackConfig, Subnet};
use tracing::{info, warn};
use utils::network::{configure_interface, init_tracing, run};

const PORT: u16 = 7;

fn main() -> toy_network::Result<()> {
    init_tracing();

    let mut link = TunLink::open("tap0", InterfaceMode::Bridged)?;
    configure_interface(link.name(), "10.0.0.254/24")?;

    let mut stack = Stack::new(StackConfig::default());
    let mac: MacAddr = "02:00:00:00:00:01".parse()?;
    let address: Subnet = "10.0.0.1/24".parse()?;
    let id = stack.add_interface(InterfaceConfig::new(InterfaceMode::Bridged, mac).with_address(address));

    stack.tcp_listen(PORT, |stack, conn, event| match event {
        ConnEvent::Connected => info!(peer = %conn.remote_addr, port = conn.remote_port, "client connected"),
        ConnEvent::Data(data) if String::from_utf8_lossy(&data).trim() == "quit" => {
            if let Err(err) = stack.tcp_close(conn) {
                warn!(%err, "close failed");
            }
        }
        ConnEvent::Data(data) => {
            if let Err(err) = stack.tcp_send(conn, &data) {
                warn!(%err, "echo failed");
            }
        }
        ConnEvent::PeerClosed => {
            if let Err(err) = stack.tcp_close(conn) {
                warn!(%err, "close failed");
            }
        }
        finished @ (ConnEvent::Closed | ConnEvent::Reset) => {
            info!(peer = %conn.remote_addr, event = ?finished, "connection finished")
        }
    })?;

    run(&mut stack, id, &mut link)
}
