use std::io;
use std::process::Command;
use std::time::Instant;

use toy_network::link::{flush_output, receive_one, Link};
use toy_network::{InterfaceId, Stack};
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honoring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn ip(args: &[&str]) -> io::Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("`ip {}` failed with {status}", args.join(" ")),
        ));
    }
    Ok(())
}

/// Give the host side of the device an address and bring it up.
pub fn configure_interface(iface_name: &str, ip_cidr: &str) -> io::Result<()> {
    ip(&["addr", "add", ip_cidr, "dev", iface_name])?;
    ip(&["link", "set", "up", "dev", iface_name])?;
    tracing::info!(iface_name, ip_cidr, "host side configured");
    Ok(())
}

/// Feed frames from `link` to the stack forever, advancing the clock and writing replies.
pub fn run(stack: &mut Stack, id: InterfaceId, link: &mut impl Link) -> toy_network::Result<()> {
    let started = Instant::now();
    let mut buf = [0u8; 1518];
    loop {
        flush_output(stack, id, link)?;
        receive_one(stack, id, link, &mut buf)?;
        stack.poll(started.elapsed().as_millis() as u64);
    }
}
