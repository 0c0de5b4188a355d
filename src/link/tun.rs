//! TUN/TAP device link.

use std::io;

use tracing::info;
use tun_tap::{Iface, Mode};

use crate::config::InterfaceMode;
use crate::link::Link;

/// A kernel TUN (plain IP) or TAP (Ethernet) device, opened without packet info headers.
pub struct TunLink {
    iface: Iface,
}

impl TunLink {
    pub fn open(name: &str, mode: InterfaceMode) -> io::Result<Self> {
        let device_mode = if mode.is_ethernet() { Mode::Tap } else { Mode::Tun };
        let iface = Iface::without_packet_info(name, device_mode)?;
        info!(name = iface.name(), ?device_mode, "opened tunnel device");
        Ok(TunLink { iface })
    }

    /// Kernel-assigned device name (differs from the requested one for patterns like `tun%d`).
    pub fn name(&self) -> &str {
        self.iface.name()
    }

    pub fn mode(&self) -> InterfaceMode {
        match self.iface.mode() {
            Mode::Tun => InterfaceMode::Plain,
            Mode::Tap => InterfaceMode::Bridged,
        }
    }
}

impl Link for TunLink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.iface.send(frame).map(|_| ())
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.iface.recv(buf)
    }
}
