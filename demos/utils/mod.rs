//! Helpers shared by the demo binaries: host-side device setup and the frame pump.

pub mod network;

pub use network::*;
