//! Error types shared by the wire codecs and the stack.

use thiserror::Error;

/// Failure to parse or validate a packet read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("packet truncated: needed {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Returns `Truncated` unless `data` holds at least `needed` bytes.
pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), WireError> {
    if data.len() < needed {
        return Err(WireError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Errors surfaced to callers of the stack API.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("no route to {0}")]
    NoRoute(std::net::Ipv4Addr),
    #[error("payload of {size} bytes exceeds MTU {mtu} and DF is set")]
    CannotFragment { size: usize, mtu: usize },
    #[error("port {0} already in use")]
    PortInUse(u16),
    #[error("no free ephemeral port")]
    NoFreePort,
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection is not open for sending")]
    NotConnected,
    #[error("unknown interface {0}")]
    UnknownInterface(usize),
    #[error("no DNS servers configured")]
    NoDnsServers,
    #[error("invalid interface handshake: {0}")]
    Handshake(&'static str),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StackError> = std::result::Result<T, E>;
