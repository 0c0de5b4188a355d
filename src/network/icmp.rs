//! ICMP (Internet Control Message Protocol) implementation
//!
//! This module provides ICMP packet parsing and building for the Echo Request and Echo Reply
//! messages (RFC 792). Other message types are parsed but ignored by the stack.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ensure_len, WireError};
use crate::network::checksum;

/// Minimum ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,  // ICMP message type
    pub msg_code: u8,  // ICMP message code
    pub checksum: u16, // ICMP checksum
    pub rest: [u8; 4], // Type-specific data (e.g., identifier and sequence for echo)
}

impl IcmpHeader {
    /// Parse an ICMP message header, validating the checksum over the whole message.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        ensure_len(data, ICMP_HEADER_LEN)?;
        if checksum(data) != 0 {
            return Err(WireError::BadChecksum);
        }

        Ok(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest: [data[4], data[5], data[6], data[7]],
        })
    }

    pub fn echo(msg_type: u8, identifier: u16, sequence: u16) -> Self {
        let mut header = IcmpHeader {
            msg_type,
            msg_code: 0,
            checksum: 0,
            rest: [0; 4],
        };
        header.set_identifier(identifier);
        header.set_sequence(sequence);
        header
    }

    /// Convert ICMP header to bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    /// Header followed by `data`, with the checksum computed over both.
    pub fn message(&self, data: &[u8]) -> Vec<u8> {
        let mut header = *self;
        header.checksum = 0;
        let mut message = Vec::with_capacity(ICMP_HEADER_LEN + data.len());
        message.extend_from_slice(&header.to_bytes());
        message.extend_from_slice(data);
        let sum = checksum(&message);
        BigEndian::write_u16(&mut message[2..4], sum);
        message
    }

    /// Check if this is an Echo Request message
    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST
    }

    /// Check if this is an Echo Reply message
    pub fn is_echo_reply(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REPLY
    }

    /// Get the identifier field for Echo Request/Reply messages
    pub fn identifier(&self) -> u16 {
        BigEndian::read_u16(&self.rest[0..2])
    }

    /// Get the sequence number field for Echo Request/Reply messages
    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.rest[2..4])
    }

    /// Set the identifier field for Echo Request/Reply messages
    pub fn set_identifier(&mut self, id: u16) {
        BigEndian::write_u16(&mut self.rest[0..2], id);
    }

    /// Set the sequence number field for Echo Request/Reply messages
    pub fn set_sequence(&mut self, seq: u16) {
        BigEndian::write_u16(&mut self.rest[2..4], seq);
    }
}

/// Build the Echo Reply for an Echo Request message (header and data).
///
/// Returns `None` when the message is not a well-formed echo request.
pub fn echo_reply(request: &[u8]) -> Option<Vec<u8>> {
    let header = IcmpHeader::from_bytes(request).ok()?;
    if !header.is_echo_request() {
        return None;
    }
    let reply = IcmpHeader {
        msg_type: ICMP_TYPE_ECHO_REPLY,
        ..header
    };
    Some(reply.message(&request[ICMP_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_reply_mirrors_request() {
        let request = IcmpHeader::echo(ICMP_TYPE_ECHO_REQUEST, 0x1234, 7).message(b"ping!");
        let reply = echo_reply(&request).unwrap();

        let header = IcmpHeader::from_bytes(&reply).unwrap();
        assert!(header.is_echo_reply());
        assert_eq!(header.identifier(), 0x1234);
        assert_eq!(header.sequence(), 7);
        assert_eq!(&reply[8..], b"ping!");
    }

    #[test]
    fn reply_is_not_answered() {
        let reply = IcmpHeader::echo(ICMP_TYPE_ECHO_REPLY, 1, 1).message(&[]);
        assert!(echo_reply(&reply).is_none());
    }

    #[test]
    fn corrupted_message_is_rejected() {
        let mut request = IcmpHeader::echo(ICMP_TYPE_ECHO_REQUEST, 1, 1).message(b"abc");
        request[9] ^= 0xff;
        assert_eq!(IcmpHeader::from_bytes(&request), Err(WireError::BadChecksum));
    }
}
