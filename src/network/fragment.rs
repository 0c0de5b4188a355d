//! IPv4 fragmentation and reassembly.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use tracing::{debug, trace};

use crate::error::StackError;
use crate::network::ipv4::Ipv4Header;
use crate::time::Millis;

/// Split `payload` into IPv4 packets that each fit `mtu`.
///
/// Pieces break at 8-byte aligned offsets, share the header's identification and carry MF on
/// every piece but the last. Oversize payloads with DF set are refused.
pub fn fragment(header: &Ipv4Header, payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, StackError> {
    let header_len = header.serialized_len();
    if header_len + payload.len() <= mtu {
        return Ok(vec![header.packet(payload)]);
    }
    let too_big = StackError::CannotFragment {
        size: header_len + payload.len(),
        mtu,
    };
    if header.dont_fragment() {
        return Err(too_big);
    }
    let frag_size = mtu.saturating_sub(header_len) & !7;
    if frag_size == 0 {
        return Err(too_big);
    }

    let count = payload.len().div_ceil(frag_size);
    let mut later_header = header.clone();
    later_header.options = header.copied_options();
    let mut packets = Vec::with_capacity(count);
    for (index, piece) in payload.chunks(frag_size).enumerate() {
        let mut piece_header = if index == 0 { header.clone() } else { later_header.clone() };
        let last = index + 1 == count;
        piece_header.set_fragment(!last || header.more_fragments(), index * frag_size);
        packets.push(piece_header.packet(piece));
    }
    trace!(id = header.id, count, "fragmented datagram");
    Ok(packets)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    id: u16,
    src: Ipv4Addr,
}

#[derive(Debug)]
struct FragmentEntry {
    created_at: Millis,
    first_header: Option<Ipv4Header>,
    pieces: BTreeMap<usize, Vec<u8>>,
    /// End offset of the fragment that arrived without MF.
    last_end: Option<usize>,
    /// Pieces from offset 0 form an unbroken chain up to here.
    contiguous_through: usize,
}

impl FragmentEntry {
    fn new(now: Millis) -> Self {
        FragmentEntry {
            created_at: now,
            first_header: None,
            pieces: BTreeMap::new(),
            last_end: None,
            contiguous_through: 0,
        }
    }

    fn advance(&mut self) {
        while let Some(piece) = self.pieces.get(&self.contiguous_through) {
            if piece.is_empty() {
                break;
            }
            self.contiguous_through += piece.len();
        }
    }

    fn is_complete(&self) -> bool {
        self.first_header.is_some() && self.last_end == Some(self.contiguous_through)
    }

    fn assemble(self) -> Option<(Ipv4Header, Vec<u8>)> {
        let mut header = self.first_header?;
        let total = self.contiguous_through;
        let mut payload = Vec::with_capacity(total);
        let mut offset = 0;
        while offset < total {
            let piece = self.pieces.get(&offset)?;
            payload.extend_from_slice(piece);
            offset += piece.len();
        }
        header.set_fragment(false, 0);
        header.total_len = u16::try_from(header.header_len() + payload.len()).ok()?;
        Some((header, payload))
    }
}

/// Aging cache of partially received datagrams keyed by (identification, source).
#[derive(Debug, Default)]
pub struct Reassembler {
    entries: HashMap<FragmentKey, FragmentEntry>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one fragment. Returns the full datagram once every piece from offset 0 through
    /// the last fragment has arrived.
    pub fn insert(
        &mut self,
        header: &Ipv4Header,
        payload: &[u8],
        now: Millis,
    ) -> Option<(Ipv4Header, Vec<u8>)> {
        let key = FragmentKey {
            id: header.id,
            src: header.src_addr,
        };
        let offset = header.fragment_offset();
        if header.header_len() + offset + payload.len() > u16::MAX as usize {
            debug!(id = key.id, src = %key.src, offset, "dropping datagram reassembling past 65535 bytes");
            self.entries.remove(&key);
            return None;
        }
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| FragmentEntry::new(now));

        if offset == 0 {
            entry.first_header = Some(header.clone());
        }
        if !header.more_fragments() {
            entry.last_end = Some(offset + payload.len());
        }
        entry.pieces.insert(offset, payload.to_vec());
        entry.advance();

        if !entry.is_complete() {
            return None;
        }
        let entry = self.entries.remove(&key)?;
        debug!(id = key.id, src = %key.src, "reassembled datagram");
        entry.assemble()
    }

    /// Drop incomplete datagrams older than `max_age`. Returns how many were evicted.
    pub fn sweep(&mut self, now: Millis, max_age: Millis) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.created_at) <= max_age);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "dropped stale fragments");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ipv4::{flags, protocol};
    use proptest::prelude::*;

    fn header(id: u16) -> Ipv4Header {
        let mut header = Ipv4Header::new(
            protocol::UDP,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            0,
        );
        header.id = id;
        header
    }

    fn feed(reassembler: &mut Reassembler, packets: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut result = None;
        for packet in packets {
            let header = Ipv4Header::from_bytes(packet).unwrap();
            let payload = &packet[header.header_len()..header.total_len as usize];
            if let Some((_, data)) = reassembler.insert(&header, payload, 0) {
                assert!(result.is_none(), "datagram completed twice");
                result = Some(data);
            }
        }
        result
    }

    #[test]
    fn splits_on_eight_byte_boundaries() {
        let payload = vec![7u8; 3000];
        let packets = fragment(&header(1), &payload, 1500).unwrap();
        assert_eq!(packets.len(), 3);

        let first = Ipv4Header::from_bytes(&packets[0]).unwrap();
        let second = Ipv4Header::from_bytes(&packets[1]).unwrap();
        let third = Ipv4Header::from_bytes(&packets[2]).unwrap();
        assert_eq!(first.payload_len(), 1480);
        assert!(first.more_fragments() && second.more_fragments());
        assert!(!third.more_fragments());
        assert_eq!(second.fragment_offset(), 1480);
        assert_eq!(second.flags_frag_offset & flags::FRAGMENT_OFFSET_MASK, 185);
        assert_eq!(third.payload_len(), 40);
    }

    #[test]
    fn small_payload_is_not_fragmented() {
        let packets = fragment(&header(1), &[1, 2, 3], 1500).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(!Ipv4Header::from_bytes(&packets[0]).unwrap().is_fragment());
    }

    #[test]
    fn dont_fragment_is_an_error() {
        let mut header = header(1);
        header.flags_frag_offset = flags::DONT_FRAGMENT;
        let result = fragment(&header, &[0u8; 2000], 1500);
        assert!(matches!(result, Err(StackError::CannotFragment { .. })));
    }

    #[test]
    fn waits_for_missing_middle_piece() {
        let payload: Vec<u8> = (0..200u8).collect();
        let packets = fragment(&header(9), &payload, 100).unwrap();
        let mut reassembler = Reassembler::new();
        assert!(feed(&mut reassembler, &[packets[0].clone(), packets[2].clone()]).is_none());
        assert_eq!(reassembler.len(), 1);
        assert_eq!(feed(&mut reassembler, &packets[1..2]), Some(payload));
        assert!(reassembler.is_empty());
    }

    #[test]
    fn later_fragments_keep_only_copied_options() {
        let mut with_options = header(11);
        // record route (not copied), then router alert (copied)
        with_options.options = vec![0x07, 0x03, 0x04, 0x94, 0x04, 0x00, 0x00, 0x00];
        let packets = fragment(&with_options, &[5u8; 200], 100).unwrap();
        assert!(packets.len() > 1);

        let first = Ipv4Header::from_bytes(&packets[0]).unwrap();
        assert_eq!(first.options, with_options.options);
        for packet in &packets[1..] {
            let later = Ipv4Header::from_bytes(packet).unwrap();
            assert_eq!(later.options, vec![0x94, 0x04, 0x00, 0x00]);
            assert!(later.total_len as usize <= 100);
        }

        let mut reassembler = Reassembler::new();
        assert_eq!(feed(&mut reassembler, &packets), Some(vec![5u8; 200]));
    }

    #[test]
    fn oversized_reassembly_is_rejected() {
        let mut reassembler = Reassembler::new();
        let mut first = header(13);
        first.set_fragment(true, 0);
        assert!(reassembler.insert(&first, &[0u8; 64], 0).is_none());
        assert_eq!(reassembler.len(), 1);

        // last piece at the highest offset pushes the datagram past 65535 bytes
        let mut last = header(13);
        last.set_fragment(false, 65_528);
        assert!(reassembler.insert(&last, &[0u8; 64], 0).is_none());
        assert!(reassembler.is_empty());
    }

    #[test]
    fn stale_entries_are_swept() {
        let packets = fragment(&header(3), &[0u8; 300], 100).unwrap();
        let mut reassembler = Reassembler::new();
        let first = Ipv4Header::from_bytes(&packets[0]).unwrap();
        reassembler.insert(&first, &packets[0][20..], 1_000);

        assert_eq!(reassembler.sweep(31_000, 30_000), 0);
        assert_eq!(reassembler.sweep(31_001, 30_000), 1);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn separate_sources_do_not_mix() {
        let payload = vec![1u8; 300];
        let a = fragment(&header(5), &payload, 100).unwrap();
        let mut other = header(5);
        other.src_addr = Ipv4Addr::new(10, 0, 0, 3);
        let b = fragment(&other, &vec![2u8; 300], 100).unwrap();

        let mut reassembler = Reassembler::new();
        let mut interleaved = Vec::new();
        for (x, y) in a.iter().zip(b.iter()) {
            interleaved.push(x.clone());
            interleaved.push(y.clone());
        }
        interleaved.pop();
        assert_eq!(feed(&mut reassembler, &interleaved), Some(payload));
        assert_eq!(reassembler.len(), 1);
    }

    proptest! {
        #[test]
        fn reassembles_any_arrival_order(
            payload in proptest::collection::vec(any::<u8>(), 1..4000),
            mtu in 68usize..1500,
            order in any::<u64>(),
        ) {
            let packets = fragment(&header(42), &payload, mtu).unwrap();

            let mut reassembler = Reassembler::new();
            prop_assert_eq!(feed(&mut reassembler, &packets), Some(payload.clone()));

            let mut reversed = packets.clone();
            reversed.reverse();
            prop_assert_eq!(feed(&mut reassembler, &reversed), Some(payload.clone()));

            let mut shuffled = packets.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = ((order >> (i % 64)) as usize).wrapping_add(i * 31) % len;
                shuffled.swap(i, j);
            }
            prop_assert_eq!(feed(&mut reassembler, &shuffled), Some(payload));
            prop_assert!(reassembler.is_empty());
        }
    }
}
