//! TCP connection state machine.
//!
//! A connection keeps at most one segment in flight: the next queued segment goes out only
//! once the previous one is acknowledged. Segments arriving out of order are not buffered;
//! the peer retransmits them. Completion tokens registered with [`TcpConnection::send`] and
//! [`TcpConnection::close`] are handed back in [`Output::completed`] when the peer
//! acknowledges the sequence number they were registered against.
//!
//! The connection never performs I/O. Every entry point returns an [`Output`] holding the
//! segments to transmit and the events to report, which the stack turns into packets and
//! handler calls.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use tracing::{debug, trace, warn};

use crate::error::StackError;
use crate::time::Millis;
use crate::transport::tcp::{seq_gt, seq_lt, TcpFlags, TcpHeader, TcpState, DEFAULT_MSS};

/// Identity of a connection: the local address is implied by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub remote_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Something the application should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// Handshake completed.
    Connected,
    Data(Vec<u8>),
    /// The peer sent FIN; no more data will arrive.
    PeerClosed,
    /// Orderly teardown finished.
    Closed,
    /// The connection was aborted (RST received or sent).
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

pub struct Output<A> {
    pub segments: Vec<OutSegment>,
    pub events: Vec<ConnEvent>,
    pub completed: Vec<A>,
}

impl<A> Default for Output<A> {
    fn default() -> Self {
        Output {
            segments: Vec::new(),
            events: Vec::new(),
            completed: Vec::new(),
        }
    }
}

enum Pending<A> {
    Data {
        payload: Vec<u8>,
        push: bool,
        done: Option<A>,
    },
    Fin {
        done: Option<A>,
    },
}

struct InFlight {
    segment: OutSegment,
    expected_ack: u32,
    sent_at: Millis,
}

/// Per-connection parameters supplied by the stack.
#[derive(Debug, Clone, Copy)]
pub struct ConnParams {
    pub isn: u32,
    /// Largest payload we accept per segment (announced in our SYN).
    pub mss: u16,
    /// Fixed receive window advertised on every segment.
    pub window: u16,
}

pub struct TcpConnection<A> {
    key: ConnKey,
    state: TcpState,
    /// Next sequence number we will send.
    local_seq: u32,
    /// Next sequence number expected from the peer.
    remote_seq: u32,
    window: u16,
    our_mss: u16,
    peer_mss: Option<u16>,
    in_flight: Option<InFlight>,
    retries: u32,
    send_queue: VecDeque<Pending<A>>,
    ack_callbacks: HashMap<u32, Vec<A>>,
    fin_queued: bool,
    push_mode: bool,
    recv_buffer: Vec<u8>,
}

impl<A> TcpConnection<A> {
    fn new(key: ConnKey, state: TcpState, params: ConnParams) -> Self {
        TcpConnection {
            key,
            state,
            local_seq: params.isn,
            remote_seq: 0,
            window: params.window,
            our_mss: params.mss,
            peer_mss: None,
            in_flight: None,
            retries: 0,
            send_queue: VecDeque::new(),
            ack_callbacks: HashMap::new(),
            fin_queued: false,
            push_mode: false,
            recv_buffer: Vec::new(),
        }
    }

    /// Active open: sends SYN carrying our MSS.
    pub fn connect(key: ConnKey, params: ConnParams, now: Millis) -> (Self, Output<A>) {
        let mut conn = Self::new(key, TcpState::SynSent, params);
        let mut out = Output::default();
        conn.send_syn(TcpFlags::SYN, &mut out, now);
        debug!(?key, "CLOSED -> SYN_SENT");
        (conn, out)
    }

    /// Passive open in answer to `syn`: replies SYN+ACK.
    pub fn accept(key: ConnKey, syn: &TcpHeader, params: ConnParams, now: Millis) -> (Self, Output<A>) {
        let mut conn = Self::new(key, TcpState::SynReceived, params);
        conn.remote_seq = syn.seq_number.wrapping_add(1);
        conn.peer_mss = syn.mss;
        let mut out = Output::default();
        conn.send_syn(TcpFlags::SYN | TcpFlags::ACK, &mut out, now);
        debug!(?key, "LISTEN -> SYN_RECEIVED");
        (conn, out)
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn remote_seq(&self) -> u32 {
        self.remote_seq
    }

    /// Largest payload we put in one segment.
    pub fn mss(&self) -> u16 {
        self.our_mss.min(self.peer_mss.unwrap_or(DEFAULT_MSS))
    }

    /// Accumulate received bytes and deliver them only when a PSH segment arrives.
    pub fn set_push_mode(&mut self, enabled: bool) {
        self.push_mode = enabled;
    }

    pub fn has_unacked(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Queue `data` for sending. `done` completes when the peer acknowledges its last byte.
    pub fn send(&mut self, data: &[u8], done: Option<A>, now: Millis) -> Result<Output<A>, StackError> {
        if !self.state.can_send() || self.fin_queued {
            return Err(StackError::NotConnected);
        }
        let mut out = Output::default();
        if data.is_empty() {
            out.completed.extend(done);
            return Ok(out);
        }

        let mss = self.mss().max(1) as usize;
        let count = data.len().div_ceil(mss);
        let mut done = done;
        for (index, chunk) in data.chunks(mss).enumerate() {
            let last = index + 1 == count;
            self.send_queue.push_back(Pending::Data {
                payload: chunk.to_vec(),
                push: last,
                done: if last { done.take() } else { None },
            });
        }
        self.pump(&mut out, now);
        Ok(out)
    }

    /// Queue a FIN behind any pending data. `done` completes when the FIN is acknowledged.
    pub fn close(&mut self, done: Option<A>, now: Millis) -> Output<A> {
        let mut out = Output::default();
        if !self.state.can_send() || self.fin_queued {
            out.completed.extend(done);
            return out;
        }
        self.fin_queued = true;
        self.send_queue.push_back(Pending::Fin { done });
        self.pump(&mut out, now);
        out
    }

    /// Abort with RST.
    pub fn kill(&mut self) -> Output<A> {
        let mut out = Output::default();
        if self.state != TcpState::Closed {
            self.abort(&mut out, ConnEvent::Closed);
        }
        out
    }

    /// Periodic retransmission check.
    pub fn cycle(&mut self, now: Millis, retransmit_after: Millis, max_retransmits: u32) -> Output<A> {
        let mut out = Output::default();
        let remote_seq = self.remote_seq;
        let Some(in_flight) = self.in_flight.as_mut() else {
            return out;
        };
        if now.saturating_sub(in_flight.sent_at) < retransmit_after {
            return out;
        }
        if self.retries >= max_retransmits {
            warn!(key = ?self.key, retries = self.retries, "retransmission limit reached, resetting");
            self.abort(&mut out, ConnEvent::Reset);
            return out;
        }
        self.retries += 1;
        in_flight.sent_at = now;
        if in_flight.segment.header.is_ack() {
            in_flight.segment.header.ack_number = remote_seq;
        }
        debug!(key = ?self.key, seq = in_flight.segment.header.seq_number, retry = self.retries, "retransmit");
        out.segments.push(in_flight.segment.clone());
        out
    }

    /// Process one inbound segment addressed to this connection.
    pub fn on_segment(&mut self, header: &TcpHeader, payload: &[u8], now: Millis) -> Output<A> {
        let mut out = Output::default();
        trace!(key = ?self.key, flags = ?header.flags, seq = header.seq_number, ack = header.ack_number, len = payload.len(), state = ?self.state, "segment");

        if header.is_rst() {
            if self.state != TcpState::Closed {
                debug!(key = ?self.key, "RST received");
                self.close_now(&mut out, ConnEvent::Reset);
            }
            return out;
        }

        match self.state {
            TcpState::Closed | TcpState::Listen => return out,
            TcpState::SynSent => {
                self.on_syn_sent(header, &mut out, now);
                return out;
            }
            _ => {}
        }

        if header.is_syn() {
            if self.state == TcpState::SynReceived
                && header.seq_number.wrapping_add(1) == self.remote_seq
            {
                // Peer did not see our SYN+ACK.
                if let Some(in_flight) = &self.in_flight {
                    out.segments.push(in_flight.segment.clone());
                }
                return out;
            }
            warn!(key = ?self.key, state = ?self.state, "unexpected SYN, resetting");
            self.abort(&mut out, ConnEvent::Reset);
            return out;
        }

        let seg_len = payload.len() + header.is_fin() as usize;
        if seg_len > 0 && header.seq_number != self.remote_seq {
            if seq_lt(header.seq_number, self.remote_seq) {
                trace!(key = ?self.key, "duplicate segment, re-acknowledging");
                out.segments.push(self.ack_segment(TcpFlags::ACK));
            }
            return out;
        }

        if header.is_ack() {
            if !self.on_ack(header.ack_number, &mut out) {
                return out;
            }
        } else if self.state == TcpState::SynReceived {
            return out;
        }

        let mut need_ack = false;
        if !payload.is_empty()
            && matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            )
        {
            self.remote_seq = self.remote_seq.wrapping_add(payload.len() as u32);
            need_ack = true;
            if self.push_mode {
                self.recv_buffer.extend_from_slice(payload);
                if header.is_psh() {
                    out.events.push(ConnEvent::Data(std::mem::take(&mut self.recv_buffer)));
                }
            } else {
                out.events.push(ConnEvent::Data(payload.to_vec()));
            }
        }

        if header.is_fin() {
            self.remote_seq = self.remote_seq.wrapping_add(1);
            need_ack = true;
            if !self.recv_buffer.is_empty() {
                out.events.push(ConnEvent::Data(std::mem::take(&mut self.recv_buffer)));
            }
            self.on_fin(&mut out, now);
        }

        self.pump(&mut out, now);
        if need_ack && out.segments.is_empty() {
            out.segments.push(self.ack_segment(TcpFlags::ACK));
        }
        out
    }

    fn on_syn_sent(&mut self, header: &TcpHeader, out: &mut Output<A>, now: Millis) {
        if header.is_ack() && header.ack_number != self.local_seq {
            warn!(key = ?self.key, ack = header.ack_number, "bad ACK for SYN, resetting");
            self.abort(out, ConnEvent::Reset);
            return;
        }
        if !header.is_syn() {
            return;
        }
        self.remote_seq = header.seq_number.wrapping_add(1);
        self.peer_mss = header.mss;

        if header.is_ack() {
            self.acknowledge(out);
            self.state = TcpState::Established;
            debug!(key = ?self.key, mss = self.mss(), "SYN_SENT -> ESTABLISHED");
            out.events.push(ConnEvent::Connected);
            out.segments.push(self.ack_segment(TcpFlags::ACK));
            self.pump(out, now);
        } else {
            // Simultaneous open: answer with SYN+ACK reusing our ISN.
            self.state = TcpState::SynReceived;
            self.local_seq = self.local_seq.wrapping_sub(1);
            self.in_flight = None;
            self.send_syn(TcpFlags::SYN | TcpFlags::ACK, out, now);
            debug!(key = ?self.key, "SYN_SENT -> SYN_RECEIVED");
        }
    }

    /// Returns false when the ACK was a protocol violation and the connection was reset.
    fn on_ack(&mut self, ack: u32, out: &mut Output<A>) -> bool {
        let Some(expected) = self.in_flight.as_ref().map(|f| f.expected_ack) else {
            if seq_gt(ack, self.local_seq) {
                warn!(key = ?self.key, ack, "ACK for unsent data, resetting");
                self.abort(out, ConnEvent::Reset);
                return false;
            }
            return true;
        };

        if ack == expected {
            self.acknowledge(out);
            match self.state {
                TcpState::SynReceived => {
                    self.state = TcpState::Established;
                    debug!(key = ?self.key, "SYN_RECEIVED -> ESTABLISHED");
                    out.events.push(ConnEvent::Connected);
                }
                TcpState::FinWait1 => {
                    self.state = TcpState::FinWait2;
                    debug!(key = ?self.key, "FIN_WAIT_1 -> FIN_WAIT_2");
                }
                TcpState::Closing | TcpState::LastAck => {
                    self.close_now(out, ConnEvent::Closed);
                    return false;
                }
                _ => {}
            }
        } else if seq_gt(ack, expected) {
            warn!(key = ?self.key, ack, expected, "ACK does not match unacknowledged data, resetting");
            self.abort(out, ConnEvent::Reset);
            return false;
        }
        true
    }

    fn on_fin(&mut self, out: &mut Output<A>, now: Millis) {
        match self.state {
            TcpState::FinWait1 => {
                // Our FIN is still unacknowledged.
                self.state = TcpState::Closing;
                debug!(key = ?self.key, "FIN_WAIT_1 -> CLOSING");
                out.segments.push(self.ack_segment(TcpFlags::ACK));
            }
            TcpState::FinWait2 => {
                out.segments.push(self.ack_segment(TcpFlags::ACK));
                debug!(key = ?self.key, "FIN_WAIT_2 -> TIME_WAIT -> CLOSED");
                self.close_now(out, ConnEvent::Closed);
            }
            TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => {
                self.close_now(out, ConnEvent::Closed);
            }
            _ => {
                self.state = TcpState::CloseWait;
                debug!(key = ?self.key, "-> CLOSE_WAIT");
                out.events.push(ConnEvent::PeerClosed);
                if !self.fin_queued {
                    self.fin_queued = true;
                    self.send_queue.push_back(Pending::Fin { done: None });
                }
                self.pump(out, now);
            }
        }
    }

    /// Send queued segments while nothing is awaiting acknowledgement.
    fn pump(&mut self, out: &mut Output<A>, now: Millis) {
        while self.in_flight.is_none()
            && matches!(self.state, TcpState::Established | TcpState::CloseWait)
        {
            let Some(item) = self.send_queue.pop_front() else {
                break;
            };
            let (segment, done) = match item {
                Pending::Data {
                    payload,
                    push,
                    done,
                } => {
                    let flags = if push {
                        TcpFlags::ACK | TcpFlags::PSH
                    } else {
                        TcpFlags::ACK
                    };
                    let mut segment = self.ack_segment(flags);
                    self.local_seq = self.local_seq.wrapping_add(payload.len() as u32);
                    segment.payload = payload;
                    (segment, done)
                }
                Pending::Fin { done } => {
                    let segment = self.ack_segment(TcpFlags::FIN | TcpFlags::ACK);
                    self.local_seq = self.local_seq.wrapping_add(1);
                    self.state = if self.state == TcpState::CloseWait {
                        debug!(key = ?self.key, "CLOSE_WAIT -> LAST_ACK");
                        TcpState::LastAck
                    } else {
                        debug!(key = ?self.key, "ESTABLISHED -> FIN_WAIT_1");
                        TcpState::FinWait1
                    };
                    (segment, done)
                }
            };
            if let Some(done) = done {
                self.ack_callbacks
                    .entry(self.local_seq)
                    .or_default()
                    .push(done);
            }
            self.transmit(segment, out, now);
        }
    }

    fn send_syn(&mut self, flags: TcpFlags, out: &mut Output<A>, now: Millis) {
        let mut segment = self.ack_segment(flags);
        if !flags.contains(TcpFlags::ACK) {
            segment.header.ack_number = 0;
        }
        segment.header.mss = Some(self.our_mss);
        self.local_seq = self.local_seq.wrapping_add(1);
        self.transmit(segment, out, now);
    }

    fn transmit(&mut self, segment: OutSegment, out: &mut Output<A>, now: Millis) {
        self.in_flight = Some(InFlight {
            segment: segment.clone(),
            expected_ack: self.local_seq,
            sent_at: now,
        });
        self.retries = 0;
        out.segments.push(segment);
    }

    /// The in-flight segment was acknowledged: hand back its completions.
    fn acknowledge(&mut self, out: &mut Output<A>) {
        if let Some(in_flight) = self.in_flight.take() {
            if let Some(callbacks) = self.ack_callbacks.remove(&in_flight.expected_ack) {
                out.completed.extend(callbacks);
            }
        }
        self.retries = 0;
    }

    fn ack_segment(&self, flags: TcpFlags) -> OutSegment {
        let mut header = TcpHeader::new(
            self.key.local_port,
            self.key.remote_port,
            self.local_seq,
            self.remote_seq,
            flags,
        );
        header.window_size = self.window;
        OutSegment {
            header,
            payload: Vec::new(),
        }
    }

    /// Send RST and close.
    fn abort(&mut self, out: &mut Output<A>, event: ConnEvent) {
        out.segments
            .push(self.ack_segment(TcpFlags::RST | TcpFlags::ACK));
        self.close_now(out, event);
    }

    fn close_now(&mut self, out: &mut Output<A>, event: ConnEvent) {
        self.state = TcpState::Closed;
        self.in_flight = None;
        self.send_queue.clear();
        self.ack_callbacks.clear();
        out.events.push(event);
        debug!(key = ?self.key, "-> CLOSED");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: ConnKey = ConnKey {
        remote_addr: Ipv4Addr::new(10, 0, 0, 2),
        local_port: 49200,
        remote_port: 80,
    };

    fn params(isn: u32) -> ConnParams {
        ConnParams {
            isn,
            mss: 1460,
            window: 65535,
        }
    }

    fn peer(seq: u32, ack: u32, flags: TcpFlags) -> TcpHeader {
        TcpHeader::new(KEY.remote_port, KEY.local_port, seq, ack, flags)
    }

    fn established(isn: u32, peer_isn: u32) -> TcpConnection<u32> {
        let (mut conn, _) = TcpConnection::connect(KEY, params(isn), 0);
        let mut syn_ack = peer(peer_isn, isn.wrapping_add(1), TcpFlags::SYN | TcpFlags::ACK);
        syn_ack.mss = Some(1000);
        conn.on_segment(&syn_ack, &[], 0);
        assert_eq!(conn.state(), TcpState::Established);
        conn
    }

    #[test]
    fn active_open_reaches_established() {
        let (mut conn, out) = TcpConnection::<u32>::connect(KEY, params(1000), 0);
        assert_eq!(conn.state(), TcpState::SynSent);
        let syn = &out.segments[0].header;
        assert_eq!(syn.flags, TcpFlags::SYN);
        assert_eq!(syn.seq_number, 1000);
        assert_eq!(syn.mss, Some(1460));

        let mut syn_ack = peer(5000, 1001, TcpFlags::SYN | TcpFlags::ACK);
        syn_ack.mss = Some(1200);
        let out = conn.on_segment(&syn_ack, &[], 10);
        assert_eq!(conn.state(), TcpState::Established);
        assert_eq!(out.events, vec![ConnEvent::Connected]);
        let ack = &out.segments[0].header;
        assert_eq!(ack.flags, TcpFlags::ACK);
        assert_eq!(ack.seq_number, 1001);
        assert_eq!(ack.ack_number, 5001);
        assert_eq!(ack.window_size, 65535);
        assert_eq!(conn.mss(), 1200);
    }

    #[test]
    fn passive_open_reaches_established() {
        let mut syn = peer(300, 0, TcpFlags::SYN);
        syn.mss = Some(1460);
        let (mut conn, out) = TcpConnection::<u32>::accept(KEY, &syn, params(7000), 0);
        let syn_ack = &out.segments[0].header;
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.ack_number, 301);
        assert_eq!(syn_ack.mss, Some(1460));

        let out = conn.on_segment(&peer(301, 7001, TcpFlags::ACK), &[], 1);
        assert_eq!(conn.state(), TcpState::Established);
        assert_eq!(out.events, vec![ConnEvent::Connected]);
    }

    #[test]
    fn writes_are_split_and_sent_one_at_a_time() {
        let mut conn = established(0, 100);
        let data = vec![0xab; 2500];
        let out = conn.send(&data, Some(1), 0).unwrap();
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].payload.len(), 1000);
        assert!(!out.segments[0].header.is_psh());

        let out = conn.on_segment(&peer(101, 1001, TcpFlags::ACK), &[], 1);
        assert!(out.completed.is_empty());
        assert_eq!(out.segments[0].header.seq_number, 1001);

        let out = conn.on_segment(&peer(101, 2001, TcpFlags::ACK), &[], 2);
        let last = &out.segments[0];
        assert_eq!(last.payload.len(), 500);
        assert!(last.header.is_psh());

        let out = conn.on_segment(&peer(101, 2501, TcpFlags::ACK), &[], 3);
        assert_eq!(out.completed, vec![1]);
        assert!(out.segments.is_empty());
        assert!(!conn.has_unacked());
    }

    #[test]
    fn completions_fire_in_registration_order() {
        let mut conn = established(0, 100);
        conn.send(b"a", Some(1), 0).unwrap();
        conn.send(b"b", Some(2), 0).unwrap();
        let first = conn.on_segment(&peer(101, 2, TcpFlags::ACK), &[], 1);
        assert_eq!(first.completed, vec![1]);
        let second = conn.on_segment(&peer(101, 3, TcpFlags::ACK), &[], 2);
        assert_eq!(second.completed, vec![2]);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut conn = established(0xffff_fffe, 100);
        assert_eq!(conn.local_seq(), 0xffff_ffff);
        let out = conn.send(b"abc", Some(9), 0).unwrap();
        assert_eq!(out.segments[0].header.seq_number, 0xffff_ffff);
        assert_eq!(conn.local_seq(), 2);

        let out = conn.on_segment(&peer(101, 2, TcpFlags::ACK), &[], 1);
        assert_eq!(out.completed, vec![9]);
        assert_eq!(conn.state(), TcpState::Established);
    }

    #[test]
    fn data_is_acknowledged_and_duplicates_re_acked() {
        let mut conn = established(0, 100);
        let out = conn.on_segment(&peer(101, 1, TcpFlags::ACK | TcpFlags::PSH), b"hello", 1);
        assert_eq!(out.events, vec![ConnEvent::Data(b"hello".to_vec())]);
        assert_eq!(out.segments[0].header.ack_number, 106);

        let dup = conn.on_segment(&peer(101, 1, TcpFlags::ACK | TcpFlags::PSH), b"hello", 2);
        assert!(dup.events.is_empty());
        assert_eq!(dup.segments[0].header.ack_number, 106);

        let ahead = conn.on_segment(&peer(200, 1, TcpFlags::ACK), b"later", 3);
        assert!(ahead.events.is_empty());
        assert!(ahead.segments.is_empty());
        assert_eq!(conn.remote_seq(), 106);
    }

    #[test]
    fn push_mode_buffers_until_psh() {
        let mut conn = established(0, 100);
        conn.set_push_mode(true);
        let out = conn.on_segment(&peer(101, 1, TcpFlags::ACK), b"abc", 1);
        assert!(out.events.is_empty());
        assert_eq!(out.segments.len(), 1);
        let out = conn.on_segment(&peer(104, 1, TcpFlags::ACK | TcpFlags::PSH), b"def", 2);
        assert_eq!(out.events, vec![ConnEvent::Data(b"abcdef".to_vec())]);
    }

    #[test]
    fn unexpected_syn_resets() {
        let mut conn = established(0, 100);
        let out = conn.on_segment(&peer(500, 1, TcpFlags::SYN), &[], 1);
        assert!(out.segments[0].header.is_rst());
        assert_eq!(out.events, vec![ConnEvent::Reset]);
        assert!(conn.is_closed());
    }

    #[test]
    fn ack_beyond_sent_data_resets() {
        let mut conn = established(0, 100);
        conn.send(b"abc", None, 0).unwrap();
        let out = conn.on_segment(&peer(101, 50, TcpFlags::ACK), &[], 1);
        assert_eq!(out.events, vec![ConnEvent::Reset]);
        assert!(conn.is_closed());
    }

    #[test]
    fn active_close() {
        let mut conn = established(0, 100);
        let out = conn.close(Some(4), 0);
        assert_eq!(out.segments[0].header.flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(conn.state(), TcpState::FinWait1);
        assert!(conn.send(b"late", None, 0).is_err());

        let out = conn.on_segment(&peer(101, 2, TcpFlags::ACK), &[], 1);
        assert_eq!(out.completed, vec![4]);
        assert_eq!(conn.state(), TcpState::FinWait2);

        let out = conn.on_segment(&peer(101, 2, TcpFlags::FIN | TcpFlags::ACK), &[], 2);
        assert_eq!(out.segments[0].header.ack_number, 102);
        assert_eq!(out.events, vec![ConnEvent::Closed]);
        assert!(conn.is_closed());
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let mut conn = established(0, 100);
        conn.close(None, 0);
        let out = conn.on_segment(&peer(101, 1, TcpFlags::FIN | TcpFlags::ACK), &[], 1);
        assert_eq!(conn.state(), TcpState::Closing);
        assert_eq!(out.segments[0].header.ack_number, 102);
        let out = conn.on_segment(&peer(102, 2, TcpFlags::ACK), &[], 2);
        assert_eq!(out.events, vec![ConnEvent::Closed]);
    }

    #[test]
    fn close_waits_for_pending_write() {
        let mut conn = established(0, 100);
        conn.send(b"data", None, 0).unwrap();
        let out = conn.close(None, 0);
        assert!(out.segments.is_empty());
        let out = conn.on_segment(&peer(101, 5, TcpFlags::ACK), &[], 1);
        assert!(out.segments[0].header.is_fin());
        assert_eq!(out.segments[0].header.seq_number, 5);
    }

    #[test]
    fn passive_close_echoes_fin() {
        let mut conn = established(0, 100);
        let out = conn.on_segment(&peer(101, 1, TcpFlags::FIN | TcpFlags::ACK), &[], 1);
        assert_eq!(out.events, vec![ConnEvent::PeerClosed]);
        assert_eq!(conn.state(), TcpState::LastAck);
        assert!(out.segments.iter().any(|s| s.header.is_fin()));

        let out = conn.on_segment(&peer(102, 2, TcpFlags::ACK), &[], 2);
        assert_eq!(out.events, vec![ConnEvent::Closed]);
        assert!(conn.is_closed());
    }

    #[test]
    fn retransmits_then_gives_up() {
        let mut conn = established(0, 100);
        conn.send(b"x", None, 0).unwrap();
        assert!(conn.cycle(500, 1000, 3).segments.is_empty());
        for (i, now) in [1000, 2000, 3000].into_iter().enumerate() {
            let out = conn.cycle(now, 1000, 3);
            assert_eq!(out.segments.len(), 1, "retransmission {}", i + 1);
            assert_eq!(out.segments[0].payload, b"x");
        }
        let out = conn.cycle(4000, 1000, 3);
        assert!(out.segments[0].header.is_rst());
        assert_eq!(out.events, vec![ConnEvent::Reset]);
        assert!(conn.is_closed());
    }

    #[test]
    fn rst_closes_and_drops_completions() {
        let mut conn = established(0, 100);
        conn.send(b"x", Some(1), 0).unwrap();
        let out = conn.on_segment(&peer(101, 0, TcpFlags::RST), &[], 1);
        assert_eq!(out.events, vec![ConnEvent::Reset]);
        assert!(out.completed.is_empty());
        assert!(conn.is_closed());
    }
}
