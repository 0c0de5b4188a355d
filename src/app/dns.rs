//! DNS stub resolver (RFC 1035).
//!
//! Queries go to a randomly chosen configured server from a single ephemeral UDP port. Answers
//! are cached per (type, lowercased name) without expiry; concurrent lookups for the same key
//! share one outstanding query, and every waiter is answered in the order it asked.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::error::{ensure_len, WireError};
use crate::iface::stack::{Stack, TimerEvent};
use crate::network::addr::read_ipv4;
use crate::time::TimerId;
use crate::transport::udp::UdpDatagram;

pub const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const CLASS_IN: u16 = 1;
const POINTER: u8 = 0b1100_0000;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

const FLAG_RESPONSE: u16 = 1 << 15;
const FLAG_RECURSION_DESIRED: u16 = 1 << 8;
const RCODE_MASK: u16 = 0x000f;

pub mod rcode {
    pub const NO_ERROR: u8 = 0;
    pub const FORMAT_ERROR: u8 = 1;
    pub const SERVER_FAILURE: u8 = 2;
    pub const NAME_ERROR: u8 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsType {
    A,
    Ns,
    Cname,
    Mx,
    Other(u16),
}

impl DnsType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => DnsType::A,
            2 => DnsType::Ns,
            5 => DnsType::Cname,
            15 => DnsType::Mx,
            other => DnsType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            DnsType::A => 1,
            DnsType::Ns => 2,
            DnsType::Cname => 5,
            DnsType::Mx => 15,
            DnsType::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: DnsType,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Ns(String),
    Cname(String),
    Mx { preference: u16, exchange: String },
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: DnsType,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    /// The value a lookup of this record's type resolves to.
    fn answer(&self) -> Option<DnsAnswer> {
        match &self.data {
            RecordData::A(addr) => Some(DnsAnswer::Address(*addr)),
            RecordData::Ns(name) | RecordData::Cname(name) => Some(DnsAnswer::Name(name.clone())),
            RecordData::Mx { exchange, .. } => Some(DnsAnswer::Name(exchange.clone())),
            RecordData::Raw(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// A recursive query for one name.
    pub fn query(id: u16, name: &str, qtype: DnsType) -> Self {
        DnsMessage {
            id,
            flags: FLAG_RECURSION_DESIRED,
            questions: vec![DnsQuestion {
                name: name.to_string(),
                qtype,
                qclass: CLASS_IN,
            }],
            ..DnsMessage::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        ensure_len(data, HEADER_LEN)?;
        let counts: Vec<usize> = data[4..12]
            .chunks_exact(2)
            .map(|c| BigEndian::read_u16(c) as usize)
            .collect();

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(counts[0].min(16));
        for _ in 0..counts[0] {
            let (name, next) = read_name(data, pos)?;
            ensure_len(data, next + 4)?;
            questions.push(DnsQuestion {
                name,
                qtype: DnsType::from_u16(BigEndian::read_u16(&data[next..])),
                qclass: BigEndian::read_u16(&data[next + 2..]),
            });
            pos = next + 4;
        }

        let mut sections = [Vec::new(), Vec::new(), Vec::new()];
        for (section, &count) in sections.iter_mut().zip(&counts[1..]) {
            for _ in 0..count {
                let (record, next) = read_record(data, pos)?;
                section.push(record);
                pos = next;
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(DnsMessage {
            id: BigEndian::read_u16(&data[0..2]),
            flags: BigEndian::read_u16(&data[2..4]),
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serialize, compressing repeated name suffixes into pointers.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        BigEndian::write_u16(&mut out[0..2], self.id);
        BigEndian::write_u16(&mut out[2..4], self.flags);
        BigEndian::write_u16(&mut out[4..6], self.questions.len() as u16);
        BigEndian::write_u16(&mut out[6..8], self.answers.len() as u16);
        BigEndian::write_u16(&mut out[8..10], self.authorities.len() as u16);
        BigEndian::write_u16(&mut out[10..12], self.additionals.len() as u16);

        let mut names = NameTable::default();
        for question in &self.questions {
            names.write(&mut out, &question.name);
            push_u16(&mut out, question.qtype.to_u16());
            push_u16(&mut out, question.qclass);
        }
        for record in self.answers.iter().chain(&self.authorities).chain(&self.additionals) {
            names.write(&mut out, &record.name);
            push_u16(&mut out, record.rtype.to_u16());
            push_u16(&mut out, record.class);
            out.extend_from_slice(&record.ttl.to_be_bytes());
            let len_at = out.len();
            push_u16(&mut out, 0);
            match &record.data {
                RecordData::A(addr) => out.extend_from_slice(&addr.octets()),
                RecordData::Ns(name) | RecordData::Cname(name) => names.write(&mut out, name),
                RecordData::Mx { preference, exchange } => {
                    push_u16(&mut out, *preference);
                    names.write(&mut out, exchange);
                }
                RecordData::Raw(raw) => out.extend_from_slice(raw),
            }
            let rdlength = (out.len() - len_at - 2) as u16;
            BigEndian::write_u16(&mut out[len_at..len_at + 2], rdlength);
        }
        out
    }

    /// Resolve `name` against the answer section, following CNAMEs by owner name.
    pub fn answer_for(&self, name: &str, qtype: DnsType) -> Option<DnsAnswer> {
        let mut target = name.trim_end_matches('.').to_ascii_lowercase();
        // each hop consumes a distinct record, so a CNAME loop cannot outlast the section
        for _ in 0..=self.answers.len() {
            let owned_by = |r: &&DnsRecord| r.name.eq_ignore_ascii_case(&target);
            if let Some(record) = self.answers.iter().filter(owned_by).find(|r| r.rtype == qtype) {
                return record.answer();
            }
            let Some(RecordData::Cname(next)) = self
                .answers
                .iter()
                .filter(owned_by)
                .find(|r| r.rtype == DnsType::Cname)
                .map(|r| &r.data)
            else {
                return None;
            };
            target = next.to_ascii_lowercase();
        }
        None
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Offsets of name suffixes already written, for compression.
#[derive(Default)]
struct NameTable {
    offsets: HashMap<String, u16>,
}

impl NameTable {
    fn write(&mut self, out: &mut Vec<u8>, name: &str) {
        let name = name.trim_end_matches('.');
        let labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();
        for i in 0..labels.len() {
            let suffix = labels[i..].join(".").to_ascii_lowercase();
            if let Some(&offset) = self.offsets.get(&suffix) {
                push_u16(out, 0xc000 | offset);
                return;
            }
            if out.len() < 0x4000 {
                self.offsets.insert(suffix, out.len() as u16);
            }
            let label = labels[i].as_bytes();
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
    }
}

/// Decode a possibly compressed name at `pos`. Returns the name and the offset just past it
/// in the original byte stream.
fn read_name(data: &[u8], mut pos: usize) -> Result<(String, usize), WireError> {
    let mut name = String::new();
    let mut resume = None;
    let mut jumps: Vec<usize> = Vec::new();
    loop {
        ensure_len(data, pos + 1)?;
        let len = data[pos];
        if len & POINTER == POINTER {
            ensure_len(data, pos + 2)?;
            let target = (BigEndian::read_u16(&data[pos..]) & 0x3fff) as usize;
            if jumps.contains(&target) {
                return Err(WireError::Malformed("DNS name pointer loop"));
            }
            jumps.push(target);
            resume.get_or_insert(pos + 2);
            pos = target;
            continue;
        }
        if len & POINTER != 0 {
            return Err(WireError::Unsupported("DNS extended label type"));
        }
        pos += 1;
        if len == 0 {
            break;
        }
        let end = pos + len as usize;
        ensure_len(data, end)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&data[pos..end]));
        if name.len() > MAX_NAME_LEN {
            return Err(WireError::Malformed("DNS name too long"));
        }
        pos = end;
    }
    Ok((name, resume.unwrap_or(pos)))
}

fn read_record(data: &[u8], pos: usize) -> Result<(DnsRecord, usize), WireError> {
    let (name, pos) = read_name(data, pos)?;
    ensure_len(data, pos + 10)?;
    let rtype = DnsType::from_u16(BigEndian::read_u16(&data[pos..]));
    let class = BigEndian::read_u16(&data[pos + 2..]);
    let ttl = BigEndian::read_u32(&data[pos + 4..]);
    let rdlength = BigEndian::read_u16(&data[pos + 8..]) as usize;
    let start = pos + 10;
    let end = start + rdlength;
    ensure_len(data, end)?;

    let rdata = match rtype {
        _ if class != CLASS_IN => RecordData::Raw(data[start..end].to_vec()),
        DnsType::A if rdlength == 4 => RecordData::A(read_ipv4(&data[start..])),
        DnsType::A => return Err(WireError::Malformed("A record length")),
        DnsType::Ns => RecordData::Ns(read_name(data, start)?.0),
        DnsType::Cname => RecordData::Cname(read_name(data, start)?.0),
        DnsType::Mx => {
            ensure_len(data, start + 2)?;
            RecordData::Mx {
                preference: BigEndian::read_u16(&data[start..]),
                exchange: read_name(data, start + 2)?.0,
            }
        }
        DnsType::Other(_) => RecordData::Raw(data[start..end].to_vec()),
    };
    Ok((
        DnsRecord {
            name,
            rtype,
            class,
            ttl,
            data: rdata,
        },
        end,
    ))
}

/// Rejects names the wire format cannot carry.
fn validate_name(name: &str) -> Result<(), DnsError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DnsError::InvalidName);
    }
    if name.split('.').any(|l| l.is_empty() || l.len() > MAX_LABEL_LEN) {
        return Err(DnsError::InvalidName);
    }
    Ok(())
}

/// The resolved value: an address for A lookups, a host name for CNAME/NS/MX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAnswer {
    Address(Ipv4Addr),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("DNS query timed out")]
    Timeout,
    #[error("name not found")]
    NotFound,
    #[error("DNS server failure (rcode {0})")]
    ServerFailure(u8),
    #[error("no DNS servers configured")]
    NoDnsServers,
    #[error("invalid domain name")]
    InvalidName,
    #[error("DNS server {0} unreachable")]
    Unreachable(Ipv4Addr),
}

pub type DnsCallback = Box<dyn FnOnce(&mut Stack, Result<DnsAnswer, DnsError>)>;

type CacheKey = (DnsType, String);

struct PendingQuery {
    key: CacheKey,
    server: Ipv4Addr,
    timer: TimerId,
    waiters: Vec<DnsCallback>,
}

#[derive(Default)]
pub(crate) struct DnsResolver {
    servers: Vec<Ipv4Addr>,
    cache: HashMap<CacheKey, DnsAnswer>,
    pending: HashMap<u16, PendingQuery>,
    by_key: HashMap<CacheKey, u16>,
    port: Option<u16>,
}

impl Stack {
    pub fn set_dns_servers(&mut self, servers: Vec<Ipv4Addr>) {
        info!(?servers, "DNS servers configured");
        self.dns.servers = servers;
    }

    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.dns.servers
    }

    pub fn dns_cached(&self, domain: &str, qtype: DnsType) -> Option<&DnsAnswer> {
        self.dns.cache.get(&(qtype, normalize(domain)))
    }

    /// Resolve `domain`. The callback runs right away on a cache hit or an immediate failure,
    /// otherwise once the server answers or the query times out.
    pub fn resolve<F>(&mut self, domain: &str, qtype: DnsType, callback: F)
    where
        F: FnOnce(&mut Stack, Result<DnsAnswer, DnsError>) + 'static,
    {
        let key = (qtype, normalize(domain));
        if let Some(answer) = self.dns.cache.get(&key).cloned() {
            trace!(domain = %key.1, "DNS cache hit");
            callback(self, Ok(answer));
            return;
        }
        if let Some(pending) = self.dns.by_key.get(&key).and_then(|id| self.dns.pending.get_mut(id)) {
            pending.waiters.push(Box::new(callback));
            return;
        }
        if let Err(err) = validate_name(&key.1) {
            callback(self, Err(err));
            return;
        }
        if self.dns.servers.is_empty() {
            callback(self, Err(DnsError::NoDnsServers));
            return;
        }

        let port = match self.dns.port {
            Some(port) => port,
            None => match self.udp_listen(0, |stack, datagram| stack.handle_dns(datagram)) {
                Ok(port) => *self.dns.port.insert(port),
                Err(err) => {
                    warn!(%err, "could not bind DNS client port");
                    callback(self, Err(DnsError::Unreachable(Ipv4Addr::UNSPECIFIED)));
                    return;
                }
            },
        };
        let id = loop {
            let id: u16 = self.rng.gen();
            if !self.dns.pending.contains_key(&id) {
                break id;
            }
        };
        let server = self.dns.servers[self.rng.gen_range(0..self.dns.servers.len())];

        let query = DnsMessage::query(id, &key.1, qtype).to_bytes();
        if let Err(err) = self.udp_send(port, server, DNS_PORT, &query) {
            warn!(%server, %err, "could not send DNS query");
            callback(self, Err(DnsError::Unreachable(server)));
            return;
        }
        debug!(id, domain = %key.1, ?qtype, %server, "DNS query sent");
        let timer = self.schedule(self.config.dns_timeout, TimerEvent::DnsTimeout(id));
        self.dns.by_key.insert(key.clone(), id);
        self.dns.pending.insert(
            id,
            PendingQuery {
                key,
                server,
                timer,
                waiters: vec![Box::new(callback)],
            },
        );
    }

    fn handle_dns(&mut self, datagram: UdpDatagram) {
        let message = match DnsMessage::parse(&datagram.data) {
            Ok(message) => message,
            Err(err) => {
                debug!(src = %datagram.src_addr, %err, "dropping malformed DNS message");
                return;
            }
        };
        let Some(pending) = self.dns.pending.get(&message.id) else {
            trace!(id = message.id, "DNS response for no outstanding query");
            return;
        };
        let asked = message
            .questions
            .first()
            .is_some_and(|q| q.name.eq_ignore_ascii_case(&pending.key.1) && q.qtype == pending.key.0);
        if !message.is_response() || datagram.src_addr != pending.server || !asked {
            debug!(id = message.id, src = %datagram.src_addr, "ignoring mismatched DNS response");
            return;
        }
        let Some(pending) = self.dns.pending.remove(&message.id) else {
            return;
        };
        self.dns.by_key.remove(&pending.key);
        self.timers.cancel(pending.timer);

        let (qtype, name) = &pending.key;
        let result = match message.rcode() {
            rcode::NO_ERROR => message.answer_for(name, *qtype).ok_or(DnsError::NotFound),
            rcode::NAME_ERROR => Err(DnsError::NotFound),
            other => Err(DnsError::ServerFailure(other)),
        };
        debug!(id = message.id, domain = %name, ?result, "DNS query answered");
        if let Ok(answer) = &result {
            self.dns.cache.insert(pending.key.clone(), answer.clone());
        }
        for waiter in pending.waiters {
            waiter(self, result.clone());
        }
    }

    pub(crate) fn dns_timeout(&mut self, id: u16) {
        let Some(pending) = self.dns.pending.remove(&id) else {
            return;
        };
        self.dns.by_key.remove(&pending.key);
        warn!(id, domain = %pending.key.1, "DNS query timed out");
        for waiter in pending.waiters {
            waiter(self, Err(DnsError::Timeout));
        }
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY: &[u8] = &[
        0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, //
        0x00, 0x01, 0x00, 0x01,
    ];

    const RESPONSE: &[u8] = &[
        0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, //
        0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, //
        0x00, 0x01, 0x00, 0x01, //
        0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x0e, 0x10, 0x00, 0x04, //
        0x5d, 0xb8, 0xd8, 0x22,
    ];

    #[test]
    fn example_com_query_bytes() {
        assert_eq!(DnsMessage::query(0x1234, "example.com", DnsType::A).to_bytes(), QUERY);
        let parsed = DnsMessage::parse(QUERY).unwrap();
        assert!(!parsed.is_response());
        assert_eq!(
            parsed.questions,
            vec![DnsQuestion {
                name: "example.com".into(),
                qtype: DnsType::A,
                qclass: CLASS_IN,
            }]
        );
    }

    #[test]
    fn example_com_response() {
        let parsed = DnsMessage::parse(RESPONSE).unwrap();
        assert!(parsed.is_response());
        assert_eq!(parsed.rcode(), rcode::NO_ERROR);
        assert_eq!(parsed.questions[0].name, "example.com");
        assert_eq!(parsed.answers[0].ttl, 3600);
        assert_eq!(
            parsed.answer_for("Example.COM", DnsType::A),
            Some(DnsAnswer::Address(Ipv4Addr::new(93, 184, 216, 34)))
        );
        // the answer owner compresses back to the question name
        assert_eq!(parsed.to_bytes(), RESPONSE);
    }

    #[test]
    fn follows_cname_chain() {
        let record = |name: &str, rtype, data| DnsRecord {
            name: String::from(name),
            rtype,
            class: CLASS_IN,
            ttl: 60,
            data,
        };
        let mut message = DnsMessage::query(7, "a.example", DnsType::A);
        message.flags |= FLAG_RESPONSE;
        message.answers = vec![
            record("a.example", DnsType::Cname, RecordData::Cname("b.example".into())),
            record("b.example", DnsType::A, RecordData::A(Ipv4Addr::new(93, 184, 216, 34))),
        ];
        let parsed = DnsMessage::parse(&message.to_bytes()).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(
            parsed.answer_for("a.example", DnsType::A),
            Some(DnsAnswer::Address(Ipv4Addr::new(93, 184, 216, 34)))
        );
        assert_eq!(parsed.answer_for("c.example", DnsType::A), None);
        assert_eq!(parsed.answer_for("a.example", DnsType::Mx), None);
    }

    #[test]
    fn cname_loop_terminates() {
        let mut message = DnsMessage::query(7, "a.example", DnsType::A);
        for (from, to) in [("a.example", "b.example"), ("b.example", "a.example")] {
            message.answers.push(DnsRecord {
                name: from.into(),
                rtype: DnsType::Cname,
                class: CLASS_IN,
                ttl: 60,
                data: RecordData::Cname(to.into()),
            });
        }
        assert_eq!(message.answer_for("a.example", DnsType::A), None);
    }

    #[test]
    fn rejects_pointer_cycles() {
        let mut data = QUERY[..HEADER_LEN].to_vec();
        data.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
        assert_eq!(
            DnsMessage::parse(&data),
            Err(WireError::Malformed("DNS name pointer loop"))
        );

        // two pointers bouncing between each other
        let mut data = QUERY[..HEADER_LEN].to_vec();
        data.extend_from_slice(&[0x01, b'a', 0xc0, 0x10, 0x01, b'b', 0xc0, 0x0c]);
        assert!(DnsMessage::parse(&data).is_err());
    }

    #[test]
    fn rejects_truncated_names() {
        assert!(DnsMessage::parse(&QUERY[..20]).is_err());
        assert!(DnsMessage::parse(&RESPONSE[..RESPONSE.len() - 2]).is_err());
    }

    #[test]
    fn mx_and_ns_resolve_to_names() {
        let mut message = DnsMessage::query(9, "example.org", DnsType::Mx);
        message.answers.push(DnsRecord {
            name: "example.org".into(),
            rtype: DnsType::Mx,
            class: CLASS_IN,
            ttl: 300,
            data: RecordData::Mx {
                preference: 10,
                exchange: "mail.example.org".into(),
            },
        });
        let bytes = message.to_bytes();
        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(
            parsed.answer_for("example.org", DnsType::Mx),
            Some(DnsAnswer::Name("mail.example.org".into()))
        );
        // "example.org" inside the exchange is a pointer
        assert!(bytes.windows(2).any(|w| w == [0xc0, 0x0c]));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("example.com").is_ok());
        assert_eq!(validate_name(""), Err(DnsError::InvalidName));
        assert_eq!(validate_name("a..b"), Err(DnsError::InvalidName));
        assert_eq!(validate_name(&"x".repeat(64)), Err(DnsError::InvalidName));
    }
}
