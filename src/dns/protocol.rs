//! DNS protocol types, transport agnostic
//!
//! Records are a single struct carrying owner name, type, class, TTL and a
//! typed rdata payload. Keeping the class explicit matters here: RFC 2136
//! encodes the update operation in the record class (IN add, ANY delete
//! rrset, NONE delete datum), so it cannot be discarded at parse time.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
    #[display(fmt = "malformed rdata text: {}", _0)]
    #[from(ignore)]
    BadRdataText(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, ProtocolError>;

pub const CLASS_IN: u16 = 1;
pub const CLASS_NONE: u16 = 254;
pub const CLASS_ANY: u16 = 255;

/// Message opcodes this server dispatches on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Opcode {
    #[default]
    Query,
    Update,
    Unknown(u8),
}

impl Opcode {
    pub fn from_num(num: u8) -> Opcode {
        match num {
            0 => Opcode::Query,
            5 => Opcode::Update,
            x => Opcode::Unknown(x),
        }
    }

    pub fn to_num(self) -> u8 {
        match self {
            Opcode::Query => 0,
            Opcode::Update => 5,
            Opcode::Unknown(x) => x,
        }
    }
}

/// Response codes used by the server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    NOERROR,
    FORMERR,
    SERVFAIL,
    NXDOMAIN,
    NOTIMP,
    REFUSED,
    NOTAUTH,
    UNKNOWN(u8),
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            9 => ResultCode::NOTAUTH,
            x => ResultCode::UNKNOWN(x),
        }
    }

    pub fn to_num(self) -> u8 {
        match self {
            ResultCode::NOERROR => 0,
            ResultCode::FORMERR => 1,
            ResultCode::SERVFAIL => 2,
            ResultCode::NXDOMAIN => 3,
            ResultCode::NOTIMP => 4,
            ResultCode::REFUSED => 5,
            ResultCode::NOTAUTH => 9,
            ResultCode::UNKNOWN(x) => x,
        }
    }
}

/// `QueryType` represents the record type of a question or record.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Mx,    // 15
    Txt,   // 16
    Aaaa,  // 28
    Srv,   // 33
    Opt,   // 41
    Tsig,  // 250
    Any,   // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
            QueryType::Tsig => 250,
            QueryType::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            250 => QueryType::Tsig,
            255 => QueryType::Any,
            _ => QueryType::Unknown(num),
        }
    }

    /// Uppercase mnemonic as stored in the rrset table.
    pub fn name(&self) -> String {
        match *self {
            QueryType::A => "A".to_string(),
            QueryType::Ns => "NS".to_string(),
            QueryType::Cname => "CNAME".to_string(),
            QueryType::Soa => "SOA".to_string(),
            QueryType::Mx => "MX".to_string(),
            QueryType::Txt => "TXT".to_string(),
            QueryType::Aaaa => "AAAA".to_string(),
            QueryType::Srv => "SRV".to_string(),
            QueryType::Opt => "OPT".to_string(),
            QueryType::Tsig => "TSIG".to_string(),
            QueryType::Any => "ANY".to_string(),
            QueryType::Unknown(x) => format!("TYPE{}", x),
        }
    }

    pub fn from_name(name: &str) -> QueryType {
        match name.to_uppercase().as_str() {
            "A" => QueryType::A,
            "NS" => QueryType::Ns,
            "CNAME" => QueryType::Cname,
            "SOA" => QueryType::Soa,
            "MX" => QueryType::Mx,
            "TXT" => QueryType::Txt,
            "AAAA" => QueryType::Aaaa,
            "SRV" => QueryType::Srv,
            "OPT" => QueryType::Opt,
            "TSIG" => QueryType::Tsig,
            "ANY" => QueryType::Any,
            other => {
                if let Some(num) = other
                    .strip_prefix("TYPE")
                    .and_then(|n| n.parse::<u16>().ok())
                {
                    QueryType::from_num(num)
                } else {
                    QueryType::Unknown(0)
                }
            }
        }
    }
}

/// Ensure a trailing dot.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// TSIG rdata fields (RFC 8945 wire layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsigData {
    /// Algorithm name, lowercase, no trailing dot.
    pub algorithm: String,
    /// 48-bit seconds since the unix epoch.
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other: Vec<u8>,
}

/// Typed rdata payload of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Cname(String),
    Mx {
        priority: u16,
        host: String,
    },
    Txt(String),
    Soa {
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
    },
    /// Raw EDNS0 option bytes.
    Opt(Vec<u8>),
    Tsig(TsigData),
    /// Zero-length rdata, as carried by ANY-class deletions.
    Empty,
    Unknown(Vec<u8>),
}

impl RData {
    /// Zone-file presentation of the rdata, the form stored in the rdata
    /// table and exchanged in snapshots.
    pub fn to_text(&self) -> String {
        match *self {
            RData::A(addr) => addr.to_string(),
            RData::Aaaa(addr) => addr.to_string(),
            RData::Ns(ref host) => fqdn(host),
            RData::Cname(ref host) => fqdn(host),
            RData::Mx {
                priority,
                ref host,
            } => format!("{} {}", priority, fqdn(host)),
            RData::Txt(ref data) => format!("\"{}\"", data),
            RData::Soa {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => format!(
                "{} {} {} {} {} {} {}",
                fqdn(m_name),
                fqdn(r_name),
                serial,
                refresh,
                retry,
                expire,
                minimum
            ),
            RData::Srv {
                priority,
                weight,
                port,
                ref host,
            } => format!("{} {} {} {}", priority, weight, port, fqdn(host)),
            RData::Opt(_) | RData::Tsig(_) | RData::Empty => String::new(),
            RData::Unknown(ref bytes) => format!("\\# {}", bytes.len()),
        }
    }

    /// Parse the zone-file presentation back into typed rdata.
    pub fn from_text(rtype: QueryType, text: &str) -> Result<RData> {
        let bad = || ProtocolError::BadRdataText(format!("{} {}", rtype.name(), text));
        let text = text.trim();
        match rtype {
            QueryType::A => text
                .parse::<Ipv4Addr>()
                .map(RData::A)
                .map_err(|_| bad()),
            QueryType::Aaaa => text
                .parse::<Ipv6Addr>()
                .map(RData::Aaaa)
                .map_err(|_| bad()),
            QueryType::Ns => Ok(RData::Ns(text.trim_end_matches('.').to_string())),
            QueryType::Cname => Ok(RData::Cname(text.trim_end_matches('.').to_string())),
            QueryType::Mx => {
                let mut parts = text.split_whitespace();
                let priority = parts
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(bad)?;
                let host = parts.next().ok_or_else(bad)?;
                Ok(RData::Mx {
                    priority,
                    host: host.trim_end_matches('.').to_string(),
                })
            }
            QueryType::Txt => {
                let inner = text
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .unwrap_or(text);
                Ok(RData::Txt(inner.to_string()))
            }
            QueryType::Soa => {
                let parts: Vec<&str> = text.split_whitespace().collect();
                if parts.len() < 7 {
                    return Err(bad());
                }
                let num = |i: usize| parts[i].parse::<u32>().map_err(|_| bad());
                Ok(RData::Soa {
                    m_name: parts[0].trim_end_matches('.').to_string(),
                    r_name: parts[1].trim_end_matches('.').to_string(),
                    serial: num(2)?,
                    refresh: num(3)?,
                    retry: num(4)?,
                    expire: num(5)?,
                    minimum: num(6)?,
                })
            }
            QueryType::Srv => {
                let parts: Vec<&str> = text.split_whitespace().collect();
                if parts.len() < 4 {
                    return Err(bad());
                }
                let num = |i: usize| parts[i].parse::<u16>().map_err(|_| bad());
                Ok(RData::Srv {
                    priority: num(0)?,
                    weight: num(1)?,
                    port: num(2)?,
                    host: parts[3].trim_end_matches('.').to_string(),
                })
            }
            _ => Err(bad()),
        }
    }
}

/// A single resource record in any message section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: QueryType,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn new(name: &str, rtype: QueryType, ttl: u32, rdata: RData) -> DnsRecord {
        DnsRecord {
            name: name.trim_end_matches('.').to_string(),
            rtype,
            class: CLASS_IN,
            ttl,
            rdata,
        }
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut name = String::new();
        buffer.read_qname(&mut name)?;

        let rtype_num = buffer.read_u16()?;
        let rtype = QueryType::from_num(rtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()? as usize;

        let rdata = if data_len == 0 {
            RData::Empty
        } else {
            match rtype {
                QueryType::A => {
                    let raw = buffer.read_u32()?;
                    RData::A(Ipv4Addr::from(raw))
                }
                QueryType::Aaaa => {
                    let mut octets = [0u8; 16];
                    for chunk in octets.chunks_mut(4) {
                        chunk.copy_from_slice(&buffer.read_u32()?.to_be_bytes());
                    }
                    RData::Aaaa(Ipv6Addr::from(octets))
                }
                QueryType::Ns => {
                    let mut host = String::new();
                    buffer.read_qname(&mut host)?;
                    RData::Ns(host)
                }
                QueryType::Cname => {
                    let mut host = String::new();
                    buffer.read_qname(&mut host)?;
                    RData::Cname(host)
                }
                QueryType::Mx => {
                    let priority = buffer.read_u16()?;
                    let mut host = String::new();
                    buffer.read_qname(&mut host)?;
                    RData::Mx { priority, host }
                }
                QueryType::Txt => {
                    // Concatenated character-strings.
                    let mut txt = String::new();
                    let mut remaining = data_len;
                    while remaining > 0 {
                        let len = buffer.read()? as usize;
                        remaining -= 1;
                        let cur = buffer.pos();
                        txt.push_str(&String::from_utf8_lossy(
                            buffer.get_range(cur, len)?,
                        ));
                        buffer.step(len)?;
                        remaining = remaining.saturating_sub(len);
                    }
                    RData::Txt(txt)
                }
                QueryType::Soa => {
                    let mut m_name = String::new();
                    buffer.read_qname(&mut m_name)?;
                    let mut r_name = String::new();
                    buffer.read_qname(&mut r_name)?;
                    RData::Soa {
                        m_name,
                        r_name,
                        serial: buffer.read_u32()?,
                        refresh: buffer.read_u32()?,
                        retry: buffer.read_u32()?,
                        expire: buffer.read_u32()?,
                        minimum: buffer.read_u32()?,
                    }
                }
                QueryType::Srv => {
                    let priority = buffer.read_u16()?;
                    let weight = buffer.read_u16()?;
                    let port = buffer.read_u16()?;
                    let mut host = String::new();
                    buffer.read_qname(&mut host)?;
                    RData::Srv {
                        priority,
                        weight,
                        port,
                        host,
                    }
                }
                QueryType::Opt => {
                    let cur = buffer.pos();
                    let data = buffer.get_range(cur, data_len)?.to_vec();
                    buffer.step(data_len)?;
                    RData::Opt(data)
                }
                QueryType::Tsig => {
                    let mut algorithm = String::new();
                    buffer.read_qname(&mut algorithm)?;
                    let time_hi = buffer.read_u16()? as u64;
                    let time_lo = buffer.read_u32()? as u64;
                    let fudge = buffer.read_u16()?;
                    let mac_size = buffer.read_u16()? as usize;
                    let cur = buffer.pos();
                    let mac = buffer.get_range(cur, mac_size)?.to_vec();
                    buffer.step(mac_size)?;
                    let original_id = buffer.read_u16()?;
                    let error = buffer.read_u16()?;
                    let other_len = buffer.read_u16()? as usize;
                    let cur = buffer.pos();
                    let other = buffer.get_range(cur, other_len)?.to_vec();
                    buffer.step(other_len)?;
                    RData::Tsig(TsigData {
                        algorithm,
                        time_signed: (time_hi << 32) | time_lo,
                        fudge,
                        mac,
                        original_id,
                        error,
                        other,
                    })
                }
                _ => {
                    let cur = buffer.pos();
                    let data = buffer.get_range(cur, data_len)?.to_vec();
                    buffer.step(data_len)?;
                    RData::Unknown(data)
                }
            }
        };

        Ok(DnsRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.rtype.to_num())?;
        buffer.write_u16(self.class)?;
        buffer.write_u32(self.ttl)?;

        let len_pos = buffer.pos();
        buffer.write_u16(0)?;
        let data_start = buffer.pos();

        match self.rdata {
            RData::A(addr) => {
                for octet in addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            RData::Aaaa(addr) => {
                for segment in addr.segments() {
                    buffer.write_u16(segment)?;
                }
            }
            RData::Ns(ref host) | RData::Cname(ref host) => {
                buffer.write_qname(host)?;
            }
            RData::Mx {
                priority,
                ref host,
            } => {
                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;
            }
            RData::Txt(ref data) => {
                // Split into 255-byte character-strings.
                for chunk in data.as_bytes().chunks(255) {
                    buffer.write_u8(chunk.len() as u8)?;
                    for b in chunk {
                        buffer.write_u8(*b)?;
                    }
                }
            }
            RData::Soa {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;
            }
            RData::Srv {
                priority,
                weight,
                port,
                ref host,
            } => {
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(host)?;
            }
            RData::Opt(ref data) | RData::Unknown(ref data) => {
                for b in data {
                    buffer.write_u8(*b)?;
                }
            }
            RData::Tsig(ref tsig) => {
                // Algorithm names are never compressed.
                for label in tsig.algorithm.split('.').filter(|l| !l.is_empty()) {
                    buffer.write_u8(label.len() as u8)?;
                    for b in label.as_bytes() {
                        buffer.write_u8(*b)?;
                    }
                }
                buffer.write_u8(0)?;
                buffer.write_u16((tsig.time_signed >> 32) as u16)?;
                buffer.write_u32((tsig.time_signed & 0xFFFF_FFFF) as u32)?;
                buffer.write_u16(tsig.fudge)?;
                buffer.write_u16(tsig.mac.len() as u16)?;
                for b in &tsig.mac {
                    buffer.write_u8(*b)?;
                }
                buffer.write_u16(tsig.original_id)?;
                buffer.write_u16(tsig.error)?;
                buffer.write_u16(tsig.other.len() as u16)?;
                for b in &tsig.other {
                    buffer.write_u8(*b)?;
                }
            }
            RData::Empty => {}
        }

        let size = buffer.pos() - data_start;
        buffer.set_u16(len_pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: Opcode,             // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode.to_num() << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            self.rescode.to_num()
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = Opcode::from_num((a >> 3) & 0x0F);
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion { name, qtype }
    }

    pub fn binary_len(&self) -> usize {
        self.name
            .split('.')
            .filter(|x| !x.is_empty())
            .map(|x| x.len() + 1)
            .fold(1 + 4, |x, y| x + y)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(CLASS_IN)?;
        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        let _ = buffer.read_u16()?; // class
        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.qtype.name())
    }
}

/// Representation of a complete DNS message
///
/// For QUERY messages the sections carry question/answer/authority/
/// additional records. For UPDATE messages (RFC 2136) the same slots hold
/// zone/prerequisite/update/additional data, so `authorities` is where
/// update operations arrive.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    /// Start a reply: id, opcode and question section mirror the request.
    pub fn reply_to(request: &DnsPacket) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = request.header.id;
        packet.header.opcode = request.header.opcode;
        packet.header.response = true;
        packet.questions = request.questions.clone();
        packet
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new(String::new(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            result.answers.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.authoritative_entries {
            result.authorities.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.resource_entries {
            result.resources.push(DnsRecord::read(buffer)?);
        }

        Ok(result)
    }

    /// The EDNS0 UDP payload size advertised by the client, if any.
    pub fn edns_payload_size(&self) -> Option<usize> {
        self.resources
            .iter()
            .find(|r| r.rtype == QueryType::Opt)
            .map(|r| r.class as usize)
    }

    /// Extract the EDNS Client Subnet address (RFC 7871) if present.
    /// Family 1 addresses are truncated to 4 bytes.
    pub fn client_subnet(&self) -> Option<IpAddr> {
        let opt = self
            .resources
            .iter()
            .find(|r| r.rtype == QueryType::Opt)?;
        let data = match opt.rdata {
            RData::Opt(ref data) => data,
            _ => return None,
        };

        let mut pos = 0;
        while pos + 4 <= data.len() {
            let code = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 4;
            if pos + len > data.len() {
                return None;
            }
            if code == 8 && len >= 4 {
                let option = &data[pos..pos + len];
                let family = u16::from_be_bytes([option[0], option[1]]);
                let addr_bytes = &option[4..];
                match family {
                    1 => {
                        let mut octets = [0u8; 4];
                        let n = addr_bytes.len().min(4);
                        octets[..n].copy_from_slice(&addr_bytes[..n]);
                        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
                    }
                    2 => {
                        let mut octets = [0u8; 16];
                        let n = addr_bytes.len().min(16);
                        octets[..n].copy_from_slice(&addr_bytes[..n]);
                        return Some(IpAddr::V6(Ipv6Addr::from(octets)));
                    }
                    _ => return None,
                }
            }
            pos += len;
        }
        None
    }

    /// Append an OPT record carrying an ECS option. Used by clients and
    /// tests; the server itself never echoes ECS back.
    pub fn add_client_subnet(&mut self, addr: IpAddr, prefix_len: u8) {
        let mut option = Vec::new();
        let (family, octets): (u16, Vec<u8>) = match addr {
            IpAddr::V4(v4) => (1, v4.octets().to_vec()),
            IpAddr::V6(v6) => (2, v6.octets().to_vec()),
        };
        option.extend_from_slice(&family.to_be_bytes());
        option.push(prefix_len);
        option.push(0);
        let byte_len = ((prefix_len as usize) + 7) / 8;
        option.extend_from_slice(&octets[..byte_len.min(octets.len())]);

        let mut data = Vec::new();
        data.extend_from_slice(&8u16.to_be_bytes());
        data.extend_from_slice(&(option.len() as u16).to_be_bytes());
        data.extend_from_slice(&option);

        self.resources.push(DnsRecord {
            name: String::new(),
            rtype: QueryType::Opt,
            class: 4096, // advertised payload size
            ttl: 0,
            rdata: RData::Opt(data),
        });
    }

    /// The TSIG record, which must be the last record of the additional
    /// section when present.
    pub fn tsig(&self) -> Option<(&DnsRecord, &TsigData)> {
        let last = self.resources.last()?;
        match last.rdata {
            RData::Tsig(ref tsig) if last.rtype == QueryType::Tsig => Some((last, tsig)),
            _ => None,
        }
    }

    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();

        let mut size = self.header.binary_len();
        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        let mut record_count = self.answers.len() + self.authorities.len() + self.resources.len();

        self.header.answers = 0;
        self.header.authoritative_entries = 0;
        self.header.resource_entries = 0;

        for (i, rec) in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                record_count = i;
                self.header.truncated_message = true;
                break;
            } else if i < self.answers.len() {
                self.header.answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                self.header.authoritative_entries += 1;
            } else {
                self.header.resource_entries += 1;
            }
        }

        self.header.questions = self.questions.len() as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

    #[test]
    fn test_packet_roundtrip() {
        let mut packet = DnsPacket::new();
        packet.header.id = 1337;
        packet.header.response = true;
        packet.header.authoritative_answer = true;

        packet
            .questions
            .push(DnsQuestion::new("svc.geodns.test".to_string(), QueryType::A));
        packet.answers.push(DnsRecord::new(
            "svc.geodns.test",
            QueryType::A,
            60,
            RData::A("198.51.100.13".parse().unwrap()),
        ));
        packet.answers.push(DnsRecord::new(
            "svc.geodns.test",
            QueryType::Mx,
            60,
            RData::Mx {
                priority: 10,
                host: "mail.geodns.test".to_string(),
            },
        ));

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
        assert_eq!(parsed.header.id, 1337);
        assert!(parsed.header.authoritative_answer);
        assert_eq!(parsed.questions[0], packet.questions[0]);
        assert_eq!(parsed.answers[0], packet.answers[0]);
        assert_eq!(parsed.answers[1], packet.answers[1]);
    }

    #[test]
    fn test_update_opcode_and_class_preserved() {
        let mut packet = DnsPacket::new();
        packet.header.id = 7;
        packet.header.opcode = Opcode::Update;
        packet
            .questions
            .push(DnsQuestion::new("adddel.test".to_string(), QueryType::Soa));

        let mut del = DnsRecord::new("www.adddel.test", QueryType::A, 0, RData::Empty);
        del.class = CLASS_ANY;
        packet.authorities.push(del);

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
        assert_eq!(parsed.header.opcode, Opcode::Update);
        assert_eq!(parsed.authorities.len(), 1);
        assert_eq!(parsed.authorities[0].class, CLASS_ANY);
        assert_eq!(parsed.authorities[0].rdata, RData::Empty);
    }

    #[test]
    fn test_ecs_roundtrip_v4() {
        let mut packet = DnsPacket::new();
        packet
            .questions
            .push(DnsQuestion::new("svc.geodns.test".to_string(), QueryType::A));
        packet.add_client_subnet("8.8.8.8".parse().unwrap(), 24);

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
        // /24 keeps the first three octets.
        assert_eq!(
            parsed.client_subnet(),
            Some("8.8.8.0".parse::<IpAddr>().unwrap())
        );
        assert_eq!(parsed.edns_payload_size(), Some(4096));
    }

    #[test]
    fn test_ecs_v6() {
        let mut packet = DnsPacket::new();
        packet
            .questions
            .push(DnsQuestion::new("svc.geodns.test".to_string(), QueryType::Aaaa));
        packet.add_client_subnet("2001:db8::1".parse().unwrap(), 128);

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
        assert_eq!(
            parsed.client_subnet(),
            Some("2001:db8::1".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_rdata_text_reparse_equivalence() {
        let cases: Vec<(QueryType, RData)> = vec![
            (QueryType::A, RData::A("192.0.2.3".parse().unwrap())),
            (QueryType::Aaaa, RData::Aaaa("2001:db8::5".parse().unwrap())),
            (QueryType::Ns, RData::Ns("ns1.example.com".to_string())),
            (QueryType::Cname, RData::Cname("bar.example.net".to_string())),
            (
                QueryType::Mx,
                RData::Mx {
                    priority: 10,
                    host: "mail.example.com".to_string(),
                },
            ),
            (QueryType::Txt, RData::Txt("v=spf1 -all".to_string())),
            (
                QueryType::Soa,
                RData::Soa {
                    m_name: "ns1.example.com".to_string(),
                    r_name: "hostmaster.example.com".to_string(),
                    serial: 2025010101,
                    refresh: 7200,
                    retry: 3600,
                    expire: 1209600,
                    minimum: 300,
                },
            ),
            (
                QueryType::Srv,
                RData::Srv {
                    priority: 0,
                    weight: 5,
                    port: 443,
                    host: "svc.example.com".to_string(),
                },
            ),
        ];

        for (rtype, rdata) in cases {
            let text = rdata.to_text();
            let reparsed = RData::from_text(rtype, &text).unwrap();
            assert_eq!(reparsed, rdata, "type {}", rtype.name());
        }
    }

    #[test]
    fn test_from_text_rejects_garbage() {
        assert!(RData::from_text(QueryType::A, "not-an-ip").is_err());
        assert!(RData::from_text(QueryType::Soa, "too few tokens").is_err());
        assert!(RData::from_text(QueryType::Mx, "prio-only").is_err());
    }

    #[test]
    fn test_truncation_sets_tc() {
        let mut packet = DnsPacket::new();
        packet
            .questions
            .push(DnsQuestion::new("big.example.com".to_string(), QueryType::A));
        for i in 0..64 {
            packet.answers.push(DnsRecord::new(
                "big.example.com",
                QueryType::A,
                60,
                RData::A(format!("192.0.2.{}", i).parse().unwrap()),
            ));
        }

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 512).unwrap();
        assert!(packet.header.truncated_message);
        assert!((packet.header.answers as usize) < 64);
    }
}
