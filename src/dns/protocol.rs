//! implements the DNS protocol in a transport agnostic fashion

use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::record_parsers::{RecordParser, SoaRecord};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
    #[display(fmt = "unknown query type {}", _0)]
    UnknownQueryType(#[error(not(source))] u16),
    InvalidRecordLength,
    InvalidSoaRecord,
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// The Internet class, the only one in common use
pub const CLASS_INET: u16 = 1;

/// Top bit of the QCLASS word: an mDNS question asking for a unicast reply
const QCLASS_UNICAST_RESPONSE: u16 = 0x8000;

/// Top bit of the rrclass word: the mDNS cache-flush signal on answers
const RRCLASS_CACHE_FLUSH: u16 = 0x8000;

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown takes an integer parameter in order to retain
/// the numeric code of record types outside the supported set. An integer
/// can be converted to a querytype using the `from_num` function, and back
/// to an integer using the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,    // 1
    Soa,  // 6
    Ptr,  // 12
    Txt,  // 16
    Aaaa, // 28
    Srv,  // 33
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Soa => 6,
            QueryType::Ptr => 12,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            6 => QueryType::Soa,
            12 => QueryType::Ptr,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            _ => QueryType::Unknown(num),
        }
    }
}

/// The result code for a DNS query, as described in the specification
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
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
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
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
        self.opcode = (a >> 3) & 0x0F;
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
///
/// The top bit of the QCLASS word is the mDNS unicast-response flag and is
/// kept apart from the numeric class, which survives round-trips untouched
/// in the lower 15 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub class: u16,
    pub unicast_response: bool,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            class: CLASS_INET,
            unicast_response: false,
        }
    }

    pub fn binary_len(&self) -> usize {
        self.name
            .split('.')
            .map(|x| x.len() + 1)
            .fold(5, |x, y| x + y)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;

        let mut rrclass = self.class & !QCLASS_UNICAST_RESPONSE;
        if self.unicast_response {
            rrclass |= QCLASS_UNICAST_RESPONSE;
        }
        buffer.write_u16(rrclass)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;

        let qtype_num = buffer.read_u16()?;
        self.qtype = QueryType::from_num(qtype_num);
        if let QueryType::Unknown(num) = self.qtype {
            return Err(ProtocolError::UnknownQueryType(num));
        }

        let rrclass = buffer.read_u16()?;
        self.class = rrclass & !QCLASS_UNICAST_RESPONSE;
        self.unicast_response = (rrclass & QCLASS_UNICAST_RESPONSE) > 0;

        Ok(())
    }
}

/// Type-specific payload of a resource record
///
/// The set of variants is closed; anything outside it is carried as
/// `Unknown` with an owned copy of the RDATA bytes, so nothing borrows the
/// inbound datagram past decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Txt {
        data: String,
        key: String,
        value: String,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Ptr {
        target: String,
    },
    Unknown(Vec<u8>),
}

impl RecordData {
    pub fn query_type(&self) -> QueryType {
        match *self {
            RecordData::A(..) => QueryType::A,
            RecordData::Aaaa(..) => QueryType::Aaaa,
            RecordData::Txt { .. } => QueryType::Txt,
            RecordData::Srv { .. } => QueryType::Srv,
            RecordData::Ptr { .. } => QueryType::Ptr,
            RecordData::Unknown(..) => QueryType::Unknown(0),
        }
    }
}

/// A resource record: owner name, type and class metadata, and the typed
/// payload. For unknown payloads the numeric type code lives in `qtype`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub qtype: QueryType,
    pub class: u16,
    pub cache_flush: bool,
    pub ttl: u32,
    pub rdata: RecordData,
}

impl DnsRecord {
    pub fn new(name: &str, rdata: RecordData, ttl: u32) -> DnsRecord {
        DnsRecord {
            name: name.to_string(),
            qtype: rdata.query_type(),
            class: CLASS_INET,
            cache_flush: false,
            ttl,
            rdata,
        }
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut name = String::new();
        buffer.read_qname(&mut name)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let rrclass = buffer.read_u16()?;
        let class = rrclass & !RRCLASS_CACHE_FLUSH;
        let cache_flush = (rrclass & RRCLASS_CACHE_FLUSH) > 0;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;
        let data_start = buffer.pos();

        let rdata = match qtype {
            QueryType::A => RecordParser::parse_a(buffer, data_len)?,
            QueryType::Aaaa => RecordParser::parse_aaaa(buffer, data_len)?,
            QueryType::Txt => RecordParser::parse_txt(buffer, data_len)?,
            QueryType::Srv => RecordParser::parse_srv(buffer)?,
            QueryType::Ptr => RecordParser::parse_ptr(buffer)?,
            QueryType::Soa | QueryType::Unknown(_) => {
                RecordParser::parse_unknown(buffer, data_len)?
            }
        };

        // The declared RDLENGTH decides where the next record starts, no
        // matter how much the typed reader consumed.
        buffer.seek(data_start + data_len as usize)?;

        Ok(DnsRecord {
            name,
            qtype,
            class,
            cache_flush,
            ttl,
            rdata,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;

        let mut rrclass = self.class & !RRCLASS_CACHE_FLUSH;
        if self.cache_flush {
            rrclass |= RRCLASS_CACHE_FLUSH;
        }
        buffer.write_u16(rrclass)?;
        buffer.write_u32(self.ttl)?;

        let len_pos = buffer.pos();
        buffer.write_u16(0)?;

        match self.rdata {
            RecordData::A(ref addr) => {
                for octet in addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            RecordData::Aaaa(ref addr) => {
                for octet in addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            RecordData::Txt { ref data, .. } => {
                if data.is_empty() {
                    buffer.write_u8(0)?;
                }
                for chunk in data.as_bytes().chunks(255) {
                    buffer.write_u8(chunk.len() as u8)?;
                    for b in chunk {
                        buffer.write(*b)?;
                    }
                }
            }
            RecordData::Srv {
                priority,
                weight,
                port,
                ref target,
            } => {
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(target)?;
            }
            RecordData::Ptr { ref target } => {
                buffer.write_qname(target)?;
            }
            RecordData::Unknown(ref bytes) => {
                for b in bytes {
                    buffer.write(*b)?;
                }
            }
        }

        let size = buffer.pos() - (len_pos + 2);
        buffer.set_u16(len_pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }

    /// Parse an SOA payload held as `Unknown` bytes.
    pub fn parse_soa(&self) -> Result<SoaRecord> {
        match self.rdata {
            RecordData::Unknown(ref bytes) if self.qtype == QueryType::Soa => {
                RecordParser::parse_soa(bytes)
            }
            _ => Err(ProtocolError::InvalidSoaRecord),
        }
    }
}

/// Representation of a complete DNS packet
///
/// A packet can be read and written in a single operation, and is the unit
/// handed between the codec, the query registry and the multicast engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket {
            header: DnsHeader::new(),
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    /// Encode the packet, updating the header counts to the section lengths
    /// first. Records that would push the encoding past `max_size` are
    /// dropped and the TC bit is set, so a caller bound to the classical
    /// 512 byte datagram passes 512 while mDNS callers pass the link MTU.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();

        let mut size = self.header.binary_len();
        for question in &self.questions {
            question.write(&mut test_buffer)?;
        }
        size += test_buffer.pos();

        let total_records = self.answers.len() + self.authorities.len() + self.resources.len();
        let mut record_count = total_records;
        self.header.truncated_message = false;

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
            }
        }

        let answer_count = record_count.min(self.answers.len());
        let authority_count = record_count
            .saturating_sub(self.answers.len())
            .min(self.authorities.len());
        let resource_count =
            record_count.saturating_sub(self.answers.len() + self.authorities.len());

        self.header.questions = self.questions.len() as u16;
        self.header.answers = answer_count as u16;
        self.header.authoritative_entries = authority_count as u16;
        self.header.resource_entries = resource_count as u16;

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
