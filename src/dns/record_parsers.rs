//! typed RDATA readers keyed on the record type code

use std::net::{Ipv4Addr, Ipv6Addr};

use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::PacketBuffer;
use crate::dns::protocol::{ProtocolError, RecordData};

type Result<T> = std::result::Result<T, ProtocolError>;

/// Start-of-authority payload, parsed on demand from raw RDATA bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoaRecord {
    pub m_name: String,
    pub r_name: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Parser functions for each DNS record type
pub struct RecordParser;

impl RecordParser {
    /// Parse an A record (IPv4 address); the payload is exactly four bytes.
    pub fn parse_a<T: PacketBuffer>(buffer: &mut T, data_len: u16) -> Result<RecordData> {
        if data_len != 4 {
            return Err(ProtocolError::InvalidRecordLength);
        }

        let raw_addr = buffer.read_u32()?;
        let addr = Ipv4Addr::new(
            ((raw_addr >> 24) & 0xFF) as u8,
            ((raw_addr >> 16) & 0xFF) as u8,
            ((raw_addr >> 8) & 0xFF) as u8,
            (raw_addr & 0xFF) as u8,
        );

        Ok(RecordData::A(addr))
    }

    /// Parse an AAAA record (IPv6 address); the payload is exactly sixteen
    /// bytes.
    pub fn parse_aaaa<T: PacketBuffer>(buffer: &mut T, data_len: u16) -> Result<RecordData> {
        if data_len != 16 {
            return Err(ProtocolError::InvalidRecordLength);
        }

        let raw_addr1 = buffer.read_u32()?;
        let raw_addr2 = buffer.read_u32()?;
        let raw_addr3 = buffer.read_u32()?;
        let raw_addr4 = buffer.read_u32()?;

        let addr = Ipv6Addr::new(
            ((raw_addr1 >> 16) & 0xFFFF) as u16,
            (raw_addr1 & 0xFFFF) as u16,
            ((raw_addr2 >> 16) & 0xFFFF) as u16,
            (raw_addr2 & 0xFFFF) as u16,
            ((raw_addr3 >> 16) & 0xFFFF) as u16,
            (raw_addr3 & 0xFFFF) as u16,
            ((raw_addr4 >> 16) & 0xFFFF) as u16,
            (raw_addr4 & 0xFFFF) as u16,
        );

        Ok(RecordData::Aaaa(addr))
    }

    /// Parse a TXT record as the sequence of length-prefixed
    /// character-strings RFC 1035 defines, concatenated.
    ///
    /// The common `k=v` convention is applied on top: when the concatenated
    /// text contains exactly one `=`, key and value carry the split halves,
    /// otherwise both stay empty and only the raw text is populated.
    pub fn parse_txt<T: PacketBuffer>(buffer: &mut T, data_len: u16) -> Result<RecordData> {
        let mut data = String::new();

        let target_pos = buffer.pos() + data_len as usize;
        while buffer.pos() < target_pos {
            let len = buffer.read()? as usize;
            let pos = buffer.pos();
            if pos + len > target_pos {
                return Err(ProtocolError::InvalidRecordLength);
            }
            let str_buffer = buffer.get_range(pos, len)?;
            data.push_str(&String::from_utf8_lossy(str_buffer));
            buffer.step(len)?;
        }

        let (key, value) = if data.matches('=').count() == 1 {
            let mut parts = data.splitn(2, '=');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        } else {
            (String::new(), String::new())
        };

        Ok(RecordData::Txt { data, key, value })
    }

    /// Parse an SRV record (Service)
    pub fn parse_srv<T: PacketBuffer>(buffer: &mut T) -> Result<RecordData> {
        let priority = buffer.read_u16()?;
        let weight = buffer.read_u16()?;
        let port = buffer.read_u16()?;

        let mut target = String::new();
        buffer.read_qname(&mut target)?;

        Ok(RecordData::Srv {
            priority,
            weight,
            port,
            target,
        })
    }

    /// Parse a PTR record (domain name pointer)
    pub fn parse_ptr<T: PacketBuffer>(buffer: &mut T) -> Result<RecordData> {
        let mut target = String::new();
        buffer.read_qname(&mut target)?;

        Ok(RecordData::Ptr { target })
    }

    /// Parse an unknown record type by copying the payload bytes out.
    pub fn parse_unknown<T: PacketBuffer>(buffer: &mut T, data_len: u16) -> Result<RecordData> {
        let pos = buffer.pos();
        let bytes = buffer.get_range(pos, data_len as usize)?.to_vec();
        buffer.step(data_len as usize)?;

        Ok(RecordData::Unknown(bytes))
    }

    /// Parse an SOA payload out of a detached RDATA slice.
    ///
    /// Names inside a detached slice cannot carry compression pointers,
    /// since there is no surrounding message to resolve them against; any
    /// pointer byte, short field or missing terminator fails as
    /// `InvalidSoaRecord`.
    pub fn parse_soa(rdata: &[u8]) -> Result<SoaRecord> {
        let mut pos = 0;

        let m_name = read_plain_name(rdata, &mut pos)?;
        let r_name = read_plain_name(rdata, &mut pos)?;

        let serial = read_u32_at(rdata, &mut pos)?;
        let refresh = read_u32_at(rdata, &mut pos)?;
        let retry = read_u32_at(rdata, &mut pos)?;
        let expire = read_u32_at(rdata, &mut pos)?;
        let minimum = read_u32_at(rdata, &mut pos)?;

        Ok(SoaRecord {
            m_name,
            r_name,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        })
    }
}

fn read_plain_name(data: &[u8], pos: &mut usize) -> Result<String> {
    let mut name = String::new();
    let mut delim = "";

    loop {
        let len = *data.get(*pos).ok_or(ProtocolError::InvalidSoaRecord)? as usize;
        *pos += 1;

        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return Err(ProtocolError::InvalidSoaRecord);
        }

        let label = data
            .get(*pos..*pos + len)
            .ok_or(ProtocolError::InvalidSoaRecord)?;
        name.push_str(delim);
        name.push_str(&String::from_utf8_lossy(label));
        delim = ".";
        *pos += len;
    }

    Ok(name)
}

fn read_u32_at(data: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = data
        .get(*pos..*pos + 4)
        .ok_or(ProtocolError::InvalidSoaRecord)?;
    *pos += 4;

    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

    #[test]
    fn test_txt_character_strings_concatenated() {
        let mut buffer = VectorPacketBuffer::new();
        for part in ["hello ", "world"] {
            buffer.write_u8(part.len() as u8).unwrap();
            for b in part.bytes() {
                buffer.write_u8(b).unwrap();
            }
        }
        let data_len = buffer.pos as u16;

        buffer.seek(0).unwrap();
        let parsed = RecordParser::parse_txt(&mut buffer, data_len).unwrap();
        assert_eq!(
            parsed,
            RecordData::Txt {
                data: "hello world".to_string(),
                key: String::new(),
                value: String::new(),
            }
        );
    }

    #[test]
    fn test_txt_key_value_convention() {
        let mut buffer = VectorPacketBuffer::new();
        let text = "model=printer-3000";
        buffer.write_u8(text.len() as u8).unwrap();
        for b in text.bytes() {
            buffer.write_u8(b).unwrap();
        }
        let data_len = buffer.pos as u16;

        buffer.seek(0).unwrap();
        match RecordParser::parse_txt(&mut buffer, data_len).unwrap() {
            RecordData::Txt { data, key, value } => {
                assert_eq!(data, text);
                assert_eq!(key, "model");
                assert_eq!(value, "printer-3000");
            }
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[test]
    fn test_txt_double_equals_leaves_split_empty() {
        let mut buffer = VectorPacketBuffer::new();
        let text = "a=b=c";
        buffer.write_u8(text.len() as u8).unwrap();
        for b in text.bytes() {
            buffer.write_u8(b).unwrap();
        }
        let data_len = buffer.pos as u16;

        buffer.seek(0).unwrap();
        match RecordParser::parse_txt(&mut buffer, data_len).unwrap() {
            RecordData::Txt { data, key, value } => {
                assert_eq!(data, text);
                assert!(key.is_empty());
                assert!(value.is_empty());
            }
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[test]
    fn test_txt_truncated_character_string_fails() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_u8(10).unwrap();
        for b in b"short" {
            buffer.write_u8(*b).unwrap();
        }
        let data_len = buffer.pos as u16;

        buffer.seek(0).unwrap();
        assert!(matches!(
            RecordParser::parse_txt(&mut buffer, data_len),
            Err(ProtocolError::InvalidRecordLength)
        ));
    }

    #[test]
    fn test_soa_roundtrip() {
        let mut rdata = Vec::new();
        for name in ["ns1.example.com", "hostmaster.example.com"] {
            for label in name.split('.') {
                rdata.push(label.len() as u8);
                rdata.extend_from_slice(label.as_bytes());
            }
            rdata.push(0);
        }
        for val in [2024080101u32, 7200, 3600, 1209600, 300] {
            rdata.extend_from_slice(&val.to_be_bytes());
        }

        let soa = RecordParser::parse_soa(&rdata).unwrap();
        assert_eq!(soa.m_name, "ns1.example.com");
        assert_eq!(soa.r_name, "hostmaster.example.com");
        assert_eq!(soa.serial, 2024080101);
        assert_eq!(soa.refresh, 7200);
        assert_eq!(soa.retry, 3600);
        assert_eq!(soa.expire, 1209600);
        assert_eq!(soa.minimum, 300);
    }

    #[test]
    fn test_soa_truncated_fails() {
        let mut rdata = Vec::new();
        rdata.push(3);
        rdata.extend_from_slice(b"ns1");
        rdata.push(0);
        rdata.push(0);
        rdata.extend_from_slice(&[0, 0, 0, 1]);

        assert!(matches!(
            RecordParser::parse_soa(&rdata),
            Err(ProtocolError::InvalidSoaRecord)
        ));
    }

    #[test]
    fn test_soa_pointer_rejected() {
        let rdata = vec![0xC0, 0x0C];

        assert!(matches!(
            RecordParser::parse_soa(&rdata),
            Err(ProtocolError::InvalidSoaRecord)
        ));
    }
}
