//! Integration tests for the DNS codec with real packet data

use beacon::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use beacon::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, RecordData};
use std::net::Ipv4Addr;

/// Helper to create a DNS packet from raw bytes
fn parse_dns_packet(data: &[u8]) -> Result<DnsPacket, Box<dyn std::error::Error>> {
    let mut buffer = VectorPacketBuffer::from_bytes(data);
    DnsPacket::from_buffer(&mut buffer).map_err(|e| e.into())
}

#[test]
fn test_real_a_record_response() {
    // Captured response for a google.com A record query
    let packet_data = vec![
        // DNS Header
        0x12, 0x34, // Transaction ID
        0x81, 0x80, // Flags: Response, Recursion Desired, Recursion Available
        0x00, 0x01, // Questions: 1
        0x00, 0x01, // Answer RRs: 1
        0x00, 0x00, // Authority RRs: 0
        0x00, 0x00, // Additional RRs: 0
        // Question Section
        0x06, b'g', b'o', b'o', b'g', b'l', b'e', // google
        0x03, b'c', b'o', b'm', // com
        0x00, // Root label
        0x00, 0x01, // Type: A
        0x00, 0x01, // Class: IN
        // Answer Section
        0xC0, 0x0C, // Name: pointer to offset 12 (google.com)
        0x00, 0x01, // Type: A
        0x00, 0x01, // Class: IN
        0x00, 0x00, 0x01, 0x2C, // TTL: 300 seconds
        0x00, 0x04, // Data length: 4
        0x8E, 0xFA, 0xBD, 0x0E, // IP: 142.250.189.14
    ];

    let packet = parse_dns_packet(&packet_data).expect("Failed to parse packet");

    assert_eq!(packet.header.id, 0x1234);
    assert!(packet.header.response);
    assert!(packet.header.recursion_available);

    assert_eq!(packet.questions.len(), 1);
    assert_eq!(packet.questions[0].name, "google.com");
    assert_eq!(packet.questions[0].qtype, QueryType::A);

    assert_eq!(packet.answers.len(), 1);
    assert_eq!(packet.answers[0].name, "google.com");
    assert_eq!(packet.answers[0].ttl, 300);
    assert_eq!(
        packet.answers[0].rdata,
        RecordData::A(Ipv4Addr::new(142, 250, 189, 14))
    );
}

#[test]
fn test_example_a_rdata_bytes() {
    let mut response = DnsPacket::new();
    response.header.id = 1;
    response.header.response = true;
    response.answers.push(DnsRecord::new(
        "example.com",
        RecordData::A(Ipv4Addr::new(93, 184, 216, 34)),
        300,
    ));

    let mut buffer = VectorPacketBuffer::new();
    response.write(&mut buffer, 512).unwrap();

    assert_eq!(&buffer.buffer[buffer.pos - 4..], &[0x5D, 0xB8, 0xD8, 0x22]);

    buffer.seek(0).unwrap();
    let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
    assert_eq!(
        parsed.answers[0].rdata,
        RecordData::A(Ipv4Addr::new(93, 184, 216, 34))
    );
}

#[test]
fn test_mdns_ptr_response_with_cache_flush() {
    // mDNS answer with the cache-flush bit set on an IN-class PTR record
    let packet_data = vec![
        0x00, 0x00, // Transaction ID: mDNS responses use 0
        0x84, 0x00, // Flags: Response, Authoritative
        0x00, 0x00, // Questions: 0
        0x00, 0x01, // Answer RRs: 1
        0x00, 0x00, // Authority RRs: 0
        0x00, 0x00, // Additional RRs: 0
        // Answer: _fake._tcp.local PTR test._fake._tcp.local
        0x05, b'_', b'f', b'a', b'k', b'e', //
        0x04, b'_', b't', b'c', b'p', //
        0x05, b'l', b'o', b'c', b'a', b'l', //
        0x00, //
        0x00, 0x0C, // Type: PTR
        0x80, 0x01, // Class: IN with cache-flush bit
        0x00, 0x00, 0x00, 0x0A, // TTL: 10
        0x00, 0x07, // Data length
        0x04, b't', b'e', b's', b't', // test
        0xC0, 0x0C, // pointer to _fake._tcp.local at offset 12
    ];

    let packet = parse_dns_packet(&packet_data).expect("Failed to parse packet");

    assert_eq!(packet.answers.len(), 1);
    let answer = &packet.answers[0];
    assert_eq!(answer.name, "_fake._tcp.local");
    assert_eq!(answer.qtype, QueryType::Ptr);
    assert_eq!(answer.class, 1);
    assert!(answer.cache_flush);
    assert_eq!(answer.ttl, 10);
    assert_eq!(
        answer.rdata,
        RecordData::Ptr {
            target: "test._fake._tcp.local".to_string()
        }
    );
}

#[test]
fn test_unicast_response_question_bit() {
    // mDNS question with the unicast-response bit on the QCLASS word
    let packet_data = vec![
        0x00, 0x00, 0x00, 0x00, //
        0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x07, b'p', b'r', b'i', b'n', b't', b'e', b'r', //
        0x05, b'l', b'o', b'c', b'a', b'l', //
        0x00, //
        0x00, 0x0C, // Type: PTR
        0x80, 0x01, // Class: IN with unicast-response bit
    ];

    let packet = parse_dns_packet(&packet_data).expect("Failed to parse packet");

    assert_eq!(packet.questions.len(), 1);
    assert_eq!(packet.questions[0].name, "printer.local");
    assert_eq!(packet.questions[0].class, 1);
    assert!(packet.questions[0].unicast_response);
}

#[test]
fn test_compressed_questions_match_uncompressed() {
    let mut packet = DnsPacket::new();
    packet.header.id = 99;
    packet
        .questions
        .push(DnsQuestion::new("a.example.com".to_string(), QueryType::A));
    packet
        .questions
        .push(DnsQuestion::new("b.example.com".to_string(), QueryType::A));

    let mut compressed = VectorPacketBuffer::new();
    packet.clone().write(&mut compressed, 0xFFFF).unwrap();

    let mut uncompressed = BytePacketBuffer::new();
    packet.clone().write(&mut uncompressed, 512).unwrap();
    assert!(compressed.pos < uncompressed.pos);

    // the second question collapses to one label plus a pointer to the
    // first name's "example.com" suffix, which sits at offset 14 right
    // after the 12 byte header and the 2 byte "a" label
    let second_name = &compressed.buffer[compressed.pos - 8..compressed.pos - 4];
    assert_eq!(second_name, &[0x01, b'b', 0xC0, 0x0E]);

    compressed.seek(0).unwrap();
    let from_compressed = DnsPacket::from_buffer(&mut compressed).unwrap();

    uncompressed.seek(0).unwrap();
    let from_uncompressed = DnsPacket::from_buffer(&mut uncompressed).unwrap();

    assert_eq!(from_compressed, from_uncompressed);
    assert_eq!(from_compressed.questions[1].name, "b.example.com");
}

#[test]
fn test_soa_parse_on_demand_from_answer() {
    // SOA answer; the codec keeps the payload opaque until asked
    let mut packet_data = vec![
        0x00, 0x01, 0x84, 0x00, //
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, //
        0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', //
        0x03, b'c', b'o', b'm', //
        0x00, //
        0x00, 0x06, // Type: SOA
        0x00, 0x01, // Class: IN
        0x00, 0x00, 0x0E, 0x10, // TTL: 3600
    ];

    let mut rdata = Vec::new();
    for name in ["ns1.example.com", "admin.example.com"] {
        for label in name.split('.') {
            rdata.push(label.len() as u8);
            rdata.extend_from_slice(label.as_bytes());
        }
        rdata.push(0);
    }
    for val in [2024u32, 7200, 3600, 1209600, 60] {
        rdata.extend_from_slice(&val.to_be_bytes());
    }

    packet_data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    packet_data.extend_from_slice(&rdata);

    let packet = parse_dns_packet(&packet_data).expect("Failed to parse packet");

    let answer = &packet.answers[0];
    assert_eq!(answer.qtype, QueryType::Soa);
    assert!(matches!(answer.rdata, RecordData::Unknown(_)));

    let soa = answer.parse_soa().expect("Failed to parse SOA payload");
    assert_eq!(soa.m_name, "ns1.example.com");
    assert_eq!(soa.r_name, "admin.example.com");
    assert_eq!(soa.serial, 2024);
    assert_eq!(soa.minimum, 60);
}

#[test]
fn test_truncated_packet_fails() {
    // header claims one answer but the section is cut short
    let packet_data = vec![
        0x00, 0x01, 0x80, 0x00, //
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, //
        0x03, b'f', b'o', b'o',
    ];

    assert!(parse_dns_packet(&packet_data).is_err());
}
