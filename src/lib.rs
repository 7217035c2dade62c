//! Beacon
//!
//! An embeddable DNS/mDNS message codec with an asynchronous query engine.
//!
//! # Features
//!
//! * RFC 1035 wire format with name compression on encode and decode
//! * Correlation of in-flight queries by transaction id, with streaming
//!   callbacks, timeouts and cancellation
//! * Unicast UDP client for classical DNS lookups
//! * RFC 6762 multicast DNS: group membership per interface, a responder
//!   with the standard randomized response delay, and streaming queries
//! * Typed lookup helpers for A, AAAA, SRV, TXT and PTR records
//!
//! # Architecture
//!
//! All functionality lives under the `dns` module. Network drivers are
//! tokio tasks owning their channel's state; callers interact through
//! command channels and one-shot completion handles.

/// DNS codec, query engine and mDNS transport
pub mod dns;
