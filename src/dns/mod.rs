//! DNS/mDNS Codec and Query Engine
//!
//! This module provides the pieces of the protocol stack:
//! * DNS packet parsing and serialization with name compression
//! * Correlation of outstanding queries with inbound responses
//! * A unicast UDP client for classical DNS queries
//! * Multicast group transport for mDNS querying and responding
//! * Typed lookup helpers over the client
//!
//! # Module Structure
//!
//! * `buffer` - Low-level packet buffer operations and the label codec
//! * `protocol` - DNS protocol definitions and packet handling
//! * `record_parsers` - Typed RDATA readers per record type
//! * `registry` - Transaction-id correlation of queries and responses
//! * `client` - Unicast DNS client for outgoing queries
//! * `multicast` - mDNS group membership, channels and responder engine
//! * `resolve` - Typed query facade
//! * `netutil` - Length-prefixed framing for stream transports

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// Unicast DNS client for making outgoing queries
pub mod client;

/// mDNS group transport and responder engine
pub mod multicast;

/// Length-prefixed framing helpers
pub mod netutil;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// DNS record RDATA parsing
pub mod record_parsers;

/// Correlation of in-flight queries by transaction id
pub mod registry;

/// Typed query helpers
pub mod resolve;
