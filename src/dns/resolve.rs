//! typed query helpers projecting DNS answers into addresses and service
//! records

use std::net::{IpAddr, SocketAddr};

use derive_more::{Display, Error, From};

use crate::dns::client::{ClientConfig, ClientError, UnicastClient};
use crate::dns::protocol::{DnsPacket, QueryType, RecordData};
use crate::dns::registry::QueryError;

#[derive(Debug, Display, From, Error)]
pub enum ResolveError {
    Client(ClientError),
    Query(QueryError),
}

type Result<T> = std::result::Result<T, ResolveError>;

/// Service endpoint projected out of an SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// Text attributes projected out of a TXT answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtEntry {
    pub data: String,
    pub key: String,
    pub value: String,
}

/// High-level typed queries over a [`UnicastClient`].
///
/// Each helper sends one Internet-class question and filters the answer
/// section for the matching record variant; answers of other types (for
/// example CNAMEs mixed into an A response) are skipped rather than
/// treated as errors.
pub struct Resolver {
    client: UnicastClient,
}

impl Resolver {
    pub async fn new(config: ClientConfig) -> Result<Resolver> {
        let client = UnicastClient::connect(config).await?;

        Ok(Resolver { client })
    }

    pub fn client(&self) -> &UnicastClient {
        &self.client
    }

    /// Look up IPv4 addresses, combined with a caller-chosen port into
    /// socket addresses.
    pub async fn query_a(&self, qname: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let response = self.client.query(qname, QueryType::A).await?;

        Ok(project_a(&response, port))
    }

    /// Look up IPv6 addresses, combined with a caller-chosen port into
    /// socket addresses.
    pub async fn query_aaaa(&self, qname: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let response = self.client.query(qname, QueryType::Aaaa).await?;

        Ok(project_aaaa(&response, port))
    }

    pub async fn query_srv(&self, qname: &str) -> Result<Vec<SrvTarget>> {
        let response = self.client.query(qname, QueryType::Srv).await?;

        Ok(project_srv(&response))
    }

    pub async fn query_txt(&self, qname: &str) -> Result<Vec<TxtEntry>> {
        let response = self.client.query(qname, QueryType::Txt).await?;

        Ok(project_txt(&response))
    }

    pub async fn query_ptr(&self, qname: &str) -> Result<Vec<String>> {
        let response = self.client.query(qname, QueryType::Ptr).await?;

        Ok(project_ptr(&response))
    }
}

fn project_a(response: &DnsPacket, port: u16) -> Vec<SocketAddr> {
    response
        .answers
        .iter()
        .filter_map(|rec| match rec.rdata {
            RecordData::A(addr) => Some(SocketAddr::new(IpAddr::V4(addr), port)),
            _ => None,
        })
        .collect()
}

fn project_aaaa(response: &DnsPacket, port: u16) -> Vec<SocketAddr> {
    response
        .answers
        .iter()
        .filter_map(|rec| match rec.rdata {
            RecordData::Aaaa(addr) => Some(SocketAddr::new(IpAddr::V6(addr), port)),
            _ => None,
        })
        .collect()
}

fn project_srv(response: &DnsPacket) -> Vec<SrvTarget> {
    response
        .answers
        .iter()
        .filter_map(|rec| match rec.rdata {
            RecordData::Srv {
                priority,
                weight,
                port,
                ref target,
            } => Some(SrvTarget {
                priority,
                weight,
                port,
                target: target.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn project_txt(response: &DnsPacket) -> Vec<TxtEntry> {
    response
        .answers
        .iter()
        .filter_map(|rec| match rec.rdata {
            RecordData::Txt {
                ref data,
                ref key,
                ref value,
            } => Some(TxtEntry {
                data: data.clone(),
                key: key.clone(),
                value: value.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn project_ptr(response: &DnsPacket) -> Vec<String> {
    response
        .answers
        .iter()
        .filter_map(|rec| match rec.rdata {
            RecordData::Ptr { ref target } => Some(target.clone()),
            _ => None,
        })
        .collect()
}
