//! Messages exchanged with the companion agent and between probe peers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// Bumped whenever a request or response changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest probe datagram either side accepts.
pub const MAX_PROBE_SIZE: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    body: T,
}

/// Global addresses of a host, per family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAddresses {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

impl PublicAddresses {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.v4
            .iter()
            .map(|ip| IpAddr::V4(*ip))
            .chain(self.v6.iter().map(|ip| IpAddr::V6(*ip)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListPublicAddresses,
    ProbeServer {
        port: u16,
        timeout_ms: u64,
    },
    ProbeClient {
        addresses: PublicAddresses,
        port: u16,
        timeout_ms: u64,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::ListPublicAddresses => "list_public_addresses",
            Request::ProbeServer { .. } => "probe_server",
            Request::ProbeClient { .. } => "probe_client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    PublicAddresses(PublicAddresses),
    ProbeServer { received: bool },
    ProbeClient { address: Option<IpAddr> },
    Error { message: String },
}

pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&Envelope {
        version: PROTOCOL_VERSION,
        body,
    })?)
}

/// Decode an envelope, rejecting other protocol versions before looking at
/// the body.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(data)?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(DeployError::ProtocolVersion {
            expected: PROTOCOL_VERSION,
            got: envelope.version,
        });
    }
    Ok(serde_json::from_value(envelope.body)?)
}

/// Datagram sent by the probe client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub nonce: String,
    pub addr: String,
    pub port: u16,
    pub family: u8,
}

/// Echo of a [`ProbeRequest`] sent back by the probe server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub success: bool,
    pub nonce: String,
    pub addr: String,
    pub port: u16,
    pub family: u8,
}

pub fn family_of(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 6,
    }
}
