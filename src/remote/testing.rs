//! In-process agent for tests that need two "hosts" on one machine.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::remote::agent;
use crate::remote::bridge::{AgentOutput, RemoteExecutionBridge, RemoteExecutor};
use crate::remote::protocol::{self, PublicAddresses, Request, Response};

/// Real agent, except that it claims to own `advertised` as its only
/// public address.
pub struct Advertising {
    host: &'static str,
    advertised: Ipv4Addr,
}

#[async_trait]
impl RemoteExecutor for Advertising {
    fn host(&self) -> &str {
        self.host
    }

    async fn run_agent(&self, payload: Vec<u8>, _elevate: bool) -> Result<AgentOutput> {
        let response = match protocol::decode::<Request>(&payload)? {
            Request::ListPublicAddresses => Response::PublicAddresses(PublicAddresses {
                v4: vec![self.advertised],
                v6: vec![],
            }),
            request => agent::handle(request).await,
        };
        Ok(AgentOutput {
            stdout: protocol::encode(&response)?,
            stderr: String::new(),
            success: true,
        })
    }
}

pub fn advertising(host: &'static str, advertised: Ipv4Addr) -> RemoteExecutionBridge {
    RemoteExecutionBridge::new(Arc::new(Advertising { host, advertised }))
}

/// A UDP port that was free a moment ago.
pub fn free_port() -> u16 {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket.local_addr().unwrap().port()
}
