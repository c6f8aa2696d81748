//! Find the public address under which the client host reaches the server
//! host.

use std::net::IpAddr;
use std::time::Duration;

use log::{error, info};

use crate::config::Config;
use crate::error::{DeployError, Result};
use crate::remote::bridge::RemoteExecutionBridge;

/// Ports below this need root to bind.
const PRIVILEGED_PORT_LIMIT: u16 = 1024;

#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub port: u16,
    pub timeout: Duration,
    /// Head start of the listener before the client sends its probes.
    pub server_startup: Duration,
}

impl NegotiationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            port: config.negotiation.port,
            timeout: config.negotiation_timeout(),
            server_startup: Duration::from_millis(config.negotiation.server_startup_ms),
        }
    }
}

/// Both sides of the probe must agree: a probe that arrived has to have
/// produced an address and vice versa.
pub fn check_contract(server_received: bool, client: Option<IpAddr>) -> Result<Option<IpAddr>> {
    match (server_received, client) {
        (true, Some(address)) => Ok(Some(address)),
        (false, None) => {
            error!("No public address of the server host is reachable from the client host");
            Ok(None)
        }
        (true, None) => Err(DeployError::NegotiationContract(
            "server received a probe but the client accepted no answer".into(),
        )),
        (false, Some(address)) => Err(DeployError::NegotiationContract(format!(
            "client confirmed {} although the server received no probe",
            address
        ))),
    }
}

/// List the server host's public addresses and probe them from the client
/// host.  `Ok(None)` means none was reachable; the run should be skipped.
pub async fn negotiate_server_ip(
    server: &RemoteExecutionBridge,
    client: &RemoteExecutionBridge,
    settings: &NegotiationSettings,
) -> Result<Option<IpAddr>> {
    let addresses = server.list_public_addresses().await?;
    if addresses.is_empty() {
        error!("Server host {} has no public address", server.host());
        return Ok(None);
    }
    info!(
        "Probing {:?} of {} from {}",
        addresses,
        server.host(),
        client.host()
    );

    let elevate = settings.port <= PRIVILEGED_PORT_LIMIT;
    let server_side = server.probe_server(settings.port, settings.timeout, elevate);
    let client_side = async {
        tokio::time::sleep(settings.server_startup).await;
        client
            .probe_client(&addresses, settings.port, settings.timeout)
            .await
    };
    let (received, confirmed) = tokio::join!(server_side, client_side);
    let address = check_contract(received?, confirmed?)?;
    if let Some(address) = address {
        info!("Server host {} is reachable at {}", server.host(), address);
    }
    Ok(address)
}
