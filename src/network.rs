//! Virtual networks of emulated runs.
//!
//! Two dual-stack bridge networks exist per orchestrator: the client side
//! and the server side, with the simulator attached to both.  Every
//! container address is a fixed offset from the subnet base, so all
//! hostnames can be injected as static extra hosts and no DNS is needed.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{DeployError, Result};
use crate::runtime::ContainerRuntime;
use crate::spec::{label, IpPool, NetworkCreate};
use crate::types::Role;

const GATEWAY_OFFSET: u32 = 1;
const SIMULATOR_OFFSET: u32 = 0x2;
const ENDPOINT_OFFSET_V4: u32 = 100;
const ENDPOINT_OFFSET_V6: u32 = 0x100;

fn auxiliary_offset_v4(role: Role) -> u32 {
    match role {
        Role::Server => 110,
        Role::Client => 90,
    }
}

fn auxiliary_offset_v6(role: Role) -> u32 {
    match role {
        Role::Server => 0x110,
        Role::Client => 0x90,
    }
}

/// Largest offset handed out inside a subnet.
fn max_offset_v4() -> u32 {
    [ENDPOINT_OFFSET_V4, auxiliary_offset_v4(Role::Server), auxiliary_offset_v4(Role::Client)]
        .into_iter()
        .max()
        .unwrap_or(ENDPOINT_OFFSET_V4)
}

fn max_offset_v6() -> u32 {
    [ENDPOINT_OFFSET_V6, auxiliary_offset_v6(Role::Server), auxiliary_offset_v6(Role::Client)]
        .into_iter()
        .max()
        .unwrap_or(ENDPOINT_OFFSET_V6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Subnet {
    base: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(DeployError::InvalidTopology(format!(
                "prefix /{} too long for IPv4",
                prefix
            )));
        }
        let subnet = Self { base, prefix };
        if u32::from(base) & subnet.mask() != u32::from(base) {
            return Err(DeployError::InvalidTopology(format!(
                "{} has host bits set",
                subnet
            )));
        }
        Ok(subnet)
    }

    fn mask(&self) -> u32 {
        u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0)
    }

    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    pub fn offset(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base).wrapping_add(offset))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.base)
    }

    pub fn overlaps(&self, other: &Ipv4Subnet) -> bool {
        self.contains(other.base) || other.contains(self.base)
    }

    /// Number of usable host offsets (excludes network and broadcast).
    fn host_capacity(&self) -> u64 {
        (1u64 << (32 - u32::from(self.prefix))).saturating_sub(2)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv6Subnet {
    base: Ipv6Addr,
    prefix: u8,
}

impl Ipv6Subnet {
    pub fn new(base: Ipv6Addr, prefix: u8) -> Result<Self> {
        if prefix > 128 {
            return Err(DeployError::InvalidTopology(format!(
                "prefix /{} too long for IPv6",
                prefix
            )));
        }
        let subnet = Self { base, prefix };
        if u128::from(base) & subnet.mask() != u128::from(base) {
            return Err(DeployError::InvalidTopology(format!(
                "{} has host bits set",
                subnet
            )));
        }
        Ok(subnet)
    }

    fn mask(&self) -> u128 {
        u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0)
    }

    pub fn base(&self) -> Ipv6Addr {
        self.base
    }

    pub fn offset(&self, offset: u32) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.base).wrapping_add(u128::from(offset)))
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        u128::from(addr) & self.mask() == u128::from(self.base)
    }

    pub fn overlaps(&self, other: &Ipv6Subnet) -> bool {
        self.contains(other.base) || other.contains(self.base)
    }

    fn host_capacity(&self) -> u128 {
        let bits = 128 - u32::from(self.prefix);
        if bits >= 127 {
            u128::MAX
        } else {
            (1u128 << bits).saturating_sub(1)
        }
    }
}

impl fmt::Display for Ipv6Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

fn split_cidr(s: &str) -> std::result::Result<(&str, u8), String> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| format!("{} is not in CIDR notation", s))?;
    let prefix = prefix
        .parse()
        .map_err(|_| format!("invalid prefix length in {}", s))?;
    Ok((addr, prefix))
}

impl FromStr for Ipv4Subnet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = split_cidr(s)?;
        let base = addr.parse().map_err(|_| format!("invalid address in {}", s))?;
        Ipv4Subnet::new(base, prefix).map_err(|e| e.to_string())
    }
}

impl FromStr for Ipv6Subnet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = split_cidr(s)?;
        let base = addr.parse().map_err(|_| format!("invalid address in {}", s))?;
        Ipv6Subnet::new(base, prefix).map_err(|e| e.to_string())
    }
}

impl TryFrom<String> for Ipv4Subnet {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for Ipv6Subnet {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Subnet> for String {
    fn from(subnet: Ipv4Subnet) -> Self {
        subnet.to_string()
    }
}

impl From<Ipv6Subnet> for String {
    fn from(subnet: Ipv6Subnet) -> Self {
        subnet.to_string()
    }
}

/// Name and address pools of one side's network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet_v4: Ipv4Subnet,
    pub subnet_v6: Ipv6Subnet,
}

/// The client- and server-side networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpecs {
    pub client: NetworkSpec,
    pub server: NetworkSpec,
}

impl Default for NetworkSpecs {
    fn default() -> Self {
        Self {
            client: NetworkSpec {
                name: "leftnet".into(),
                subnet_v4: Ipv4Subnet {
                    base: Ipv4Addr::new(193, 167, 0, 0),
                    prefix: 24,
                },
                subnet_v6: Ipv6Subnet {
                    base: Ipv6Addr::new(0xfd00, 0xcafe, 0xcafe, 0, 0, 0, 0, 0),
                    prefix: 64,
                },
            },
            server: NetworkSpec {
                name: "rightnet".into(),
                subnet_v4: Ipv4Subnet {
                    base: Ipv4Addr::new(193, 167, 100, 0),
                    prefix: 24,
                },
                subnet_v6: Ipv6Subnet {
                    base: Ipv6Addr::new(0xfd00, 0xcafe, 0xcafe, 0x100, 0, 0, 0, 0),
                    prefix: 64,
                },
            },
        }
    }
}

impl NetworkSpecs {
    pub fn get(&self, role: Role) -> &NetworkSpec {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    /// Subnets of the two sides must be disjoint and large enough for every
    /// fixed offset.
    pub fn validate(&self) -> Result<()> {
        if self.client.name == self.server.name {
            return Err(DeployError::InvalidTopology(format!(
                "client and server network share the name {}",
                self.client.name
            )));
        }
        if self.client.subnet_v4.overlaps(&self.server.subnet_v4) {
            return Err(DeployError::InvalidTopology(format!(
                "{} overlaps {}",
                self.client.subnet_v4, self.server.subnet_v4
            )));
        }
        if self.client.subnet_v6.overlaps(&self.server.subnet_v6) {
            return Err(DeployError::InvalidTopology(format!(
                "{} overlaps {}",
                self.client.subnet_v6, self.server.subnet_v6
            )));
        }
        for spec in [&self.client, &self.server] {
            if spec.subnet_v4.host_capacity() <= u64::from(max_offset_v4()) {
                return Err(DeployError::InvalidTopology(format!(
                    "{} is too small for offset {}",
                    spec.subnet_v4,
                    max_offset_v4()
                )));
            }
            if spec.subnet_v6.host_capacity() <= u128::from(max_offset_v6()) {
                return Err(DeployError::InvalidTopology(format!(
                    "{} is too small for offset {:#x}",
                    spec.subnet_v6,
                    max_offset_v6()
                )));
            }
        }
        Ok(())
    }

    pub fn endpoint_ipv4(&self, role: Role) -> Ipv4Addr {
        self.get(role).subnet_v4.offset(ENDPOINT_OFFSET_V4)
    }

    pub fn endpoint_ipv6(&self, role: Role) -> Ipv6Addr {
        self.get(role).subnet_v6.offset(ENDPOINT_OFFSET_V6)
    }

    pub fn auxiliary_ipv4(&self, role: Role) -> Ipv4Addr {
        self.get(role).subnet_v4.offset(auxiliary_offset_v4(role))
    }

    pub fn auxiliary_ipv6(&self, role: Role) -> Ipv6Addr {
        self.get(role).subnet_v6.offset(auxiliary_offset_v6(role))
    }

    /// Simulator address as seen from `perspective`'s network.
    pub fn simulator_ipv4(&self, perspective: Role) -> Ipv4Addr {
        self.get(perspective).subnet_v4.offset(SIMULATOR_OFFSET)
    }

    pub fn simulator_ipv6(&self, perspective: Role) -> Ipv6Addr {
        self.get(perspective).subnet_v6.offset(SIMULATOR_OFFSET)
    }

    pub fn gateway_ipv4(&self, role: Role) -> Ipv4Addr {
        self.get(role).subnet_v4.offset(GATEWAY_OFFSET)
    }

    pub fn gateway_ipv6(&self, role: Role) -> Ipv6Addr {
        self.get(role).subnet_v6.offset(GATEWAY_OFFSET)
    }

    /// Static host table of an endpoint: the opposing endpoint (or its
    /// auxiliary endpoint) and the simulator.  `<name>46` resolves to both
    /// families.
    pub fn extra_hosts(&self, role: Role, auxiliary: bool) -> Vec<(String, IpAddr)> {
        let other = role.opposite();
        let (other_v4, other_v6) = if auxiliary {
            (self.auxiliary_ipv4(other), self.auxiliary_ipv6(other))
        } else {
            (self.endpoint_ipv4(other), self.endpoint_ipv6(other))
        };
        let sim_v4 = self.simulator_ipv4(role);
        let sim_v6 = self.simulator_ipv6(role);
        vec![
            (format!("{}4", other), other_v4.into()),
            (format!("{}6", other), other_v6.into()),
            (format!("{}46", other), other_v4.into()),
            (format!("{}46", other), other_v6.into()),
            ("sim4".into(), sim_v4.into()),
            ("sim6".into(), sim_v6.into()),
            ("sim46".into(), sim_v4.into()),
            ("sim46".into(), sim_v6.into()),
        ]
    }

    /// Host table of the simulator: both endpoints.
    pub fn simulator_extra_hosts(&self) -> Vec<(String, IpAddr)> {
        let mut hosts = Vec::new();
        for role in [Role::Server, Role::Client] {
            let v4: IpAddr = self.endpoint_ipv4(role).into();
            let v6: IpAddr = self.endpoint_ipv6(role).into();
            hosts.push((role.to_string(), v4));
            hosts.push((format!("{}4", role), v4));
            hosts.push((format!("{}6", role), v6));
            hosts.push((format!("{}46", role), v4));
            hosts.push((format!("{}46", role), v6));
        }
        hosts
    }
}

/// Owner of the two run networks on the local daemon.
pub struct NetworkTopology {
    project: String,
    specs: NetworkSpecs,
    runtime: Arc<dyn ContainerRuntime>,
    networks: OnceCell<BTreeMap<Role, String>>,
}

impl NetworkTopology {
    pub fn new(
        project: impl Into<String>,
        specs: NetworkSpecs,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        specs.validate()?;
        Ok(Self {
            project: project.into(),
            specs,
            runtime,
            networks: OnceCell::new(),
        })
    }

    pub fn specs(&self) -> &NetworkSpecs {
        &self.specs
    }

    pub fn network_name(&self, role: Role) -> String {
        format!("{}_{}", self.project, self.specs.get(role).name)
    }

    /// Fetch or create both networks.  Runs once per topology; later calls
    /// return the cached names.
    pub async fn ensure_networks(&self) -> Result<&BTreeMap<Role, String>> {
        self.networks
            .get_or_try_init(|| async {
                let mut networks = BTreeMap::new();
                for role in Role::ALL {
                    let name = self.network_name(role);
                    match self.runtime.inspect_network(&name).await? {
                        Some(existing) => {
                            debug!("Using existing network {} ({})", name, existing.id);
                        }
                        None => {
                            self.runtime
                                .create_network(&self.network_request(role))
                                .await?;
                        }
                    }
                    networks.insert(role, name);
                }
                Ok::<_, DeployError>(networks)
            })
            .await
    }

    fn network_request(&self, role: Role) -> NetworkCreate {
        let spec = self.specs.get(role);
        NetworkCreate {
            name: self.network_name(role),
            pools: vec![
                IpPool {
                    subnet: spec.subnet_v4.to_string(),
                    gateway: self.specs.gateway_ipv4(role).to_string(),
                },
                IpPool {
                    subnet: spec.subnet_v6.to_string(),
                    gateway: self.specs.gateway_ipv6(role).to_string(),
                },
            ],
            labels: BTreeMap::from([
                (label("network"), spec.name.clone()),
                (label("project"), self.project.clone()),
            ]),
            enable_ipv6: true,
            ip_masquerade: false,
        }
    }

    /// Detach every container from the run networks.  Containers or
    /// networks that vanished concurrently are ignored.
    pub async fn disconnect_all(&self) -> Result<()> {
        let Some(networks) = self.networks.get() else {
            return Ok(());
        };
        for name in networks.values() {
            let info = match self.runtime.inspect_network(name).await? {
                Some(info) => info,
                None => {
                    debug!("Network {} not found(?!?)", name);
                    continue;
                }
            };
            for container in info.containers {
                match self.runtime.disconnect_network(name, &container).await {
                    Ok(()) => debug!("Disconnected {} from {}", container, name),
                    Err(e) if e.is_not_found() => debug!(
                        "Could not disconnect {} from {} as it was not found(?!?)",
                        container, name
                    ),
                    Err(e) => return Err(e),
                }
            }
        }
        info!("Disconnected all containers from the run networks");
        Ok(())
    }
}
