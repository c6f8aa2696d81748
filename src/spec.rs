//! Fully specified container and network creation requests.
//!
//! A [`ContainerSpec`] is built once by the factory and handed to a
//! runtime unchanged; nothing downstream mutates it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use crate::types::Role;

/// Prefix of every label this crate puts on containers and networks.
pub const LABEL_PREFIX: &str = "interop.deploy";

pub fn label(key: &str) -> String {
    format!("{}.{}", LABEL_PREFIX, key)
}

/// Which kind of service a container plays in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Simulator,
    Endpoint(Role),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        }
    }
}

/// Bind mount of a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub mode: MountMode,
}

impl Mount {
    /// `source:target:mode`, as the daemon expects binds.
    pub fn bind_string(&self) -> String {
        format!("{}:{}:{}", self.source.display(), self.target, self.mode.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Container port published on a specific host address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_ip: IpAddr,
    pub host_port: u16,
}

impl PublishedPort {
    /// Docker's `<port>/<proto>` key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Pinned addresses of a container on one of the run networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    pub role: Role,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

/// How a container is attached to networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPlan {
    /// Created on the isolation network, then moved onto the run networks
    /// with pinned addresses.
    Pinned(Vec<NetworkBinding>),
    /// Whatever the daemon attaches by default (real-link endpoints).
    HostDefault,
}

/// A local file or tree pushed into the container after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    pub local: PathBuf,
    pub remote: String,
    pub recursive: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Daemon-side container name, unique per project.
    pub name: String,
    pub service: String,
    pub kind: ServiceKind,
    pub image: String,
    pub stage: u32,
    pub entrypoint: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    /// Hostname → address.  A hostname may appear more than once to
    /// resolve to both an IPv4 and an IPv6 address.
    pub extra_hosts: Vec<(String, IpAddr)>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PublishedPort>,
    pub labels: BTreeMap<String, String>,
    pub cap_add: Vec<String>,
    pub memlock: Option<i64>,
    pub network: NetworkPlan,
    pub copies: Vec<FileCopy>,
}

impl ContainerSpec {
    pub fn extra_hosts_strings(&self) -> Vec<String> {
        self.extra_hosts
            .iter()
            .map(|(host, ip)| format!("{}:{}", host, ip))
            .collect()
    }

    pub fn env_strings(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Address pool of a dual-stack network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPool {
    pub subnet: String,
    pub gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCreate {
    pub name: String,
    pub pools: Vec<IpPool>,
    pub labels: BTreeMap<String, String>,
    pub enable_ipv6: bool,
    pub ip_masquerade: bool,
}
