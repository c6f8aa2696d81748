//! Container creation requests for the simulator and the endpoints.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::archive;
use crate::error::{DeployError, Result};
use crate::network::NetworkTopology;
use crate::runtime::docker::ISOLATION_NETWORK;
use crate::runtime::{ContainerHandle, ContainerRuntime};
use crate::spec::{
    label, ContainerSpec, FileCopy, Mount, MountMode, NetworkBinding, NetworkPlan, Protocol,
    PublishedPort, ServiceKind,
};
use crate::types::Role;

// Paths inside the containers.
pub const DOWNLOADS_PATH: &str = "/downloads";
pub const CERTS_PATH: &str = "/certs";
pub const WWW_PATH: &str = "/www";
pub const LOGS_PATH: &str = "/logs";
pub const SSLKEYLOG_FILE: &str = "/logs/keys.log";
pub const QLOG_DIR: &str = "/logs/qlog/";
pub const SETUP_SCRIPT_PATH: &str = "/setup.sh";

pub const SIMULATOR_SERVICE: &str = "sim";
/// Port the endpoints talk on.
pub const SERVER_PORT: u16 = 443;

/// What an endpoint needs to know about the test it runs.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub image: String,
    pub role: Role,
    pub testcase: String,
    pub version: String,
    pub certs: PathBuf,
    /// Space separated URLs the client requests.
    pub request_urls: Option<String>,
    /// Content the server serves.
    pub www: Option<PathBuf>,
    /// Where the client stores what it downloaded.
    pub downloads: Option<PathBuf>,
    pub entrypoint: Option<Vec<String>>,
}

impl EndpointOptions {
    /// Servers serve content and download nothing; clients download the
    /// requested URLs and serve nothing.
    fn validate(&self, needs_downloads: bool) -> Result<()> {
        let problem = match self.role {
            Role::Server if self.www.is_none() => Some("a server needs a content path"),
            Role::Server if self.downloads.is_some() => {
                Some("a server must not get a download path")
            }
            Role::Client if self.request_urls.is_none() => Some("a client needs request URLs"),
            Role::Client if self.www.is_some() => Some("a client must not get a content path"),
            Role::Client if needs_downloads && self.downloads.is_none() => {
                Some("a client needs a download path")
            }
            _ => None,
        };
        match problem {
            Some(problem) => Err(DeployError::InvalidSpec(format!(
                "{} ({})",
                problem, self.image
            ))),
            None => Ok(()),
        }
    }

    fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("ROLE".to_string(), self.role.to_string()),
            ("TESTCASE".to_string(), self.testcase.clone()),
            ("VERSION".to_string(), self.version.clone()),
            ("SSLKEYLOGFILE".to_string(), SSLKEYLOG_FILE.to_string()),
            ("QLOGDIR".to_string(), QLOG_DIR.to_string()),
        ]);
        if let (Role::Client, Some(urls)) = (self.role, &self.request_urls) {
            env.insert("REQUESTS".to_string(), urls.clone());
        }
        env
    }
}

pub struct ContainerFactory {
    project: String,
    simulator_image: String,
    setup_script: PathBuf,
    memlock: Option<i64>,
    working_dir: String,
    topology: Arc<NetworkTopology>,
}

impl ContainerFactory {
    pub fn new(
        project: impl Into<String>,
        simulator_image: impl Into<String>,
        setup_script: impl Into<PathBuf>,
        memlock: Option<i64>,
        topology: Arc<NetworkTopology>,
    ) -> Self {
        let working_dir = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        Self {
            project: project.into(),
            simulator_image: simulator_image.into(),
            setup_script: setup_script.into(),
            memlock,
            working_dir,
            topology,
        }
    }

    pub fn container_name(&self, service: &str) -> String {
        format!("{}_{}", self.project, service)
    }

    fn labels(&self, service: &str, stage: u32) -> BTreeMap<String, String> {
        BTreeMap::from([
            (label("service"), service.to_string()),
            (label("project"), self.project.clone()),
            (label("working_dir"), self.working_dir.clone()),
            (label("stage"), stage.to_string()),
        ])
    }

    fn base_spec(&self, service: &str, kind: ServiceKind, image: &str, stage: u32) -> ContainerSpec {
        ContainerSpec {
            name: self.container_name(service),
            service: service.to_string(),
            kind,
            image: image.to_string(),
            stage,
            entrypoint: None,
            environment: BTreeMap::new(),
            extra_hosts: Vec::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            labels: self.labels(service, stage),
            cap_add: vec!["NET_ADMIN".to_string()],
            memlock: self.memlock,
            network: NetworkPlan::HostDefault,
            copies: Vec::new(),
        }
    }

    /// The network simulator, sitting on both run networks.
    pub fn simulator_spec(
        &self,
        scenario: &str,
        wait_for_server: bool,
        entrypoint: Option<Vec<String>>,
    ) -> ContainerSpec {
        let specs = self.topology.specs();
        let mut spec = self.base_spec(
            SIMULATOR_SERVICE,
            ServiceKind::Simulator,
            &self.simulator_image,
            0,
        );
        spec.entrypoint = entrypoint;
        spec.environment
            .insert("SCENARIO".to_string(), scenario.to_string());
        if wait_for_server {
            spec.environment.insert(
                "WAITFORSERVER".to_string(),
                format!("server:{}", SERVER_PORT),
            );
        }
        spec.extra_hosts = specs.simulator_extra_hosts();
        spec.network = NetworkPlan::Pinned(
            Role::ALL
                .into_iter()
                .map(|role| NetworkBinding {
                    role,
                    ipv4: specs.simulator_ipv4(role),
                    ipv6: specs.simulator_ipv6(role),
                })
                .collect(),
        );
        spec
    }

    /// An endpoint on its side's emulated network.
    pub fn implementation_spec(&self, options: &EndpointOptions) -> Result<ContainerSpec> {
        options.validate(true)?;
        let role = options.role;
        let specs = self.topology.specs();
        let mut spec = self.base_spec(
            role.as_str(),
            ServiceKind::Endpoint(role),
            &options.image,
            role.stage(),
        );
        spec.entrypoint = options.entrypoint.clone();
        spec.environment = options.environment();
        spec.extra_hosts = specs.extra_hosts(role, false);
        spec.mounts.push(Mount {
            source: options.certs.clone(),
            target: CERTS_PATH.to_string(),
            mode: MountMode::ReadOnly,
        });
        match (role, &options.www, &options.downloads) {
            (Role::Server, Some(www), _) => spec.mounts.push(Mount {
                source: www.clone(),
                target: WWW_PATH.to_string(),
                mode: MountMode::ReadOnly,
            }),
            (Role::Client, _, Some(downloads)) => spec.mounts.push(Mount {
                source: downloads.clone(),
                target: DOWNLOADS_PATH.to_string(),
                mode: MountMode::ReadWrite,
            }),
            _ => {}
        }
        spec.network = NetworkPlan::Pinned(vec![NetworkBinding {
            role,
            ipv4: specs.endpoint_ipv4(role),
            ipv6: specs.endpoint_ipv6(role),
        }]);
        Ok(spec)
    }

    /// An endpoint on a physical host.  No volumes exist across hosts, so
    /// certificates, content and the link setup script are copied in.
    pub fn real_link_spec(
        &self,
        options: &EndpointOptions,
        server_ip: IpAddr,
        server_port: u16,
    ) -> Result<ContainerSpec> {
        options.validate(false)?;
        let role = options.role;
        let mut spec = self.base_spec(
            role.as_str(),
            ServiceKind::Endpoint(role),
            &options.image,
            role.stage(),
        );
        spec.entrypoint = options.entrypoint.clone();
        spec.environment = options.environment();
        match role {
            Role::Server => spec.ports.push(PublishedPort {
                container_port: SERVER_PORT,
                protocol: Protocol::Udp,
                host_ip: server_ip,
                host_port: server_port,
            }),
            Role::Client => {
                let host = match server_ip {
                    IpAddr::V4(_) => "server4",
                    IpAddr::V6(_) => "server6",
                };
                spec.extra_hosts.push((host.to_string(), server_ip));
            }
        }
        spec.copies.push(FileCopy {
            local: self.setup_script.clone(),
            remote: SETUP_SCRIPT_PATH.to_string(),
            recursive: false,
        });
        spec.copies.push(FileCopy {
            local: options.certs.clone(),
            remote: CERTS_PATH.to_string(),
            recursive: true,
        });
        if let (Role::Server, Some(www)) = (role, &options.www) {
            spec.copies.push(FileCopy {
                local: www.clone(),
                remote: WWW_PATH.to_string(),
                recursive: true,
            });
        }
        Ok(spec)
    }

    /// Create the container described by `spec` on `runtime`, replacing a
    /// leftover of the same name, then attach its networks and push its
    /// files.  A container that cannot be set up is removed again.
    pub async fn create(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle> {
        remove_existing(runtime.as_ref(), &spec.name).await?;
        if let NetworkPlan::Pinned(_) = spec.network {
            self.topology.ensure_networks().await?;
        }
        let id = runtime.create(spec).await?;
        let handle = ContainerHandle {
            id,
            name: spec.name.clone(),
            service: spec.service.clone(),
            stage: spec.stage,
            runtime: runtime.clone(),
        };
        if let Err(e) = self.prepare(&handle, spec).await {
            debug!("Removing half-prepared container {}", handle.name);
            if let Err(remove_err) = runtime.remove(&handle.id).await {
                debug!("Could not remove {}: {}", handle.name, remove_err);
            }
            return Err(e);
        }
        Ok(handle)
    }

    async fn prepare(&self, handle: &ContainerHandle, spec: &ContainerSpec) -> Result<()> {
        if let NetworkPlan::Pinned(bindings) = &spec.network {
            // Created on the isolation network so the daemon does not wire
            // it to the default bridge; move it over now.
            handle
                .runtime
                .disconnect_network(ISOLATION_NETWORK, &handle.id)
                .await?;
            for binding in bindings {
                let network = self.topology.network_name(binding.role);
                handle
                    .runtime
                    .connect_network(
                        &network,
                        &handle.id,
                        Some(binding.ipv4),
                        Some(binding.ipv6),
                    )
                    .await?;
                debug!(
                    "Attached {} to {} as {} / {}",
                    handle.name, network, binding.ipv4, binding.ipv6
                );
            }
        }
        for copy in &spec.copies {
            archive::copy_to(handle, &copy.local, &copy.remote, copy.recursive).await?;
        }
        Ok(())
    }
}

/// Stop and remove a container left over from an earlier run.
async fn remove_existing(runtime: &dyn ContainerRuntime, name: &str) -> Result<()> {
    match runtime.inspect(name).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    }
    debug!("Removing existing container {} on {}", name, runtime.host());
    match runtime.stop(name, Duration::from_secs(10)).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() || e.is_not_modified() => {}
        Err(e) => return Err(e),
    }
    match runtime.remove(name).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkSpecs;
    use crate::runtime::fake::{Behavior, Event, FakeRuntime};

    fn factory(runtime: Arc<FakeRuntime>, project: &str) -> ContainerFactory {
        let topology =
            Arc::new(NetworkTopology::new(project, NetworkSpecs::default(), runtime).unwrap());
        ContainerFactory::new(
            project,
            "sim-image",
            "/opt/real_link_setup.sh",
            Some(64),
            topology,
        )
    }

    fn server_options() -> EndpointOptions {
        EndpointOptions {
            image: "quic-go".into(),
            role: Role::Server,
            testcase: "transfer".into(),
            version: "1".into(),
            certs: "/tmp/certs".into(),
            request_urls: Some("https://server4:443/a".into()),
            www: Some("/tmp/www".into()),
            downloads: None,
            entrypoint: None,
        }
    }

    fn client_options() -> EndpointOptions {
        EndpointOptions {
            role: Role::Client,
            www: None,
            downloads: Some("/tmp/downloads".into()),
            ..server_options()
        }
    }

    #[test]
    fn simulator_sits_on_both_networks() {
        let factory = factory(FakeRuntime::new(), "interop");
        let spec = factory.simulator_spec("drop-rate --rate_to_client=1", true, None);
        assert_eq!(spec.name, "interop_sim");
        assert_eq!(spec.stage, 0);
        assert_eq!(spec.environment["WAITFORSERVER"], "server:443");
        assert_eq!(spec.labels[&label("stage")], "0");
        let NetworkPlan::Pinned(bindings) = &spec.network else {
            panic!("simulator must be pinned");
        };
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].ipv4.to_string(), "193.167.0.2");
        assert_eq!(bindings[1].ipv4.to_string(), "193.167.100.2");
        assert!(spec
            .extra_hosts
            .contains(&("server".into(), "193.167.100.100".parse().unwrap())));

        let quiet = factory.simulator_spec("debug-scenario", false, None);
        assert!(!quiet.environment.contains_key("WAITFORSERVER"));
    }

    #[test]
    fn endpoint_mounts_follow_role() {
        let factory = factory(FakeRuntime::new(), "interop");
        let server = factory.implementation_spec(&server_options()).unwrap();
        assert_eq!(server.stage, 1);
        assert!(!server.environment.contains_key("REQUESTS"));
        let binds: Vec<_> = server.mounts.iter().map(|m| m.bind_string()).collect();
        assert_eq!(binds, vec!["/tmp/certs:/certs:ro", "/tmp/www:/www:ro"]);

        let client = factory.implementation_spec(&client_options()).unwrap();
        assert_eq!(client.stage, 2);
        assert_eq!(client.environment["REQUESTS"], "https://server4:443/a");
        assert_eq!(client.environment["QLOGDIR"], "/logs/qlog/");
        let binds: Vec<_> = client.mounts.iter().map(|m| m.bind_string()).collect();
        assert_eq!(binds, vec!["/tmp/certs:/certs:ro", "/tmp/downloads:/downloads:rw"]);
        assert!(client.ports.is_empty());
    }

    #[test]
    fn role_arguments_are_checked() {
        let factory = factory(FakeRuntime::new(), "interop");
        let invalid = [
            EndpointOptions {
                www: None,
                ..server_options()
            },
            EndpointOptions {
                downloads: Some("/tmp/d".into()),
                ..server_options()
            },
            EndpointOptions {
                request_urls: None,
                ..client_options()
            },
            EndpointOptions {
                www: Some("/tmp/www".into()),
                ..client_options()
            },
            EndpointOptions {
                downloads: None,
                ..client_options()
            },
        ];
        for options in invalid {
            assert!(matches!(
                factory.implementation_spec(&options),
                Err(DeployError::InvalidSpec(_))
            ));
        }
    }

    #[test]
    fn real_link_publishes_negotiated_address() {
        let factory = factory(FakeRuntime::new(), "interop");
        let ip: IpAddr = "2001:db8::7".parse().unwrap();
        let server = factory
            .real_link_spec(&server_options(), ip, 443)
            .unwrap();
        assert_eq!(server.network, NetworkPlan::HostDefault);
        assert_eq!(server.ports.len(), 1);
        assert_eq!(server.ports[0].key(), "443/udp");
        assert_eq!(server.ports[0].host_ip, ip);
        assert!(server.mounts.is_empty());
        let remotes: Vec<_> = server.copies.iter().map(|c| c.remote.as_str()).collect();
        assert_eq!(remotes, vec!["/setup.sh", "/certs", "/www"]);

        let client_opts = EndpointOptions {
            downloads: None,
            ..client_options()
        };
        let client = factory.real_link_spec(&client_opts, ip, 443).unwrap();
        assert_eq!(client.extra_hosts, vec![("server6".to_string(), ip)]);
        assert!(client.ports.is_empty());
        assert_eq!(client.copies.len(), 2);
    }

    #[tokio::test]
    async fn create_replaces_leftovers_and_pins_addresses() {
        let runtime = FakeRuntime::new();
        // Leftover of a crashed run with the same name.
        runtime.add_container("sim", 0, Behavior::default());
        let factory = factory(runtime.clone(), "fake");
        let spec = factory.simulator_spec("simple-p2p", true, None);
        let dyn_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
        let handle = factory.create(&dyn_runtime, &spec).await.unwrap();
        assert_eq!(handle.service, "sim");

        let events = runtime.events();
        let removed = events
            .iter()
            .position(|e| *e == Event::Removed("fake_sim".into()))
            .unwrap();
        let created = events
            .iter()
            .position(|e| *e == Event::Created("fake_sim".into()))
            .unwrap();
        assert!(removed < created);
        assert!(events.contains(&Event::Disconnected {
            network: ISOLATION_NETWORK.into(),
            container: "fake_sim".into(),
        }));
        assert!(events.contains(&Event::Connected {
            network: "fake_leftnet".into(),
            container: "fake_sim".into(),
            ipv4: Some("193.167.0.2".parse().unwrap()),
        }));
        assert!(events.contains(&Event::Connected {
            network: "fake_rightnet".into(),
            container: "fake_sim".into(),
            ipv4: Some("193.167.100.2".parse().unwrap()),
        }));
        assert_eq!(runtime.container_names(), vec!["fake_sim".to_string()]);
    }

    #[tokio::test]
    async fn real_link_files_are_copied_in() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("setup.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        let certs = dir.path().join("certs");
        let www = dir.path().join("www");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::create_dir_all(&www).unwrap();
        std::fs::write(certs.join("cert.pem"), b"pem").unwrap();
        std::fs::write(www.join("index.html"), b"hi").unwrap();

        let runtime = FakeRuntime::new();
        let topology = Arc::new(
            NetworkTopology::new("fake", NetworkSpecs::default(), runtime.clone()).unwrap(),
        );
        let factory = ContainerFactory::new("fake", "sim-image", &script, None, topology);
        let options = EndpointOptions {
            certs,
            www: Some(www),
            ..server_options()
        };
        let spec = factory
            .real_link_spec(&options, "203.0.113.9".parse().unwrap(), 443)
            .unwrap();
        let dyn_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
        factory.create(&dyn_runtime, &spec).await.unwrap();

        let uploads = runtime
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Uploaded { .. }))
            .count();
        assert_eq!(uploads, 3);
        // No networks are touched for real-link endpoints.
        assert!(runtime.network("fake_leftnet").is_none());
    }

    #[tokio::test]
    async fn failed_setup_removes_the_container() {
        let runtime = FakeRuntime::new();
        let factory = factory(runtime.clone(), "fake");
        let mut options = server_options();
        options.certs = "/nonexistent/certs".into();
        let spec = factory
            .real_link_spec(&options, "203.0.113.9".parse().unwrap(), 443)
            .unwrap();
        let dyn_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
        assert!(factory.create(&dyn_runtime, &spec).await.is_err());
        assert!(runtime.container_names().is_empty());
    }
}
