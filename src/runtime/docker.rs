use super::{ContainerRuntime, ContainerState, ImageInfo, NetworkInfo, WaitOutcome};
use crate::error::{DeployError, Result};
use crate::spec::{ContainerSpec, NetworkCreate, NetworkPlan};
use crate::types::ContainerStatus;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, TagImageOptions};
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding,
    ResourcesUlimits,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

/// Seconds the HTTP client waits for a single daemon request.  Long
/// enough for a graceful stop of a slow container.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Network a container is created on before it is moved onto its pinned
/// networks; attaching to "none" keeps the daemon from wiring it to the
/// default bridge.
pub const ISOLATION_NETWORK: &str = "none";

pub struct DockerRuntime {
    docker: Docker,
    host: String,
}

impl DockerRuntime {
    /// Connect to a daemon given as `unix://`, `tcp://` or `http://` URL.
    /// `default` (or an empty string) uses the local defaults.
    pub fn connect(url: &str) -> Result<Self> {
        let docker = if url.is_empty() || url == "default" {
            Docker::connect_with_local_defaults()?
        } else if let Some(path) = url.strip_prefix("unix://") {
            Docker::connect_with_unix(path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if let Some(addr) = url.strip_prefix("tcp://") {
            Docker::connect_with_http(
                &format!("http://{}", addr),
                REQUEST_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?
        } else if url.starts_with("http://") {
            Docker::connect_with_http(url, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            return Err(DeployError::UnknownHost(format!(
                "unsupported docker host url {}",
                url
            )));
        };
        info!("Connected to docker daemon at {}", url);
        Ok(Self {
            docker,
            host: url.to_string(),
        })
    }

    /// Connect through a local socket that forwards to a remote daemon.
    pub fn connect_forwarded(socket: &Path, host: &str) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            REQUEST_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )?;
        info!(
            "Connected to docker daemon on {} via {}",
            host,
            socket.display()
        );
        Ok(Self {
            docker,
            host: host.to_string(),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &spec.ports {
        exposed_ports.insert(port.key(), HashMap::new());
        port_bindings
            .entry(port.key())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: Some(port.host_ip.to_string()),
                host_port: Some(port.host_port.to_string()),
            });
    }

    let network_mode = match spec.network {
        NetworkPlan::Pinned(_) => Some(ISOLATION_NETWORK.to_string()),
        NetworkPlan::HostDefault => None,
    };

    let host_config = HostConfig {
        binds: Some(spec.mounts.iter().map(|m| m.bind_string()).collect()),
        cap_add: Some(spec.cap_add.clone()),
        extra_hosts: Some(spec.extra_hosts_strings()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        network_mode,
        ulimits: spec.memlock.map(|limit| {
            vec![ResourcesUlimits {
                name: Some("memlock".to_string()),
                soft: Some(limit),
                hard: Some(limit),
            }]
        }),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        entrypoint: spec.entrypoint.clone(),
        env: Some(spec.env_strings()),
        hostname: Some(spec.service.clone()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        open_stdin: Some(true),
        tty: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn host(&self) -> &str {
        &self.host
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let state = detail
            .state
            .ok_or_else(|| DeployError::NotFound(format!("state of container {}", id)))?;
        let raw = state
            .status
            .map(|s| s.to_string())
            .unwrap_or_default();
        let status = ContainerStatus::from_docker(&raw).ok_or_else(|| {
            DeployError::UnexpectedStatus {
                container: id.to_string(),
                status: raw.clone(),
                expected: "created, running or exited".to_string(),
            }
        })?;
        Ok(ContainerState {
            status,
            exit_code: state.exit_code,
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await?;
        for warning in &response.warnings {
            warn!("Creating {} on {}: {}", spec.name, self.host, warning);
        }
        debug!("Created container {} ({}) on {}", spec.name, response.id, self.host);
        Ok(response.id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        self.docker.kill_container(id, Some(options)).await?;
        Ok(())
    }

    fn logs(&self, id: &str) -> BoxStream<'static, Result<Bytes>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(|chunk| chunk.map(|output| output.into_bytes()).map_err(Into::into))
            .boxed()
    }

    async fn wait(&self, id: &str) -> Result<WaitOutcome> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(WaitOutcome {
                status_code: Some(response.status_code),
                error: response
                    .error
                    .and_then(|e| e.message)
                    .filter(|m| !m.is_empty()),
                ..Default::default()
            }),
            // bollard reports non-zero exit codes as an error.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                Ok(WaitOutcome {
                    status_code: Some(code),
                    error: (!error.is_empty()).then_some(error),
                    ..Default::default()
                })
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(WaitOutcome::default()),
        }
    }

    async fn upload_archive(&self, id: &str, path: &str, tar: Bytes) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), tar)
            .await?;
        Ok(())
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        Ok(archive)
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => Ok(Some(NetworkInfo {
                id: network.id.unwrap_or_else(|| name.to_string()),
                containers: network
                    .containers
                    .map(|c| c.into_keys().collect())
                    .unwrap_or_default(),
            })),
            Err(e) => {
                let err = DeployError::from(e);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_network(&self, request: &NetworkCreate) -> Result<String> {
        let mut options = HashMap::new();
        options.insert(
            "com.docker.network.bridge.enable_ip_masquerade".to_string(),
            request.ip_masquerade.to_string(),
        );
        let config = CreateNetworkOptions {
            name: request.name.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            internal: false,
            attachable: true,
            ingress: false,
            ipam: Ipam {
                config: Some(
                    request
                        .pools
                        .iter()
                        .map(|pool| IpamConfig {
                            subnet: Some(pool.subnet.clone()),
                            gateway: Some(pool.gateway.clone()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            },
            enable_ipv6: request.enable_ipv6,
            options,
            labels: request.labels.clone().into_iter().collect(),
        };
        let response = self.docker.create_network(config).await?;
        let id = response.id.ok_or_else(|| {
            DeployError::NotFound(format!("id of the created network {}", request.name))
        })?;
        info!("Created network {} on {}", request.name, self.host);
        Ok(id)
    }

    async fn connect_network(
        &self,
        network: &str,
        id: &str,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: id.to_string(),
            endpoint_config: EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: ipv4.map(|ip| ip.to_string()),
                    ipv6_address: ipv6.map(|ip| ip.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        self.docker.connect_network(network, options).await?;
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, id: &str) -> Result<()> {
        let options = DisconnectNetworkOptions {
            container: id.to_string(),
            force: false,
        };
        self.docker.disconnect_network(network, options).await?;
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(ImageInfo {
                id: image.id.unwrap_or_default(),
                tags: image.repo_tags.unwrap_or_default(),
            })),
            Err(e) => {
                let err = DeployError::from(e);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker.tag_image(image, Some(options)).await?;
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Some(status) = progress?.status {
                debug!("Pulling {} on {}: {}", reference, self.host, status);
            }
        }
        Ok(())
    }
}
