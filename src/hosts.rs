//! Docker hosts a run can place containers on, by alias.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::config::{AgentConfig, Config};
use crate::error::{DeployError, Result};
use crate::remote::{LocalExecutor, RemoteExecutionBridge, SshExecutor};
use crate::runtime::{ContainerRuntime, DockerRuntime};

const REMOTE_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);
const FORWARD_POLL: Duration = Duration::from_millis(100);

/// `[user@]host[:port]` of an `ssh://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub destination: String,
    pub port: Option<u16>,
}

impl SshTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("ssh://")
            .ok_or_else(|| DeployError::UnknownHost(format!("not an ssh url: {}", url)))?;
        let rest = rest.trim_end_matches('/');
        let (destination, port) = match rest.rsplit_once(':') {
            Some((destination, port)) => {
                let port = port.parse().map_err(|_| {
                    DeployError::UnknownHost(format!("invalid port in {}", url))
                })?;
                (destination, Some(port))
            }
            None => (rest, None),
        };
        if destination.is_empty() || destination.ends_with('@') {
            return Err(DeployError::UnknownHost(format!("no host in {}", url)));
        }
        Ok(Self {
            destination: destination.to_string(),
            port,
        })
    }
}

/// The remote docker socket forwarded to a local one by `ssh -L`.  The
/// ssh process and the socket go away with the forward.
pub struct SshForward {
    dir: PathBuf,
    socket: PathBuf,
    child: Child,
}

impl SshForward {
    pub async fn open(alias: &str, target: &SshTarget) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "interop-deploy-{}-{}",
            std::process::id(),
            alias
        ));
        std::fs::create_dir_all(&dir)?;
        let socket = dir.join("docker.sock");
        if socket.exists() {
            std::fs::remove_file(&socket)?;
        }

        let mut command = Command::new("ssh");
        command
            .arg("-N")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("StreamLocalBindUnlink=yes")
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(port) = target.port {
            command.arg("-p").arg(port.to_string());
        }
        command
            .arg("-L")
            .arg(format!("{}:{}", socket.display(), REMOTE_DOCKER_SOCKET))
            .arg(&target.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        debug!("Forwarding docker socket of {} to {}", alias, socket.display());
        let mut forward = Self {
            dir,
            socket,
            child: command.spawn()?,
        };

        let deadline = Instant::now() + FORWARD_TIMEOUT;
        while !forward.socket.exists() {
            if let Some(status) = forward.child.try_wait()? {
                return Err(DeployError::remote(
                    alias,
                    format!("ssh forward exited with {}", status),
                ));
            }
            if Instant::now() >= deadline {
                return Err(DeployError::remote(
                    alias,
                    format!("ssh forward not up after {:?}", FORWARD_TIMEOUT),
                ));
            }
            sleep(FORWARD_POLL).await;
        }
        Ok(forward)
    }

    pub fn socket(&self) -> &PathBuf {
        &self.socket
    }
}

impl Drop for SshForward {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Could not stop ssh forward: {}", e);
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            debug!("Could not remove {}: {}", self.dir.display(), e);
        }
    }
}

/// One connected docker host.
pub struct DockerHost {
    alias: String,
    runtime: Arc<dyn ContainerRuntime>,
    bridge: Option<RemoteExecutionBridge>,
    _forward: Option<SshForward>,
}

impl DockerHost {
    pub fn new(
        alias: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        bridge: Option<RemoteExecutionBridge>,
    ) -> Self {
        Self {
            alias: alias.into(),
            runtime,
            bridge,
            _forward: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    /// Agent access to the machine behind the daemon.  Only local and
    /// `ssh://` hosts have one.
    pub fn bridge(&self) -> Result<&RemoteExecutionBridge> {
        self.bridge.as_ref().ok_or_else(|| {
            DeployError::Unsupported(format!(
                "docker host {} offers no remote execution",
                self.alias
            ))
        })
    }
}

/// Alias → docker host, connected on first use and kept for the lifetime
/// of the registry.
pub struct HostRegistry {
    urls: BTreeMap<String, String>,
    agent: AgentConfig,
    hosts: Mutex<HashMap<String, Arc<DockerHost>>>,
}

impl HostRegistry {
    pub fn new(urls: BTreeMap<String, String>, agent: AgentConfig) -> Self {
        Self {
            urls,
            agent,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.docker_hosts.clone(), config.agent.clone())
    }

    /// Register an already connected host, replacing the configured one.
    pub async fn insert(&self, host: DockerHost) {
        self.hosts
            .lock()
            .await
            .insert(host.alias.clone(), Arc::new(host));
    }

    pub async fn get(&self, alias: &str) -> Result<Arc<DockerHost>> {
        let mut hosts = self.hosts.lock().await;
        if let Some(host) = hosts.get(alias) {
            return Ok(host.clone());
        }
        let url = self
            .urls
            .get(alias)
            .ok_or_else(|| DeployError::UnknownHost(alias.to_string()))?;
        let host = Arc::new(self.connect(alias, url).await?);
        hosts.insert(alias.to_string(), host.clone());
        Ok(host)
    }

    async fn connect(&self, alias: &str, url: &str) -> Result<DockerHost> {
        if url.starts_with("ssh://") {
            let target = SshTarget::parse(url)?;
            let forward = SshForward::open(alias, &target).await?;
            let runtime = DockerRuntime::connect_forwarded(forward.socket(), alias)?;
            runtime.ping().await?;
            let executor = SshExecutor::new(
                alias,
                target.destination.clone(),
                target.port,
                self.agent.remote_path.clone(),
                self.agent.local_binary.clone(),
            );
            info!("Docker host {} reachable via ssh {}", alias, target.destination);
            return Ok(DockerHost {
                alias: alias.to_string(),
                runtime: Arc::new(runtime),
                bridge: Some(RemoteExecutionBridge::new(Arc::new(executor))),
                _forward: Some(forward),
            });
        }

        let runtime = DockerRuntime::connect(url)?;
        // A daemon reached over tcp may live anywhere; only a local socket
        // shares this machine's interfaces.
        let local = url.is_empty() || url == "default" || url.starts_with("unix://");
        let bridge = local.then(|| RemoteExecutionBridge::new(Arc::new(LocalExecutor::new(alias))));
        Ok(DockerHost::new(alias, Arc::new(runtime), bridge))
    }
}
