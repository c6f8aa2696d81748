//! Run agent requests on the host a docker daemon lives on.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::{DeployError, Result};
use crate::remote::agent;
use crate::remote::protocol::{self, PublicAddresses, Request, Response};

/// What a single agent invocation left behind.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub success: bool,
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Host alias, used in logs and errors.
    fn host(&self) -> &str;

    /// Feed an encoded request to the agent and collect what it returns.
    async fn run_agent(&self, payload: Vec<u8>, elevate: bool) -> Result<AgentOutput>;
}

/// Spawn `command`, write `payload` to its stdin and collect its output.
async fn run_with_stdin(mut command: Command, payload: &[u8]) -> Result<AgentOutput> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload).await?;
        stdin.shutdown().await?;
    }
    let output = child.wait_with_output().await?;
    Ok(AgentOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

/// Agent for the machine this process runs on.  Requests are handled in
/// process unless they need root, in which case the running executable is
/// started again through `sudo`.
pub struct LocalExecutor {
    host: String,
}

impl LocalExecutor {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run_agent(&self, payload: Vec<u8>, elevate: bool) -> Result<AgentOutput> {
        if !elevate {
            return Ok(AgentOutput {
                stdout: agent::handle_bytes(&payload).await?,
                stderr: String::new(),
                success: true,
            });
        }
        let mut command = Command::new("sudo");
        command.arg("-n").arg(std::env::current_exe()?).arg("agent");
        run_with_stdin(command, &payload).await
    }
}

/// Agent reached over `ssh`.  The binary is installed on first use when
/// the remote path does not hold an executable yet.
pub struct SshExecutor {
    host: String,
    destination: String,
    port: Option<u16>,
    remote_path: String,
    local_binary: Option<PathBuf>,
    installed: OnceCell<()>,
}

impl SshExecutor {
    pub fn new(
        host: impl Into<String>,
        destination: impl Into<String>,
        port: Option<u16>,
        remote_path: impl Into<String>,
        local_binary: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            destination: destination.into(),
            port,
            remote_path: remote_path.into(),
            local_binary,
            installed: OnceCell::new(),
        }
    }

    fn ssh(&self) -> Command {
        let mut command = Command::new("ssh");
        command.arg("-o").arg("BatchMode=yes");
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        command.arg(&self.destination);
        command
    }

    async fn ensure_agent(&self) -> Result<()> {
        self.installed
            .get_or_try_init(|| async {
                let status = self
                    .ssh()
                    .arg("test")
                    .arg("-x")
                    .arg(shell_escape(&self.remote_path))
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await?;
                if status.success() {
                    debug!("Agent present on {} at {}", self.host, self.remote_path);
                    return Ok(());
                }

                let binary = match &self.local_binary {
                    Some(path) => path.clone(),
                    None => std::env::current_exe()?,
                };
                info!(
                    "Installing agent {} on {} at {}",
                    binary.display(),
                    self.host,
                    self.remote_path
                );
                let payload = tokio::fs::read(&binary).await?;
                let mut upload = self.ssh();
                upload.arg(install_command(&self.remote_path));
                let output = run_with_stdin(upload, &payload).await?;
                if !output.success {
                    return Err(DeployError::remote(
                        &self.host,
                        format!("installing agent failed: {}", output.stderr.trim()),
                    ));
                }
                Ok::<(), DeployError>(())
            })
            .await?;
        Ok(())
    }
}

/// ssh hands its arguments to the remote login shell as one string.
fn shell_escape(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Remote command that stores stdin as the executable `path`, replacing it
/// only once the upload is complete.
fn install_command(path: &str) -> String {
    let tmp = shell_escape(&format!("{}.tmp", path));
    let path = shell_escape(path);
    format!(
        "cat > {tmp} && chmod +x {tmp} && mv {tmp} {path}",
        tmp = tmp,
        path = path
    )
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run_agent(&self, payload: Vec<u8>, elevate: bool) -> Result<AgentOutput> {
        self.ensure_agent().await?;
        let mut command = self.ssh();
        if elevate {
            command.arg("sudo").arg("-n");
        }
        command.arg(shell_escape(&self.remote_path)).arg("agent");
        run_with_stdin(command, &payload).await
    }
}

/// Typed calls into the agent of one host.
#[derive(Clone)]
pub struct RemoteExecutionBridge {
    executor: Arc<dyn RemoteExecutor>,
}

impl RemoteExecutionBridge {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    pub fn host(&self) -> &str {
        self.executor.host()
    }

    /// Send one request.  Agent diagnostics are forwarded to the log; error
    /// responses and unreadable output become [`DeployError::Remote`].
    pub async fn call(&self, request: &Request, elevate: bool) -> Result<Response> {
        let host = self.host();
        debug!(
            "Calling {} on {}{}",
            request.name(),
            host,
            if elevate { " with elevated privileges" } else { "" }
        );
        let output = self
            .executor
            .run_agent(protocol::encode(request)?, elevate)
            .await?;
        for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!("[{}] {}", host, line);
        }

        if output.stdout.is_empty() {
            let reason = if output.success {
                "agent produced no response".to_string()
            } else {
                format!(
                    "agent failed: {}",
                    output.stderr.lines().last().unwrap_or("no output")
                )
            };
            return Err(DeployError::remote(host, reason));
        }

        let response = protocol::decode::<Response>(&output.stdout).map_err(|e| match e {
            DeployError::ProtocolVersion { .. } => e,
            other => DeployError::remote(host, format!("unreadable agent response: {}", other)),
        })?;
        match response {
            Response::Error { message } => Err(DeployError::remote(host, message)),
            response => Ok(response),
        }
    }

    fn unexpected(&self, request: &Request, response: Response) -> DeployError {
        DeployError::remote(
            self.host(),
            format!("unexpected answer to {}: {:?}", request.name(), response),
        )
    }

    pub async fn list_public_addresses(&self) -> Result<PublicAddresses> {
        let request = Request::ListPublicAddresses;
        match self.call(&request, false).await? {
            Response::PublicAddresses(addresses) => Ok(addresses),
            other => Err(self.unexpected(&request, other)),
        }
    }

    pub async fn probe_server(&self, port: u16, timeout: Duration, elevate: bool) -> Result<bool> {
        let request = Request::ProbeServer {
            port,
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.call(&request, elevate).await? {
            Response::ProbeServer { received } => Ok(received),
            other => Err(self.unexpected(&request, other)),
        }
    }

    pub async fn probe_client(
        &self,
        addresses: &PublicAddresses,
        port: u16,
        timeout: Duration,
    ) -> Result<Option<IpAddr>> {
        let request = Request::ProbeClient {
            addresses: addresses.clone(),
            port,
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.call(&request, false).await? {
            Response::ProbeClient { address } => Ok(address),
            other => Err(self.unexpected(&request, other)),
        }
    }
}
