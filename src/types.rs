//! Data structures shared by the deployment components.
//!
//! These describe what a test run is made of (roles, implementations,
//! test cases) and what it produces (the merged log, exit codes and the
//! final verdict).  They carry no daemon state; everything that talks to
//! a container runtime lives in [`crate::runtime`] and the components
//! built on top of it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Side of the protocol an endpoint container implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Client, Role::Server];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    pub fn opposite(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    /// Start order of endpoint containers: the simulator is stage 0, the
    /// server must be up before the client connects.
    pub fn stage(self) -> u32 {
        match self {
            Role::Server => 1,
            Role::Client => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a container as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
}

impl ContainerStatus {
    /// Map a docker state string onto the three states the scheduler
    /// cares about.  Paused and restarting containers still hold their
    /// process; dead and removing ones never run again.
    pub fn from_docker(state: &str) -> Option<Self> {
        match state {
            "created" => Some(ContainerStatus::Created),
            "running" | "paused" | "restarting" => Some(ContainerStatus::Running),
            "exited" | "dead" | "removing" => Some(ContainerStatus::Exited),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ANSI foreground colors cycled through per container.
const COLORS: [&str; 6] = [
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
    "\x1b[31m", // red
];
const RESET: &str = "\x1b[0m";

/// One line of container output in the merged run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub service: String,
    pub line: String,
    pub color_index: usize,
    pub name_width: usize,
}

impl LogLine {
    pub fn new(service: &str, line: impl Into<String>, index: usize, name_width: usize) -> Self {
        Self {
            service: service.to_string(),
            line: line.into(),
            color_index: index % COLORS.len(),
            name_width,
        }
    }

    pub fn color(&self) -> &'static str {
        COLORS[self.color_index % COLORS.len()]
    }

    /// `<colored padded service> | <line>`
    pub fn formatted(&self) -> String {
        format!(
            "{}{:<width$}{} | {}",
            self.color(),
            self.service,
            RESET,
            self.line,
            width = self.name_width
        )
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Lines of every container, in arrival order.
    pub log: Vec<LogLine>,
    pub timed_out: bool,
    /// Service name → exit code, for every container that exited.
    pub exit_codes: BTreeMap<String, i64>,
    /// Final verdict: a container failed to start or did not exit.
    pub failed: bool,
    /// The final join was interrupted by the user.
    pub interrupted: bool,
}

impl ExecResult {
    /// Result of a run that was abandoned before any container existed.
    pub fn aborted() -> Self {
        Self {
            failed: true,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.failed && !self.timed_out && !self.interrupted
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log_str = format!("log: {} lines", self.log.len());
        if self.timed_out {
            return write!(f, "<Result: Timeout; {}>", log_str);
        }
        let codes = self
            .exit_codes
            .iter()
            .map(|(name, code)| format!("{}: {}", name, code))
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "<Result: {}; {}>", codes, log_str)
    }
}

/// A protocol implementation under test, shipped as a container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub image: String,
    /// Content-addressed id the run must use on every host.
    pub image_id: String,
    #[serde(default)]
    pub image_repo_digests: Vec<String>,
    #[serde(default)]
    pub image_versions: Vec<String>,
}

/// How client and server are connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LinkMode {
    /// Both endpoints on the local host behind the network simulator.
    Emulated,
    /// Endpoints on distinct docker hosts connected by a real network path.
    Real {
        client_host: String,
        server_host: String,
    },
}

/// What the deployment needs to know about a test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Test name the client implementation is told to run.
    pub client_testname: String,
    /// Test name the server implementation is told to run.
    pub server_testname: String,
    /// Scenario handed to the network simulator.
    pub scenario: String,
    pub link: LinkMode,
    #[serde(default)]
    pub additional_containers: Vec<String>,
}

impl TestCase {
    pub fn testname(&self, role: Role) -> &str {
        match role {
            Role::Client => &self.client_testname,
            Role::Server => &self.server_testname,
        }
    }
}
