use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::network::NetworkSpecs;
use crate::remote::protocol::PROTOCOL_VERSION;
use crate::scheduler::SchedulerSettings;

pub const DEFAULT_HOST: &str = "default";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NegotiationConfig {
    /// UDP port the server will publish, probed before the run.
    pub port: u16,
    pub timeout_secs: u64,
    /// Head start of the probe listener before the client sends.
    pub server_startup_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            port: 443,
            timeout_secs: 10,
            server_startup_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Where the companion binary lives on remote hosts.
    pub remote_path: String,
    /// Binary uploaded to remote hosts; defaults to the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_binary: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            remote_path: format!("/tmp/interop-deploy-agent-v{}", PROTOCOL_VERSION),
            local_binary: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub project_name: String,
    /// Alias → daemon URL (`unix://`, `tcp://`, `http://` or `ssh://`).
    pub docker_hosts: BTreeMap<String, String>,
    pub simulator_image: String,
    /// Copied to `/setup.sh` in real-link endpoints.
    pub real_link_setup_script: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memlock: Option<i64>,
    pub stop_timeout_secs: u64,
    pub escalation_grace_ms: u64,
    pub kill_grace_ms: u64,
    pub status_poll_ms: u64,
    /// Extra start attempts after a daemon error; 0 fails immediately.
    pub start_retries: u32,
    pub start_retry_backoff_ms: u64,
    pub compliance_timeout_secs: u64,
    pub debug_timeout_secs: u64,
    pub negotiation: NegotiationConfig,
    pub agent: AgentConfig,
    pub networks: NetworkSpecs,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: "interop-runner".into(),
            docker_hosts: BTreeMap::from([(
                DEFAULT_HOST.to_string(),
                "unix:///var/run/docker.sock".to_string(),
            )]),
            simulator_image: "therealsedrubal/quic-network-simulator".into(),
            real_link_setup_script: PathBuf::from("real_link_setup.sh"),
            memlock: Some(67_108_864),
            stop_timeout_secs: 10,
            escalation_grace_ms: 1000,
            kill_grace_ms: 5000,
            status_poll_ms: 50,
            start_retries: 0,
            start_retry_backoff_ms: 500,
            compliance_timeout_secs: 30,
            debug_timeout_secs: 60 * 60,
            negotiation: NegotiationConfig::default(),
            agent: AgentConfig::default(),
            networks: NetworkSpecs::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("interop-deploy.toml"))
                .merge(Json::file("interop-deploy.json"))
                .merge(Env::prefixed("INTEROP_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // A host table from a file replaces the defaults wholesale; keep the
        // local daemon reachable under its usual alias.
        config
            .docker_hosts
            .entry(DEFAULT_HOST.to_string())
            .or_insert_with(|| "unix:///var/run/docker.sock".to_string());

        config
            .networks
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid network configuration: {}", e))?;

        Ok(config)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            escalation_grace: Duration::from_millis(self.escalation_grace_ms),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            status_poll: Duration::from_millis(self.status_poll_ms),
            start_retries: self.start_retries,
            start_retry_backoff: Duration::from_millis(self.start_retry_backoff_ms),
        }
    }

    pub fn compliance_timeout(&self) -> Duration {
        Duration::from_secs(self.compliance_timeout_secs)
    }

    pub fn debug_timeout(&self) -> Duration {
        Duration::from_secs(self.debug_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation.timeout_secs)
    }
}
