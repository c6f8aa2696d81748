//! One test run from container specs to harvested artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;

use crate::archive;
use crate::config::{Config, DEFAULT_HOST};
use crate::error::{DeployError, Result};
use crate::factory::{
    ContainerFactory, EndpointOptions, DOWNLOADS_PATH, LOGS_PATH, SIMULATOR_SERVICE,
};
use crate::hosts::HostRegistry;
use crate::images::ensure_image;
use crate::network::NetworkTopology;
use crate::remote::{negotiate_server_ip, NegotiationSettings};
use crate::runtime::{ContainerHandle, ContainerRuntime};
use crate::scheduler::StageScheduler;
use crate::spec::ContainerSpec;
use crate::types::{ExecResult, Implementation, LinkMode, Role, TestCase};

/// Link the simulator emulates when nothing else is asked for.
pub const DEFAULT_SCENARIO: &str = "simple-p2p --delay=15ms --bandwidth=10Mbps --queue=25";
/// The simulator of a debug session forwards packets without shaping them.
const DEBUG_SCENARIO: &str = "debug-scenario";
const COMPLIANCE_REQUEST: &str = "https://server4:443/";

/// Local directories a run reads from and writes to.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub certs: PathBuf,
    /// Content the server serves.
    pub www: PathBuf,
    /// Where the client's downloads end up.
    pub downloads: PathBuf,
    /// Container logs are harvested into one subdirectory per service.
    pub logs: PathBuf,
}

/// Everything `run_testcase` needs.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub testcase: TestCase,
    pub client: Implementation,
    pub server: Implementation,
    pub version: String,
    /// Space separated URLs the client requests.
    pub request_urls: String,
    pub paths: RunPaths,
    pub timeout: Duration,
}

/// Directory copied out of a container after the run.
struct Harvest {
    service: &'static str,
    remote: &'static str,
    local: PathBuf,
}

fn endpoint(
    implementation: &Implementation,
    role: Role,
    testcase: &str,
    version: &str,
    request_urls: &str,
    paths: &RunPaths,
) -> EndpointOptions {
    EndpointOptions {
        image: implementation.image.clone(),
        role,
        testcase: testcase.to_string(),
        version: version.to_string(),
        certs: paths.certs.clone(),
        request_urls: match role {
            Role::Client => Some(request_urls.to_string()),
            Role::Server => None,
        },
        www: match role {
            Role::Server => Some(paths.www.clone()),
            Role::Client => None,
        },
        downloads: match role {
            Role::Client => Some(paths.downloads.clone()),
            Role::Server => None,
        },
        entrypoint: None,
    }
}

/// Test case name no implementation knows.
fn random_testcase() -> String {
    let mut rng = rand::rng();
    (0..6)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}

pub struct Deployment {
    config: Config,
    hosts: HostRegistry,
    local: Arc<dyn ContainerRuntime>,
    factory: ContainerFactory,
    scheduler: StageScheduler,
}

impl Deployment {
    pub async fn new(config: Config) -> Result<Self> {
        let hosts = HostRegistry::from_config(&config);
        Self::with_registry(config, hosts).await
    }

    /// Build on an existing registry.  Emulated runs use its `default` host.
    pub async fn with_registry(config: Config, hosts: HostRegistry) -> Result<Self> {
        let local = hosts.get(DEFAULT_HOST).await?.runtime();
        let topology = Arc::new(NetworkTopology::new(
            config.project_name.clone(),
            config.networks.clone(),
            local.clone(),
        )?);
        let factory = ContainerFactory::new(
            config.project_name.clone(),
            config.simulator_image.clone(),
            config.real_link_setup_script.clone(),
            config.memlock,
            topology.clone(),
        );
        let scheduler = StageScheduler::new(config.scheduler_settings()).with_topology(topology);
        Ok(Self {
            config,
            hosts,
            local,
            factory,
            scheduler,
        })
    }

    /// Does the implementation reject a test case it cannot know?  Client
    /// checks run behind the simulator, server checks run alone.
    pub async fn run_compliance_check(
        &self,
        implementation: &Implementation,
        role: Role,
        paths: &RunPaths,
        version: &str,
    ) -> Result<ExecResult> {
        let testcase = random_testcase();
        info!(
            "Checking compliance of {} as {} with test case {}",
            implementation.name, role, testcase
        );
        let mut planned = Vec::new();
        if role == Role::Client {
            planned.push(self.factory.simulator_spec(DEFAULT_SCENARIO, false, None));
        }
        planned.push(self.factory.implementation_spec(&endpoint(
            implementation,
            role,
            &testcase,
            version,
            COMPLIANCE_REQUEST,
            paths,
        ))?);
        let planned = self.on_local(planned);
        self.execute(planned, self.config.compliance_timeout(), Vec::new())
            .await
    }

    /// Simulator, server and client idling for the debug timeout, to be
    /// poked at by hand.
    pub async fn run_debug_setup(
        &self,
        client: &Implementation,
        server: &Implementation,
        paths: &RunPaths,
    ) -> Result<ExecResult> {
        let timeout = self.config.debug_timeout();
        let sleep = Some(vec!["sleep".to_string(), timeout.as_secs().to_string()]);
        info!(
            "Starting debug session with {} and {} for {:?}",
            client.name, server.name, timeout
        );

        let sim = self
            .factory
            .simulator_spec(DEBUG_SCENARIO, false, sleep.clone());
        let mut server_options = endpoint(server, Role::Server, "transfer", "1", "", paths);
        server_options.entrypoint = sleep.clone();
        let mut client_options =
            endpoint(client, Role::Client, "transfer", "1", COMPLIANCE_REQUEST, paths);
        client_options.entrypoint = sleep;

        let planned = self.on_local(vec![
            sim,
            self.factory.implementation_spec(&server_options)?,
            self.factory.implementation_spec(&client_options)?,
        ]);
        self.execute(planned, timeout, Vec::new()).await
    }

    pub async fn run_testcase(&self, run: &TestRun) -> Result<ExecResult> {
        if !run.testcase.additional_containers.is_empty() {
            return Err(DeployError::Unsupported(format!(
                "{} requests additional containers: {}",
                run.testcase.name,
                run.testcase.additional_containers.join(", ")
            )));
        }
        info!(
            "Running {} with client {} and server {}",
            run.testcase.name, run.client.name, run.server.name
        );
        match &run.testcase.link {
            LinkMode::Emulated => self.run_emulated(run).await,
            LinkMode::Real {
                client_host,
                server_host,
            } => self.run_real_link(run, client_host, server_host).await,
        }
    }

    async fn run_emulated(&self, run: &TestRun) -> Result<ExecResult> {
        let testcase = &run.testcase;
        let server = endpoint(
            &run.server,
            Role::Server,
            testcase.testname(Role::Server),
            &run.version,
            &run.request_urls,
            &run.paths,
        );
        let client = endpoint(
            &run.client,
            Role::Client,
            testcase.testname(Role::Client),
            &run.version,
            &run.request_urls,
            &run.paths,
        );
        let planned = self.on_local(vec![
            self.factory.simulator_spec(&testcase.scenario, true, None),
            self.factory.implementation_spec(&server)?,
            self.factory.implementation_spec(&client)?,
        ]);
        let logs = &run.paths.logs;
        let harvest = vec![
            Harvest {
                service: Role::Server.as_str(),
                remote: LOGS_PATH,
                local: logs.join(Role::Server.as_str()),
            },
            Harvest {
                service: Role::Client.as_str(),
                remote: LOGS_PATH,
                local: logs.join(Role::Client.as_str()),
            },
            Harvest {
                service: SIMULATOR_SERVICE,
                remote: LOGS_PATH,
                local: logs.join(SIMULATOR_SERVICE),
            },
        ];
        self.execute(planned, run.timeout, harvest).await
    }

    async fn run_real_link(
        &self,
        run: &TestRun,
        client_alias: &str,
        server_alias: &str,
    ) -> Result<ExecResult> {
        let client_host = self.hosts.get(client_alias).await?;
        let server_host = self.hosts.get(server_alias).await?;
        let client_runtime = client_host.runtime();
        let server_runtime = server_host.runtime();

        // Nothing may be created before both hosts run the planned images.
        ensure_image(&*client_runtime, &run.client).await?;
        ensure_image(&*server_runtime, &run.server).await?;

        let settings = NegotiationSettings::from_config(&self.config);
        let negotiated =
            negotiate_server_ip(server_host.bridge()?, client_host.bridge()?, &settings).await?;
        let Some(server_ip) = negotiated else {
            error!(
                "Aborting {}: no address of {} is reachable from {}",
                run.testcase.name, server_alias, client_alias
            );
            return Ok(ExecResult::aborted());
        };

        let testcase = &run.testcase;
        let server = self.factory.real_link_spec(
            &endpoint(
                &run.server,
                Role::Server,
                testcase.testname(Role::Server),
                &run.version,
                &run.request_urls,
                &run.paths,
            ),
            server_ip,
            settings.port,
        )?;
        let client = self.factory.real_link_spec(
            &endpoint(
                &run.client,
                Role::Client,
                testcase.testname(Role::Client),
                &run.version,
                &run.request_urls,
                &run.paths,
            ),
            server_ip,
            settings.port,
        )?;

        let logs = &run.paths.logs;
        let harvest = vec![
            Harvest {
                service: Role::Client.as_str(),
                remote: DOWNLOADS_PATH,
                local: run.paths.downloads.clone(),
            },
            Harvest {
                service: Role::Server.as_str(),
                remote: LOGS_PATH,
                local: logs.join(Role::Server.as_str()),
            },
            Harvest {
                service: Role::Client.as_str(),
                remote: LOGS_PATH,
                local: logs.join(Role::Client.as_str()),
            },
        ];
        self.execute(
            vec![(server_runtime, server), (client_runtime, client)],
            run.timeout,
            harvest,
        )
        .await
    }

    fn on_local(
        &self,
        specs: Vec<ContainerSpec>,
    ) -> Vec<(Arc<dyn ContainerRuntime>, ContainerSpec)> {
        specs
            .into_iter()
            .map(|spec| (self.local.clone(), spec))
            .collect()
    }

    /// Create, run, harvest and remove.  Containers are created in the
    /// given order.
    async fn execute(
        &self,
        planned: Vec<(Arc<dyn ContainerRuntime>, ContainerSpec)>,
        timeout: Duration,
        harvest: Vec<Harvest>,
    ) -> Result<ExecResult> {
        let mut handles: Vec<ContainerHandle> = Vec::with_capacity(planned.len());
        for (runtime, spec) in &planned {
            match self.factory.create(runtime, spec).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("Creating {} failed: {}", spec.name, e);
                    remove_all(&handles).await;
                    return Err(e);
                }
            }
        }

        let result = self.scheduler.run(handles.clone(), timeout).await;
        info!("{}", result);

        for item in &harvest {
            if let Some(handle) = handles.iter().find(|h| h.service == item.service) {
                collect(handle, item.remote, &item.local).await;
            }
        }
        remove_all(&handles).await;

        if result.interrupted {
            return Err(DeployError::Interrupted);
        }
        Ok(result)
    }
}

async fn collect(handle: &ContainerHandle, remote: &str, local: &Path) {
    match archive::copy_from(handle, remote, local).await {
        Ok(files) => info!(
            "Collected {} files from {}:{} into {}",
            files.len(),
            handle.service,
            remote,
            local.display()
        ),
        Err(e) => warn!(
            "Could not collect {}:{}: {}",
            handle.service, remote, e
        ),
    }
}

/// Remove containers, last created first.
async fn remove_all(handles: &[ContainerHandle]) {
    for handle in handles.iter().rev() {
        match handle.runtime.remove(&handle.id).await {
            Ok(()) => debug!("Removed {}", handle.name),
            Err(e) if e.is_not_found() => debug!("{} was already removed", handle.name),
            Err(e) => warn!("Could not remove {}: {}", handle.name, e),
        }
    }
}
