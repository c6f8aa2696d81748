//! Staged start, global timeout and teardown of one run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::monitor::{ContainerMonitor, MonitorState, RunContext};
use crate::network::NetworkTopology;
use crate::runtime::ContainerHandle;
use crate::types::{ContainerStatus, ExecResult};

/// Timing and retry knobs of the scheduler and its monitors.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Grace period the daemon gives a container on stop.
    pub stop_timeout: Duration,
    /// How long monitors get to finish after a graceful stop before kill.
    pub escalation_grace: Duration,
    /// How long monitors get to finish after kill before being abandoned.
    pub kill_grace: Duration,
    pub status_poll: Duration,
    pub start_retries: u32,
    pub start_retry_backoff: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            escalation_grace: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
            status_poll: Duration::from_millis(50),
            start_retries: 0,
            start_retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Stage number → indices of the containers in that stage.
pub type StageMap = BTreeMap<u32, Vec<usize>>;

pub fn stage_map(containers: &[ContainerHandle]) -> StageMap {
    let mut stages = StageMap::new();
    for (index, container) in containers.iter().enumerate() {
        stages.entry(container.stage).or_default().push(index);
    }
    stages
}

pub struct StageScheduler {
    settings: SchedulerSettings,
    topology: Option<Arc<NetworkTopology>>,
}

impl StageScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            settings,
            topology: None,
        }
    }

    /// Detach the run containers from these networks once the run is over.
    pub fn with_topology(mut self, topology: Arc<NetworkTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Start `containers` stage by stage and wait for them to finish, for
    /// at most `timeout` overall.  Containers are passed in creation order
    /// and are left in place; removing them is up to the caller.
    pub async fn run(&self, containers: Vec<ContainerHandle>, timeout: Duration) -> ExecResult {
        if containers.is_empty() {
            return ExecResult::default();
        }
        let mut deadline = Instant::now() + timeout;
        let stages = stage_map(&containers);
        let (ctx, mut log_rx) = RunContext::new(containers, self.settings.clone());
        let mut board = ctx.subscribe();
        let mut monitors: Vec<Option<JoinHandle<()>>> =
            (0..ctx.containers().len()).map(|_| None).collect();

        let mut timed_out = false;
        // Set when a stage failure pulled the deadline in; teardown then
        // still runs against it but it no longer counts as a timeout.
        let mut deadline_forced = false;
        let mut failed = false;
        let mut interrupted = false;

        for (stage, members) in &stages {
            debug!("Starting containers in stage {}", stage);

            if let Some(unexpected) = self.first_not_created(&ctx, members).await {
                error!("{}", unexpected);
                ctx.escalate(false).await;
                failed = true;
                break;
            }

            for &index in members {
                let monitor = ContainerMonitor::new(ctx.clone(), index);
                monitors[index] = Some(tokio::spawn(monitor.run()));
            }

            timed_out = false;
            let started = board.wait_for(|states| {
                members
                    .iter()
                    .all(|&index| states[index] != MonitorState::Created)
            });
            match timeout_at(deadline, started).await {
                Ok(_) => {}
                Err(_) => timed_out = true,
            }

            let not_running: Vec<String> = members
                .iter()
                .filter_map(|&index| {
                    let state = ctx.state(index);
                    (state != MonitorState::Running).then(|| {
                        format!("{}: {}", ctx.containers()[index].name, state.as_str())
                    })
                })
                .collect();
            if !not_running.is_empty() {
                error!("Some containers did not start successfully. Exiting.");
                error!("{}", not_running.join(", "));
                deadline = Instant::now();
                deadline_forced = true;
                ctx.escalate(false).await;
                failed = true;
                // don't start the next stage
                break;
            }
        }

        for (index, slot) in monitors.iter_mut().enumerate() {
            let Some(handle) = slot.as_mut() else {
                continue;
            };
            let finished = if interrupted {
                timeout_at(deadline, &mut *handle).await.is_ok()
            } else {
                tokio::select! {
                    joined = timeout_at(deadline, &mut *handle) => joined.is_ok(),
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Stopping containers");
                        interrupted = true;
                        false
                    }
                }
            };
            if finished {
                continue;
            }
            if !interrupted && !deadline_forced {
                timed_out = true;
            }
            ctx.escalate(false).await;
            if tokio::time::timeout(self.settings.escalation_grace, &mut *handle)
                .await
                .is_err()
            {
                ctx.escalate(true).await;
                if tokio::time::timeout(self.settings.kill_grace, &mut *handle)
                    .await
                    .is_err()
                {
                    warn!(
                        "Monitor of {} did not finish after kill, abandoning it",
                        ctx.containers()[index].name
                    );
                    handle.abort();
                }
            }
        }

        let mut exit_codes = BTreeMap::new();
        for container in ctx.containers() {
            match container.runtime.inspect(&container.id).await {
                Ok(state) if state.status == ContainerStatus::Exited => {
                    if let Some(code) = state.exit_code {
                        exit_codes.insert(container.service.clone(), code);
                    }
                }
                Ok(state) => {
                    if !failed {
                        error!(
                            "Container {} did not exit, but is in {} state.",
                            container.name, state.status
                        );
                    }
                    failed = true;
                }
                Err(e) => {
                    error!("Could not inspect {}: {}", container.name, e);
                    failed = true;
                }
            }
        }

        if let Some(topology) = &self.topology {
            if let Err(e) = topology.disconnect_all().await {
                warn!("Could not disconnect containers from the run networks: {}", e);
            }
        }

        if failed {
            error!("Starting containers failed.");
        }

        let mut log = Vec::new();
        while let Ok(line) = log_rx.try_recv() {
            log.push(line);
        }

        ExecResult {
            log,
            timed_out,
            exit_codes,
            failed,
            interrupted,
        }
    }

    /// Describe the first member of a stage that is not `created` any more.
    async fn first_not_created(&self, ctx: &RunContext, members: &[usize]) -> Option<String> {
        for &index in members {
            let container = &ctx.containers()[index];
            match container.runtime.status(&container.id).await {
                Ok(ContainerStatus::Created) => {}
                Ok(status) => {
                    return Some(format!(
                        "Container {} is {} before it was started",
                        container.name, status
                    ))
                }
                Err(e) => return Some(format!("Could not inspect {}: {}", container.name, e)),
            }
        }
        None
    }
}
