//! Per-container monitor tasks and the state they share with the scheduler.
//!
//! Every monitor drives one container through created → running → exited,
//! turning its output into log lines.  Completed lines go through a single
//! channel to the run log; partial lines never leave the monitor.  Status
//! transitions the scheduler waits on are published on a watch channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::runtime::ContainerHandle;
use crate::scheduler::SchedulerSettings;
use crate::types::{ContainerStatus, LogLine};

/// What the scheduler knows about a monitored container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Created,
    Running,
    Exited,
    /// The start call failed; the container never ran.
    Aborted,
}

impl From<ContainerStatus> for MonitorState {
    fn from(status: ContainerStatus) -> Self {
        match status {
            ContainerStatus::Created => MonitorState::Created,
            ContainerStatus::Running => MonitorState::Running,
            ContainerStatus::Exited => MonitorState::Exited,
        }
    }
}

impl MonitorState {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorState::Created => "created",
            MonitorState::Running => "running",
            MonitorState::Exited => "exited",
            MonitorState::Aborted => "aborted",
        }
    }
}

/// Splits a byte stream into lines.
///
/// Bytes are kept until a newline arrives so multi-byte characters split
/// across chunks decode correctly.  Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if let Some(line) = self.take() {
                    lines.push(line);
                }
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Whatever is left after the stream ended.
    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&bytes);
        let line = line.trim_end_matches('\r');
        (!line.is_empty()).then(|| line.to_string())
    }
}

/// State shared by the monitors and the scheduler of one run.
pub struct RunContext {
    /// In creation order.
    containers: Vec<ContainerHandle>,
    settings: SchedulerSettings,
    name_width: usize,
    /// Set once the daemon accepted the start call.
    launched: Vec<AtomicBool>,
    board: watch::Sender<Vec<MonitorState>>,
    log: mpsc::UnboundedSender<LogLine>,
}

impl RunContext {
    pub fn new(
        containers: Vec<ContainerHandle>,
        settings: SchedulerSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LogLine>) {
        let name_width = containers
            .iter()
            .map(|c| c.service.len())
            .max()
            .unwrap_or(0);
        let (board, _) = watch::channel(vec![MonitorState::Created; containers.len()]);
        let (log, log_rx) = mpsc::unbounded_channel();
        let launched = containers.iter().map(|_| AtomicBool::new(false)).collect();
        let ctx = Arc::new(Self {
            containers,
            settings,
            name_width,
            launched,
            board,
            log,
        });
        (ctx, log_rx)
    }

    pub fn containers(&self) -> &[ContainerHandle] {
        &self.containers
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<MonitorState>> {
        self.board.subscribe()
    }

    pub fn state(&self, index: usize) -> MonitorState {
        self.board.borrow()[index]
    }

    /// Record the first transition out of `Created`; later ones are only
    /// logged.
    fn publish(&self, index: usize, state: MonitorState) {
        self.board.send_if_modified(|states| {
            if states[index] != MonitorState::Created {
                return false;
            }
            states[index] = state;
            true
        });
    }

    /// Append a line to the run log, attributed to container `index`.
    pub fn push_line(&self, index: usize, line: impl Into<String>) {
        let service = &self.containers[index].service;
        let line = LogLine::new(service, line, index, self.name_width);
        debug!("{}", line.formatted());
        // The receiver lives as long as the scheduler; a closed channel
        // means the run result was already assembled.
        let _ = self.log.send(line);
    }

    /// Stop (or kill, with `force`) every running container in reverse
    /// creation order.  The forced pass also kills containers that were
    /// started but never left `created`.  Containers already exited are
    /// left alone, so calling this repeatedly is harmless.
    pub async fn escalate(&self, force: bool) {
        for (index, container) in self.containers.iter().enumerate().rev() {
            let stuck = match container.runtime.status(&container.id).await {
                Ok(ContainerStatus::Running) => false,
                Ok(ContainerStatus::Created)
                    if force && self.launched[index].load(Ordering::SeqCst) =>
                {
                    true
                }
                Ok(_) => continue,
                Err(e) if e.is_not_found() => {
                    debug!("Container {} vanished before teardown", container.name);
                    continue;
                }
                Err(e) => {
                    warn!("Could not inspect {}: {}", container.name, e);
                    continue;
                }
            };
            let result = if force {
                self.push_line(index, "Killing container...");
                container.runtime.kill(&container.id).await
            } else {
                self.push_line(index, "Stopping container...");
                container
                    .runtime
                    .stop(&container.id, self.settings.stop_timeout)
                    .await
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() || e.is_not_modified() => {
                    debug!("Container {} already gone: {}", container.name, e)
                }
                Err(e) if stuck && e.is_conflict() => {
                    debug!(
                        "Container {} could not be killed before running: {}",
                        container.name, e
                    )
                }
                Err(e) => warn!("Could not stop {}: {}", container.name, e),
            }
        }
    }

    /// Any container ending ends the whole run.
    async fn end_of_run(&self) {
        self.escalate(false).await;
    }
}

/// Drives one container and reports on it.
pub struct ContainerMonitor {
    ctx: Arc<RunContext>,
    index: usize,
    status: ContainerStatus,
    buffer: LineBuffer,
}

impl ContainerMonitor {
    pub fn new(ctx: Arc<RunContext>, index: usize) -> Self {
        Self {
            ctx,
            index,
            status: ContainerStatus::Created,
            buffer: LineBuffer::default(),
        }
    }

    fn container(&self) -> &ContainerHandle {
        &self.ctx.containers[self.index]
    }

    fn log(&self, line: impl Into<String>) {
        self.ctx.push_line(self.index, line);
    }

    async fn abort(&self, reason: String) {
        self.log(reason);
        self.ctx.publish(self.index, MonitorState::Aborted);
        self.ctx.end_of_run().await;
    }

    /// Re-read the status and log it if it changed.
    async fn refresh_status(&mut self) -> bool {
        let container = self.container().clone();
        match container.runtime.status(&container.id).await {
            Ok(status) if status != self.status => {
                self.status = status;
                self.log(status.as_str());
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Could not inspect {}: {}", container.name, e);
                false
            }
        }
    }

    async fn start(&self) -> Result<(), String> {
        let container = self.container();
        let settings = self.ctx.settings();
        let mut attempt = 0;
        loop {
            match container.runtime.start(&container.id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < settings.start_retries => {
                    attempt += 1;
                    self.log(e.to_string());
                    warn!(
                        "Starting {} failed, retry {}/{}",
                        container.name, attempt, settings.start_retries
                    );
                    tokio::time::sleep(settings.start_retry_backoff).await;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    pub async fn run(mut self) {
        let container = self.container().clone();

        match container.runtime.status(&container.id).await {
            Ok(ContainerStatus::Created) => {}
            Ok(status) => {
                return self
                    .abort(format!("Refusing to start, container is {}", status))
                    .await;
            }
            Err(e) => return self.abort(e.to_string()).await,
        }

        self.log("Starting...");
        if let Err(reason) = self.start().await {
            return self.abort(reason).await;
        }
        self.ctx.launched[self.index].store(true, Ordering::SeqCst);

        let poll = self.ctx.settings().status_poll;
        loop {
            match container.runtime.status(&container.id).await {
                Ok(status) if status != self.status => {
                    self.status = status;
                    self.log(status.as_str());
                    self.ctx.publish(self.index, status.into());
                    break;
                }
                Ok(_) => tokio::time::sleep(poll).await,
                Err(e) => return self.abort(e.to_string()).await,
            }
        }

        let mut output = container.runtime.logs(&container.id);
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in self.buffer.push(&bytes) {
                        self.log(line);
                    }
                }
                Err(e) => {
                    warn!("Log stream of {} broke: {}", container.name, e);
                    break;
                }
            }
        }
        if let Some(rest) = self.buffer.flush() {
            self.log(rest);
        }

        // container stopped
        self.refresh_status().await;

        match container.runtime.wait(&container.id).await {
            Ok(outcome) => {
                if let Some(error) = outcome.error {
                    self.log(format!("error: {}", error));
                    self.ctx.end_of_run().await;
                    return;
                }
                if let Some(code) = outcome.status_code {
                    self.log(format!("exit status {}", code));
                }
                if !outcome.extra.is_empty() {
                    warn!("Unknown container result: {:?}", outcome.extra);
                }
            }
            Err(e) => warn!("Waiting for {} failed: {}", container.name, e),
        }

        self.refresh_status().await;
        self.ctx.end_of_run().await;
    }
}
