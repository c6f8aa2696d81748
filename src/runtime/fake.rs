//! Scripted in-memory runtime used by the unit tests.

use super::{ContainerHandle, ContainerRuntime, ContainerState, ImageInfo, NetworkInfo, WaitOutcome};
use crate::error::{DeployError, Result};
use crate::spec::{ContainerSpec, NetworkCreate};
use crate::types::ContainerStatus;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// How a fake container behaves once started.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub start_delay: Duration,
    /// `None` runs until stopped or killed.
    pub run_for: Option<Duration>,
    pub exit_code: i64,
    pub output: Vec<String>,
    pub start_error: Option<String>,
    /// Start succeeds but the container never leaves `created`.
    pub never_starts: bool,
    /// Graceful stop has no effect, only kill ends the container.
    pub ignore_stop: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(10),
            run_for: None,
            exit_code: 0,
            output: Vec::new(),
            start_error: None,
            never_starts: false,
            ignore_stop: false,
        }
    }
}

impl Behavior {
    pub fn runs_for(duration: Duration) -> Self {
        Self {
            run_for: Some(duration),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(String),
    Removed(String),
    Started(String),
    Stopped(String),
    Killed(String),
    NetworkCreated(String),
    Connected {
        network: String,
        container: String,
        ipv4: Option<Ipv4Addr>,
    },
    Disconnected {
        network: String,
        container: String,
    },
    Uploaded {
        container: String,
        path: String,
    },
    Pulled(String),
    Tagged {
        image: String,
        repo: String,
        tag: String,
    },
}

struct FakeContainer {
    id: String,
    name: String,
    behavior: Behavior,
    state: watch::Sender<ContainerState>,
}

impl FakeContainer {
    fn exit(&self, code: i64) {
        self.state.send_if_modified(|state| {
            if state.status == ContainerStatus::Exited {
                return false;
            }
            state.status = ContainerStatus::Exited;
            state.exit_code = Some(code);
            true
        });
    }
}

fn daemon_error(status_code: u16, message: &str) -> DeployError {
    DeployError::Docker(bollard::errors::Error::DockerResponseServerError {
        status_code,
        message: message.to_string(),
    })
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<Arc<FakeContainer>>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    events: Mutex<Vec<Event>>,
    created: Mutex<HashMap<String, ContainerSpec>>,
    running_at: Arc<Mutex<HashMap<String, Instant>>>,
    started_at: Mutex<HashMap<String, Instant>>,
    networks: Mutex<BTreeMap<String, NetworkInfo>>,
    images: Mutex<HashMap<String, ImageInfo>>,
    pullable: Mutex<HashMap<String, ImageInfo>>,
    archives: Mutex<HashMap<(String, String), Vec<u8>>>,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Behavior applied to containers later created for `service`.
    pub fn script(&self, service: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(service.to_string(), behavior);
    }

    /// Register a container in `created` state without going through a spec.
    pub fn add_container(
        self: &Arc<Self>,
        service: &str,
        stage: u32,
        behavior: Behavior,
    ) -> ContainerHandle {
        let name = format!("fake_{}", service);
        let id = self.insert(&name, behavior);
        ContainerHandle {
            id,
            name,
            service: service.to_string(),
            stage,
            runtime: self.clone(),
        }
    }

    fn insert(&self, name: &str, behavior: Behavior) -> String {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (state, _) = watch::channel(ContainerState {
            status: ContainerStatus::Created,
            exit_code: None,
        });
        self.containers.lock().unwrap().push(Arc::new(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            behavior,
            state,
        }));
        id
    }

    fn find(&self, id: &str) -> Result<Arc<FakeContainer>> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id || c.name == id)
            .cloned()
            .ok_or_else(|| daemon_error(404, &format!("No such container: {}", id)))
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// The request a container of `service` was last created from.
    pub fn created_spec(&self, service: &str) -> Option<ContainerSpec> {
        self.created.lock().unwrap().get(service).cloned()
    }

    pub fn started_at(&self, name: &str) -> Option<Instant> {
        self.started_at.lock().unwrap().get(name).copied()
    }

    pub fn running_at(&self, name: &str) -> Option<Instant> {
        self.running_at.lock().unwrap().get(name).copied()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn add_image(&self, reference: &str, info: ImageInfo) {
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), info);
    }

    pub fn add_pullable(&self, reference: &str, info: ImageInfo) {
        self.pullable
            .lock()
            .unwrap()
            .insert(reference.to_string(), info);
    }

    pub fn image(&self, reference: &str) -> Option<ImageInfo> {
        self.images.lock().unwrap().get(reference).cloned()
    }

    /// Archive returned by the next download of `path` from `container`.
    pub fn set_archive(&self, container: &str, path: &str, tar: Vec<u8>) {
        self.archives
            .lock()
            .unwrap()
            .insert((container.to_string(), path.to_string()), tar);
    }

    pub fn uploaded(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.archives
            .lock()
            .unwrap()
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    pub fn network(&self, name: &str) -> Option<NetworkInfo> {
        self.networks.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn host(&self) -> &str {
        "fake"
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        Ok(*self.find(id)?.state.borrow())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.find(&spec.name).is_ok() {
            return Err(daemon_error(409, "Conflict. The container name is already in use"));
        }
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&spec.service)
            .cloned()
            .unwrap_or_default();
        let id = self.insert(&spec.name, behavior);
        self.created
            .lock()
            .unwrap()
            .insert(spec.service.clone(), spec.clone());
        self.record(Event::Created(spec.name.clone()));
        Ok(id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let container = self.find(id)?;
        self.containers
            .lock()
            .unwrap()
            .retain(|c| c.id != container.id);
        self.record(Event::Removed(container.name.clone()));
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let container = self.find(id)?;
        self.record(Event::Started(container.name.clone()));
        self.started_at
            .lock()
            .unwrap()
            .insert(container.name.clone(), Instant::now());
        if let Some(message) = &container.behavior.start_error {
            return Err(daemon_error(500, message));
        }
        if container.behavior.never_starts {
            return Ok(());
        }
        let running_at = self.running_at.clone();
        tokio::spawn(async move {
            let c = container;
            tokio::time::sleep(c.behavior.start_delay).await;
            if c.state.borrow().status != ContainerStatus::Created {
                return;
            }
            running_at
                .lock()
                .unwrap()
                .insert(c.name.clone(), Instant::now());
            c.state.send_modify(|state| state.status = ContainerStatus::Running);
            if let Some(duration) = c.behavior.run_for {
                tokio::time::sleep(duration).await;
                c.exit(c.behavior.exit_code);
            }
        });
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        let container = self.find(id)?;
        self.record(Event::Stopped(container.name.clone()));
        let status = container.state.borrow().status;
        if status != ContainerStatus::Running {
            return Err(daemon_error(304, "container already stopped"));
        }
        if !container.behavior.ignore_stop {
            container.exit(container.behavior.exit_code);
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let container = self.find(id)?;
        self.record(Event::Killed(container.name.clone()));
        if container.state.borrow().status == ContainerStatus::Exited {
            return Err(daemon_error(409, "container is not running"));
        }
        // A stuck container that was never running ends up exited as well.
        container.exit(137);
        Ok(())
    }

    fn logs(&self, id: &str) -> BoxStream<'static, Result<Bytes>> {
        let container = match self.find(id) {
            Ok(c) => c,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let chunks = container
            .behavior
            .output
            .clone()
            .into_iter()
            .map(|s| Ok(Bytes::from(s)));
        let mut state = container.state.subscribe();
        let end = stream::once(async move {
            let _ = state
                .wait_for(|s| s.status == ContainerStatus::Exited)
                .await;
        })
        .filter_map(|_| async { None::<Result<Bytes>> });
        stream::iter(chunks).chain(end).boxed()
    }

    async fn wait(&self, id: &str) -> Result<WaitOutcome> {
        let container = self.find(id)?;
        let mut state = container.state.subscribe();
        let exit_code = state
            .wait_for(|s| s.status == ContainerStatus::Exited)
            .await
            .map(|s| s.exit_code)
            .unwrap_or(None);
        Ok(WaitOutcome {
            status_code: exit_code,
            ..Default::default()
        })
    }

    async fn upload_archive(&self, id: &str, path: &str, tar: Bytes) -> Result<()> {
        let container = self.find(id)?;
        self.record(Event::Uploaded {
            container: container.name.clone(),
            path: path.to_string(),
        });
        self.archives
            .lock()
            .unwrap()
            .insert((container.name.clone(), path.to_string()), tar.to_vec());
        Ok(())
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let container = self.find(id)?;
        self.archives
            .lock()
            .unwrap()
            .get(&(container.name.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| daemon_error(404, &format!("Could not find the file {}", path)))
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        Ok(self.networks.lock().unwrap().get(name).cloned())
    }

    async fn create_network(&self, request: &NetworkCreate) -> Result<String> {
        let id = format!("net-{}", request.name);
        self.networks.lock().unwrap().insert(
            request.name.clone(),
            NetworkInfo {
                id: id.clone(),
                containers: Vec::new(),
            },
        );
        self.record(Event::NetworkCreated(request.name.clone()));
        Ok(id)
    }

    async fn connect_network(
        &self,
        network: &str,
        id: &str,
        ipv4: Option<Ipv4Addr>,
        _ipv6: Option<Ipv6Addr>,
    ) -> Result<()> {
        let container = self.find(id)?;
        if network != crate::runtime::docker::ISOLATION_NETWORK {
            let mut networks = self.networks.lock().unwrap();
            let info = networks
                .get_mut(network)
                .ok_or_else(|| daemon_error(404, &format!("network {} not found", network)))?;
            info.containers.push(container.id.clone());
        }
        self.record(Event::Connected {
            network: network.to_string(),
            container: container.name.clone(),
            ipv4,
        });
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, id: &str) -> Result<()> {
        let container = self.find(id)?;
        if let Some(info) = self.networks.lock().unwrap().get_mut(network) {
            info.containers.retain(|c| *c != container.id);
        }
        self.record(Event::Disconnected {
            network: network.to_string(),
            container: container.name.clone(),
        });
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        Ok(self.images.lock().unwrap().get(reference).cloned())
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        let mut images = self.images.lock().unwrap();
        let info = images
            .get_mut(image)
            .ok_or_else(|| daemon_error(404, &format!("No such image: {}", image)))?;
        info.tags.push(format!("{}:{}", repo, tag));
        drop(images);
        self.record(Event::Tagged {
            image: image.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
        });
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.record(Event::Pulled(reference.to_string()));
        let info = self
            .pullable
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| daemon_error(404, &format!("manifest for {} not found", reference)))?;
        let mut images = self.images.lock().unwrap();
        images.insert(reference.to_string(), info.clone());
        images.insert(info.id.clone(), info);
        Ok(())
    }
}
