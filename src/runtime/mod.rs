use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::spec::{ContainerSpec, NetworkCreate};
use crate::types::ContainerStatus;

pub mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerRuntime;

/// Snapshot of a container's daemon-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
}

/// What the daemon reported when a container finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    pub status_code: Option<i64>,
    pub error: Option<String>,
    /// Any other fields of the wait response.
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    /// Ids of attached containers.
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub tags: Vec<String>,
}

/// The daemon operations the deployment engine relies on.
///
/// Every container id parameter also accepts a container name.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Where the daemon lives, for log messages.
    fn host(&self) -> &str;

    async fn inspect(&self, id: &str) -> Result<ContainerState>;

    async fn status(&self, id: &str) -> Result<ContainerStatus> {
        Ok(self.inspect(id).await?.status)
    }

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Graceful stop; the daemon kills the container after `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;
    async fn kill(&self, id: &str) -> Result<()>;

    /// Follow the container's output until the daemon closes the stream.
    fn logs(&self, id: &str) -> BoxStream<'static, Result<Bytes>>;

    /// Block until the container exits.
    async fn wait(&self, id: &str) -> Result<WaitOutcome>;

    /// Extract an uncompressed tar stream at `path` inside the container.
    async fn upload_archive(&self, id: &str, path: &str, tar: Bytes) -> Result<()>;
    /// Tar stream of `path` inside the container.
    async fn download_archive(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>>;
    async fn create_network(&self, request: &NetworkCreate) -> Result<String>;
    async fn connect_network(
        &self,
        network: &str,
        id: &str,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Result<()>;
    async fn disconnect_network(&self, network: &str, id: &str) -> Result<()>;

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;
    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()>;
    async fn pull_image(&self, reference: &str) -> Result<()>;
}

/// A created container together with the runtime that owns it.
#[derive(Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub service: String,
    pub stage: u32,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("stage", &self.stage)
            .field("host", &self.runtime.host())
            .finish()
    }
}
