//! Error type shared by every deployment component.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("docker daemon error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid container request: {0}")]
    InvalidSpec(String),

    #[error("invalid network topology: {0}")]
    InvalidTopology(String),

    #[error("container {container} is {status}, expected {expected}")]
    UnexpectedStatus {
        container: String,
        status: String,
        expected: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A remote operation could not be carried out.
    #[error("remote execution on {host} failed: {reason}")]
    Remote { host: String, reason: String },

    #[error("remote protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersion { expected: u32, got: u32 },

    /// Client and server side of the address negotiation disagree.
    #[error("negotiation contract violated: {0}")]
    NegotiationContract(String),

    #[error("unknown docker host alias: {0}")]
    UnknownHost(String),

    #[error("image {image} not available with id {image_id} on {host} and could not be pulled")]
    ImageUnavailable {
        image: String,
        image_id: String,
        host: String,
    },

    #[error("unsupported test case: {0}")]
    Unsupported(String),

    #[error("interrupted")]
    Interrupted,
}

impl DeployError {
    pub fn remote(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Remote {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// True for explicit not-found errors and for daemon 404 responses.
    pub fn is_not_found(&self) -> bool {
        match self {
            DeployError::NotFound(_) => true,
            DeployError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }

    /// True when the daemon reports that nothing had to be done, e.g. when
    /// stopping a container that already stopped.
    pub fn is_not_modified(&self) -> bool {
        matches!(
            self,
            DeployError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            })
        )
    }

    /// True for daemon 409 responses, e.g. killing a container that is not
    /// running.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DeployError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                ..
            })
        )
    }
}
