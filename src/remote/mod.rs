//! Work that has to happen on the docker hosts themselves rather than in
//! containers: listing public addresses and probing reachability.

pub mod agent;
pub mod bridge;
pub mod negotiate;
pub mod protocol;
#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{LocalExecutor, RemoteExecutionBridge, RemoteExecutor, SshExecutor};
pub use negotiate::{negotiate_server_ip, NegotiationSettings};
