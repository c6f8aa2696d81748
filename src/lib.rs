//! Deployment engine for client/server interop test runs: staged container
//! start, emulated or real network links, teardown and artifact harvest.

pub mod archive;
pub mod config;
pub mod deployment;
pub mod error;
pub mod factory;
pub mod hosts;
pub mod images;
pub mod monitor;
pub mod network;
pub mod remote;
pub mod runtime;
pub mod scheduler;
pub mod spec;
pub mod types;

pub use deployment::{Deployment, RunPaths, TestRun};
pub use error::{DeployError, Result};
pub use types::{ExecResult, Implementation, LinkMode, Role, TestCase};
