//! Container backend
//!
//! The agent depends only on this narrow capability set of the container
//! runtime: create/start/inspect/wait/kill/remove for containers,
//! create/remove for networks, pull/inspect for images, plus label-filtered
//! listing for host-wide reconciliation.
//!
//! The trait keeps the executor testable against an in-memory fake.

pub mod cli;
#[cfg(test)]
pub mod fake;
pub mod labels;

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::BackendError;

pub use cli::CliBackend;
pub use labels::{ContainerKind, Labeler};

/// Result type alias for backend calls
pub type Result<T> = std::result::Result<T, BackendError>;

/// Everything needed to create a container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,

    /// Entrypoint override; empty keeps the image's entrypoint
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,

    /// Anonymous volumes declared at these container paths
    pub volumes: Vec<String>,

    /// Host bindings passed through verbatim
    pub binds: Vec<String>,

    /// Containers whose volumes are mounted into this one
    pub volumes_from: Vec<String>,

    pub network: Option<String>,
    pub network_aliases: Vec<String>,
    pub privileged: bool,
    pub cpus: Option<String>,
    pub memory: Option<String>,
    pub working_dir: Option<String>,
}

/// Subset of container inspect output the agent relies on
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,

    /// Container paths that are volume mount points
    pub volumes: Vec<String>,
    pub running: bool,
    pub status: String,
    pub exit_code: Option<i64>,
}

/// Subset of image inspect output the agent relies on
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub id: String,
    pub labels: BTreeMap<String, String>,
}

/// Container runtime client
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Creates a container and returns its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Inspects a container by id or name
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// Blocks until the container exits and returns its exit code
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Streams container output lines to `lines` until the container stops
    async fn follow_logs(&self, id: &str, lines: UnboundedSender<String>) -> Result<()>;

    /// Signals the container's processes to stop immediately
    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Force-removes a container and its anonymous volumes
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Lists ids of containers carrying all given labels
    async fn list_containers(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>>;

    /// Creates a network and returns the handle used to remove it
    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>)
    -> Result<String>;

    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Lists networks carrying all given labels
    async fn list_networks(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>>;

    async fn pull_image(&self, name: &str) -> Result<()>;

    async fn inspect_image(&self, name: &str) -> Result<ImageInfo>;
}
