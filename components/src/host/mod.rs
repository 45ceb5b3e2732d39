//! The container runtime host: everything the engine needs from Docker.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::SpooledTempFile;
use thiserror::Error;

mod docker;
mod memory;

pub use docker::DockerHost;
pub use memory::{ContainerState, InMemoryHost, Program, ProgramContext};

pub type Labels = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("host returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl HostError {
    /// The host rejected the call but may accept it later, e.g. while another
    /// prune holds its internal lock.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HostError::Api { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HostError::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPolicy {
    Disabled,
    Attached(String),
}

/// Resource and isolation limits applied to every container of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub init: bool,
    pub network: NetworkPolicy,
    pub memory_limit_gb: u64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
    pub cpuset_cpus: String,
    pub runtime: Option<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub pids_limit: i64,
    pub log_driver: String,
    pub log_max_size: String,
}

impl RunConfig {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_limit_gb as i64).saturating_mul(1 << 30)
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn read_write(volume: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(volume: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// A container to create and start. Containers always run detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub mounts: Vec<VolumeMount>,
    pub labels: Labels,
    pub environment: BTreeMap<String, String>,
    pub tty: bool,
    pub auto_remove: bool,
    pub extra_hosts: Vec<String>,
    pub run_config: RunConfig,
}

impl ContainerSpec {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        labels: Labels,
        run_config: RunConfig,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: None,
            mounts: Vec::new(),
            labels,
            environment: BTreeMap::new(),
            tty: false,
            auto_remove: false,
            extra_hosts: Vec::new(),
            run_config,
        }
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn mount(mut self, mount: VolumeMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn tty(mut self) -> Self {
        self.tty = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub timestamps: bool,
    pub tail: usize,
}

impl LogOptions {
    pub fn stdout(tail: usize) -> Self {
        Self {
            stdout: true,
            stderr: false,
            timestamps: true,
            tail,
        }
    }

    pub fn stderr(tail: usize) -> Self {
        Self {
            stdout: false,
            stderr: true,
            timestamps: true,
            tail,
        }
    }

    /// Both streams interleaved, without timestamps.
    pub fn combined(tail: usize) -> Self {
        Self {
            stdout: true,
            stderr: true,
            timestamps: false,
            tail,
        }
    }
}

/// Selects containers by a `key=value` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerQuery {
    pub label: String,
    pub running_only: bool,
}

impl ContainerQuery {
    pub fn running(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            running_only: true,
        }
    }

    pub fn all(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            running_only: false,
        }
    }
}

#[async_trait]
pub trait RuntimeHost: Send + Sync {
    async fn image_exists(&self, reference: &str) -> Result<bool, HostError>;

    async fn pull_image(&self, reference: &str) -> Result<(), HostError>;

    /// Loads a `docker save` archive.
    async fn load_image(&self, archive: SpooledTempFile, timeout: Duration)
        -> Result<(), HostError>;

    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<(), HostError>;

    /// Creates and starts a container.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<(), HostError>;

    /// Waits until the container is no longer running and returns its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64, HostError>;

    async fn container_logs(&self, name: &str, options: LogOptions) -> Result<String, HostError>;

    /// Extracts a tar archive into directory `dir` of the container.
    async fn put_archive(
        &self,
        container: &str,
        dir: &str,
        archive: SpooledTempFile,
    ) -> Result<(), HostError>;

    /// Streams `path` out of the container as a tar archive. A missing path
    /// surfaces as [`HostError::NotFound`] from the stream.
    fn get_archive(&self, container: &str, path: &str) -> BoxStream<'static, Result<Bytes, HostError>>;

    /// Removes a container, killing it first if necessary.
    async fn remove_container(&self, name: &str) -> Result<(), HostError>;

    async fn list_containers(&self, query: &ContainerQuery) -> Result<Vec<String>, HostError>;

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), HostError>;

    /// Removes stopped containers carrying `label`.
    async fn prune_containers(&self, label: &str) -> Result<(), HostError>;

    /// Removes unused volumes carrying `label`, named volumes included.
    async fn prune_volumes(&self, label: &str) -> Result<(), HostError>;

    /// Gateway address of a network, if it has one.
    async fn network_gateway(&self, network: &str) -> Result<Option<String>, HostError>;
}
