//! A job's handle on the runtime host.
//!
//! Every object the engine creates for a job carries the label
//! `job=<label>`, so cleanup never needs to remember what was created:
//! it stops and prunes by label.

use crate::error::InfrastructureError;
use crate::host::{
    ContainerQuery, ContainerSpec, Labels, NetworkPolicy, RunConfig, RuntimeHost, VolumeMount,
};
use crate::images::ImageReference;
use crate::job::JobRef;
use crate::retry::{RetryFailure, RetryPolicy};
use config_loader::ComponentsSettings;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub const INPUT_DIR: &str = "/input/";
pub const OUTPUT_DIR: &str = "/output/";

const LOG_MAX_SIZE: &str = "1g";

/// Smallest limit handed to the host. A zero limit means unlimited there.
pub const MIN_MEMORY_LIMIT_GB: u64 = 1;

/// Never run a component with more memory than the operator allows.
pub fn effective_memory_limit(requested_gb: u64, ceiling_gb: u64) -> u64 {
    requested_gb.min(ceiling_gb).max(MIN_MEMORY_LIMIT_GB)
}

/// Cpuset covering every CPU of a host with `cpus` CPUs.
pub fn default_cpuset(cpus: usize) -> String {
    if cpus <= 1 {
        "0".to_string()
    } else {
        format!("0-{}", cpus - 1)
    }
}

pub fn resolve_run_config(settings: &ComponentsSettings, memory_limit_gb: u64) -> RunConfig {
    let cpuset_cpus = match settings.cpuset_cpus.as_deref() {
        Some(cpuset) if !cpuset.is_empty() => cpuset.to_string(),
        _ => default_cpuset(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        ),
    };
    RunConfig {
        init: true,
        network: NetworkPolicy::Disabled,
        memory_limit_gb: effective_memory_limit(memory_limit_gb, settings.memory_limit),
        cpu_period: settings.cpu_period,
        cpu_quota: settings.cpu_quota,
        cpu_shares: settings.cpu_shares,
        cpuset_cpus,
        runtime: settings.docker.runtime.clone(),
        cap_drop: vec!["ALL".to_string()],
        security_opt: vec!["no-new-privileges".to_string()],
        pids_limit: settings.pids_limit,
        log_driver: "json-file".to_string(),
        log_max_size: LOG_MAX_SIZE.to_string(),
    }
}

pub struct Connection {
    host: Arc<dyn RuntimeHost>,
    settings: Arc<ComponentsSettings>,
    job: JobRef,
    label: String,
    labels: Labels,
    image: ImageReference,
    run_config: RunConfig,
    retry: RetryPolicy,
}

impl Connection {
    pub fn new(
        host: Arc<dyn RuntimeHost>,
        settings: Arc<ComponentsSettings>,
        job: JobRef,
        image: ImageReference,
        memory_limit_gb: u64,
    ) -> Self {
        let label = job.label();
        let labels = Labels::from([
            ("job".to_string(), label.clone()),
            ("traefik.enable".to_string(), "false".to_string()),
        ]);
        let run_config = resolve_run_config(&settings, memory_limit_gb);
        Self {
            host,
            settings,
            job,
            label,
            labels,
            image,
            run_config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host(&self) -> &Arc<dyn RuntimeHost> {
        &self.host
    }

    pub fn settings(&self) -> &ComponentsSettings {
        &self.settings
    }

    pub fn job(&self) -> &JobRef {
        &self.job
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    pub(crate) fn container_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.label, suffix)
    }

    pub(crate) fn input_volume(&self) -> String {
        self.container_name("input")
    }

    pub(crate) fn output_volume(&self) -> String {
        self.container_name("output")
    }

    /// A detached tty container of the I/O helper image, kept alive so
    /// archives can be copied through it.
    pub(crate) fn helper(&self, suffix: &str, mount: VolumeMount) -> ContainerSpec {
        ContainerSpec::new(
            self.container_name(suffix),
            self.settings.io_image.clone(),
            self.labels.clone(),
            self.run_config.clone(),
        )
        .mount(mount)
        .tty()
    }

    /// Force-removes a helper container. Failures are logged; the label
    /// prune at the end of the job removes anything left behind.
    pub(crate) async fn remove_quietly(&self, name: &str) {
        if let Err(error) = self.host.remove_container(name).await {
            if !error.is_not_found() {
                warn!(container = name, %error, "Failed to remove container");
            }
        }
    }

    pub fn cleaner(&self) -> Cleaner {
        Cleaner {
            host: Arc::clone(&self.host),
            label: self.label.clone(),
            retry: self.retry,
        }
    }

    pub async fn stop_and_cleanup(&self, timeout: Duration) -> Result<(), InfrastructureError> {
        self.cleaner().stop_and_cleanup(timeout).await
    }

    /// Schedules [`Connection::stop_and_cleanup`] if dropped while armed.
    pub fn cleanup_guard(&self, timeout: Duration) -> CleanupGuard {
        CleanupGuard {
            cleaner: Some(self.cleaner()),
            timeout,
        }
    }
}

/// Removes everything labeled with one job. Cheap to clone and independent
/// of the [`Connection`] it came from.
#[derive(Clone)]
pub struct Cleaner {
    host: Arc<dyn RuntimeHost>,
    label: String,
    retry: RetryPolicy,
}

impl Cleaner {
    pub fn new(host: Arc<dyn RuntimeHost>, job: &JobRef) -> Self {
        Self {
            host,
            label: job.label(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn filter(&self) -> String {
        format!("job={}", self.label)
    }

    /// Stops running containers of the job, then prunes its stopped
    /// containers and its volumes. Safe to call any number of times.
    #[instrument(skip(self), fields(job = %self.label))]
    pub async fn stop_and_cleanup(&self, timeout: Duration) -> Result<(), InfrastructureError> {
        let filter = self.filter();
        let running = self
            .host
            .list_containers(&ContainerQuery::running(filter.clone()))
            .await
            .map_err(InfrastructureError::host("list containers"))?;
        for name in running {
            match self.host.stop_container(&name, timeout).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    return Err(InfrastructureError::Host {
                        operation: format!("stop container {}", name),
                        source: error,
                    })
                }
            }
        }

        let host = &self.host;
        let label = filter.as_str();
        self.retry
            .run("prune containers", move || host.prune_containers(label))
            .await
            .map_err(|failure| self.prune_failed("containers", failure))?;
        self.retry
            .run("prune volumes", move || host.prune_volumes(label))
            .await
            .map_err(|failure| self.prune_failed("volumes", failure))?;

        info!("Cleaned up job resources");
        Ok(())
    }

    fn prune_failed(&self, resource: &'static str, failure: RetryFailure) -> InfrastructureError {
        if failure.exhausted {
            InfrastructureError::PruneExhausted {
                resource,
                label: self.label.clone(),
                attempts: failure.attempts,
                source: failure.error,
            }
        } else {
            InfrastructureError::Host {
                operation: format!("prune {}", resource),
                source: failure.error,
            }
        }
    }
}

/// Runs the job's cleanup on the ambient tokio runtime when dropped armed,
/// e.g. when the future driving a job is cancelled.
pub struct CleanupGuard {
    cleaner: Option<Cleaner>,
    timeout: Duration,
}

impl CleanupGuard {
    pub fn disarm(mut self) {
        self.cleaner = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(cleaner) = self.cleaner.take() else {
            return;
        };
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(job = %cleaner.label, "Job dropped before cleanup, scheduling cleanup");
                handle.spawn(async move {
                    if let Err(error) = cleaner.stop_and_cleanup(timeout).await {
                        warn!(%error, "Deferred cleanup failed");
                    }
                });
            }
            Err(_) => {
                warn!(job = %cleaner.label, "No runtime available, job resources were not cleaned up");
            }
        }
    }
}
