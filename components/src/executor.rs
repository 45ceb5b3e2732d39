//! Runs one batch job end to end: images, volumes, inputs, the component
//! itself, then outputs. Cleanup always follows.

use crate::connection::{Connection, DEFAULT_STOP_TIMEOUT, INPUT_DIR, OUTPUT_DIR};
use crate::error::{ComponentFailure, ExecutionError, InfrastructureError};
use crate::host::{ContainerSpec, LogOptions, VolumeMount};
use crate::import::{BasicImageImporter, ImageImporter};
use crate::inputs::InputPrefixes;
use crate::interface::ComponentInterface;
use crate::logs::{self, LOG_LINES};
use crate::store::{BlobStore, JobStore, PostCreateHook};
use crate::values::ComponentInterfaceValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Exit status of a container killed by the kernel OOM killer.
const OOM_EXIT_CODE: i64 = 137;

#[derive(Debug)]
pub enum Outcome {
    Succeeded {
        outputs: Vec<ComponentInterfaceValue>,
    },
    /// The component failed; the message may be shown to its submitter.
    Failed(ComponentFailure),
    /// The platform failed.
    Errored(InfrastructureError),
}

#[derive(Debug)]
pub struct ExecutionResult {
    /// `None` if the component never ran to completion.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub outcome: Outcome,
    /// Cleanup failures never change the outcome.
    pub cleanup_error: Option<InfrastructureError>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }

    pub fn outputs(&self) -> &[ComponentInterfaceValue] {
        match &self.outcome {
            Outcome::Succeeded { outputs } => outputs,
            _ => &[],
        }
    }
}

pub struct Executor {
    connection: Connection,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobStore>,
    importer: Arc<dyn ImageImporter>,
    hooks: Vec<Arc<dyn PostCreateHook>>,
    inputs: Vec<ComponentInterfaceValue>,
    prefixes: InputPrefixes,
    outputs: Vec<ComponentInterface>,
    stop_timeout: Duration,
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
}

impl Executor {
    pub fn new(connection: Connection, blobs: Arc<dyn BlobStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self {
            connection,
            blobs,
            jobs,
            importer: Arc::new(BasicImageImporter::default()),
            hooks: Vec::new(),
            inputs: Vec::new(),
            prefixes: InputPrefixes::new(),
            outputs: Vec::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn inputs(mut self, inputs: Vec<ComponentInterfaceValue>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Places input `id` below `/input/{prefix}` instead of `/input/`.
    pub fn prefix(mut self, id: Uuid, prefix: impl Into<String>) -> Self {
        self.prefixes.insert(id, prefix.into());
        self
    }

    pub fn outputs(mut self, outputs: Vec<ComponentInterface>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn importer(mut self, importer: Arc<dyn ImageImporter>) -> Self {
        self.importer = importer;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn PostCreateHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Runs the pipeline without cleaning up. Most callers want [`Executor::run`].
    pub async fn execute(&mut self) -> Result<Vec<ComponentInterfaceValue>, ExecutionError> {
        self.connection.pull_images(self.blobs.as_ref()).await?;
        self.create_io_volumes().await?;
        self.connection
            .provision_input_volume(self.blobs.as_ref(), &self.inputs, &self.prefixes)
            .await?;
        self.chmod_volumes().await?;
        self.execute_container().await?;
        self.connection
            .get_outputs(
                &self.outputs,
                self.jobs.as_ref(),
                Arc::clone(&self.importer),
                &self.hooks,
            )
            .await
    }

    /// Runs the pipeline and then cleans up every object labeled with the
    /// job, whatever the outcome. If this future is dropped early the
    /// cleanup is scheduled on the runtime instead.
    #[instrument(skip(self), fields(job = %self.connection.label()))]
    pub async fn run(mut self) -> ExecutionResult {
        let guard = self.connection.cleanup_guard(self.stop_timeout);
        let outcome = match self.execute().await {
            Ok(outputs) => {
                info!(outputs = outputs.len(), "Job succeeded");
                Outcome::Succeeded { outputs }
            }
            Err(ExecutionError::Component(failure)) => {
                info!(code = failure.code(), %failure, "Component failed");
                Outcome::Failed(failure)
            }
            Err(ExecutionError::Infrastructure(error)) => {
                error!(code = error.code(), %error, "Job errored");
                Outcome::Errored(error)
            }
        };
        let cleanup_error = self
            .connection
            .stop_and_cleanup(self.stop_timeout)
            .await
            .err();
        guard.disarm();
        if let Some(error) = &cleanup_error {
            warn!(%error, "Cleanup failed");
        }
        ExecutionResult {
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            outcome,
            cleanup_error,
        }
    }

    async fn create_io_volumes(&self) -> Result<(), InfrastructureError> {
        for volume in [self.connection.input_volume(), self.connection.output_volume()] {
            self.connection
                .host()
                .create_volume(&volume, self.connection.labels())
                .await
                .map_err(InfrastructureError::host(format!("create volume {}", volume)))?;
        }
        Ok(())
    }

    /// Makes the I/O directories writable for whatever user the component
    /// runs as.
    async fn chmod_volumes(&self) -> Result<(), InfrastructureError> {
        let connection = &self.connection;
        let host = connection.host();
        let spec = ContainerSpec::new(
            connection.container_name("chmod-volumes"),
            connection.settings().io_image.clone(),
            connection.labels().clone(),
            connection.run_config().clone(),
        )
        .mount(VolumeMount::read_write(connection.input_volume(), INPUT_DIR))
        .mount(VolumeMount::read_write(connection.output_volume(), OUTPUT_DIR))
        .command(["chmod", "-R", "0777", INPUT_DIR, OUTPUT_DIR]);

        host.run_container(&spec)
            .await
            .map_err(InfrastructureError::host("start chmod helper"))?;
        let waited = host.wait_container(&spec.name).await;
        connection.remove_quietly(&spec.name).await;
        match waited.map_err(InfrastructureError::host("wait for chmod helper"))? {
            0 => Ok(()),
            exit_code => Err(InfrastructureError::HelperFailed {
                name: spec.name,
                exit_code,
            }),
        }
    }

    #[instrument(skip(self), fields(job = %self.connection.label()))]
    async fn execute_container(&mut self) -> Result<(), ExecutionError> {
        let connection = &self.connection;
        let host = connection.host();
        let run_config = connection.run_config();
        let spec = ContainerSpec::new(
            connection.container_name("executor"),
            connection.image().digest(),
            connection.labels().clone(),
            run_config.clone(),
        )
        .mount(VolumeMount::read_only(connection.input_volume(), INPUT_DIR))
        .mount(VolumeMount::read_write(connection.output_volume(), OUTPUT_DIR))
        .env(
            "NVIDIA_VISIBLE_DEVICES",
            connection.settings().nvidia_visible_devices.clone(),
        );

        host.run_container(&spec)
            .await
            .map_err(InfrastructureError::host("start executor"))?;
        let waited = host.wait_container(&spec.name).await;
        let stdout = host
            .container_logs(&spec.name, LogOptions::stdout(LOG_LINES))
            .await;
        let stderr = host
            .container_logs(&spec.name, LogOptions::stderr(LOG_LINES))
            .await;
        connection.remove_quietly(&spec.name).await;

        if let Ok(stdout) = &stdout {
            self.stdout = stdout.clone();
        }
        if let Ok(stderr) = &stderr {
            self.stderr = stderr.clone();
        }
        let exit_code = waited.map_err(InfrastructureError::host("wait for executor"))?;
        self.exit_code = Some(exit_code);
        info!(exit_code, "Executor finished");
        stdout.map_err(InfrastructureError::host("read executor stdout"))?;
        stderr.map_err(InfrastructureError::host("read executor stderr"))?;

        match exit_code {
            0 => Ok(()),
            OOM_EXIT_CODE => Err(ComponentFailure::MemoryLimitExceeded {
                limit_gb: run_config.memory_limit_gb,
            }
            .into()),
            exit_code => Err(ComponentFailure::NonZeroExit {
                exit_code,
                message: logs::user_error(&self.stderr),
            }
            .into()),
        }
    }
}
