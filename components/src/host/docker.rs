use super::{
    ContainerQuery, ContainerSpec, HostError, Labels, LogOptions, NetworkPolicy, RuntimeHost,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogsOptions, PruneContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, ImportImageOptions};
use bollard::models::{HostConfig, HostConfigLogConfig};
use bollard::network::InspectNetworkOptions;
use bollard::volume::{CreateVolumeOptions, PruneVolumesOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use config_loader::DockerSettings;
use futures_util::stream::{self, BoxStream, Stream};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::SpooledTempFile;
use tracing::{debug, instrument, warn};

const UPLOAD_CHUNK: usize = 8 * 1024 * 1024;

impl From<DockerError> for HostError {
    fn from(error: DockerError) -> Self {
        match error {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => HostError::NotFound { message },
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => HostError::Api {
                status: status_code,
                message,
            },
            other => HostError::Transport {
                message: other.to_string(),
            },
        }
    }
}

/// [`RuntimeHost`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerHost {
    docker: Docker,
}

impl DockerHost {
    pub fn connect(settings: &DockerSettings) -> Result<Self, HostError> {
        let timeout = settings.timeout_secs;
        let docker = match (&settings.base_url, &settings.tls) {
            (Some(url), Some(tls)) => Docker::connect_with_ssl(
                url,
                &tls.key,
                &tls.cert,
                &tls.ca_cert,
                timeout,
                API_DEFAULT_VERSION,
            )?,
            (Some(url), None) if url.starts_with("unix://") => {
                Docker::connect_with_unix(url, timeout, API_DEFAULT_VERSION)?
            }
            (Some(url), None) => Docker::connect_with_http(url, timeout, API_DEFAULT_VERSION)?,
            (None, _) => Docker::connect_with_local_defaults()?
                .with_timeout(Duration::from_secs(timeout)),
        };
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Splits `repo[:tag]` into its parts, defaulting the tag to `latest`.
/// Digest references are returned whole with an empty tag.
pub(crate) fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => (
            &reference[..name_start + i],
            &reference[name_start + i + 1..],
        ),
        None => (reference, "latest"),
    }
}

/// First error hit while reading an upload body. Request bodies carry only
/// bytes, so a failed read ends the body early and is reported from here.
#[derive(Clone, Default)]
struct ReadFailure(Arc<Mutex<Option<String>>>);

impl ReadFailure {
    fn record(&self, message: String) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(message);
        }
    }

    fn check(&self) -> Result<(), HostError> {
        match self.0.lock().ok().and_then(|mut slot| slot.take()) {
            Some(message) => Err(HostError::Transport { message }),
            None => Ok(()),
        }
    }
}

fn chunked<R>(reader: R, failure: ReadFailure) -> impl Stream<Item = Bytes> + Send + 'static
where
    R: Read + Send + 'static,
{
    stream::unfold(Some(reader), move |state| {
        let failure = failure.clone();
        async move {
            let mut reader = state?;
            let read = tokio::task::spawn_blocking(move || {
                let mut buffer = vec![0u8; UPLOAD_CHUNK];
                let n = reader.read(&mut buffer)?;
                buffer.truncate(n);
                Ok::<_, std::io::Error>((reader, buffer))
            })
            .await;
            match read {
                Ok(Ok((_, buffer))) if buffer.is_empty() => None,
                Ok(Ok((reader, buffer))) => Some((Bytes::from(buffer), Some(reader))),
                Ok(Err(error)) => {
                    warn!(error = %error, "Reading archive failed");
                    failure.record(format!("reading archive failed: {error}"));
                    None
                }
                Err(error) => {
                    warn!(error = %error, "Archive reader panicked");
                    failure.record(format!("archive reader panicked: {error}"));
                    None
                }
            }
        }
    })
}

#[async_trait]
impl RuntimeHost for DockerHost {
    async fn image_exists(&self, reference: &str) -> Result<bool, HostError> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(error) => match HostError::from(error) {
                HostError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, reference: &str) -> Result<(), HostError> {
        let (repo, tag) = split_reference(reference);
        let options = CreateImageOptions {
            from_image: repo,
            tag,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(status) = info.status {
                debug!(status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, archive))]
    async fn load_image(
        &self,
        archive: SpooledTempFile,
        timeout: Duration,
    ) -> Result<(), HostError> {
        let docker = self.docker.clone().with_timeout(timeout);
        let failure = ReadFailure::default();
        let mut progress = docker.import_image_stream(
            ImportImageOptions { quiet: true },
            chunked(archive, failure.clone()),
            None,
        );
        while let Some(info) = progress.next().await {
            failure.check()?;
            let info = info?;
            if let Some(error) = info.error {
                return Err(HostError::Api {
                    status: 500,
                    message: error,
                });
            }
        }
        failure.check()
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<(), HostError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(container = %spec.name))]
    async fn run_container(&self, spec: &ContainerSpec) -> Result<(), HostError> {
        let run = &spec.run_config;
        let binds = spec
            .mounts
            .iter()
            .map(|m| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", m.volume, m.target, mode)
            })
            .collect();
        let host_config = HostConfig {
            binds: Some(binds),
            init: Some(run.init),
            memory: Some(run.memory_bytes()),
            memory_swap: Some(run.memory_bytes()),
            cpu_period: Some(run.cpu_period),
            cpu_quota: Some(run.cpu_quota),
            cpu_shares: Some(run.cpu_shares),
            cpuset_cpus: Some(run.cpuset_cpus.clone()),
            runtime: run.runtime.clone(),
            cap_drop: Some(run.cap_drop.clone()),
            security_opt: Some(run.security_opt.clone()),
            pids_limit: Some(run.pids_limit),
            log_config: Some(HostConfigLogConfig {
                typ: Some(run.log_driver.clone()),
                config: Some(HashMap::from([(
                    "max-size".to_string(),
                    run.log_max_size.clone(),
                )])),
            }),
            auto_remove: Some(spec.auto_remove),
            extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
            network_mode: match &run.network {
                NetworkPolicy::Disabled => None,
                NetworkPolicy::Attached(network) => Some(network.clone()),
            },
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(
                spec.environment
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            tty: Some(spec.tty),
            network_disabled: Some(run.network == NetworkPolicy::Disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64, HostError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // non-zero exits arrive as errors carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(error)) => Err(error.into()),
            None => Err(HostError::Transport {
                message: format!("wait for {} ended without a status", name),
            }),
        }
    }

    async fn container_logs(&self, name: &str, options: LogOptions) -> Result<String, HostError> {
        let options = LogsOptions::<String> {
            stdout: options.stdout,
            stderr: options.stderr,
            timestamps: options.timestamps,
            tail: options.tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            logs.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }
        Ok(logs)
    }

    async fn put_archive(
        &self,
        container: &str,
        dir: &str,
        archive: SpooledTempFile,
    ) -> Result<(), HostError> {
        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };
        let failure = ReadFailure::default();
        let uploaded = self
            .docker
            .upload_to_container_streaming(
                container,
                Some(options),
                chunked(archive, failure.clone()),
            )
            .await;
        failure.check()?;
        uploaded?;
        Ok(())
    }

    fn get_archive(&self, container: &str, path: &str) -> BoxStream<'static, Result<Bytes, HostError>> {
        let docker = self.docker.clone();
        let container = container.to_string();
        let path = path.to_string();
        Box::pin(async_stream::try_stream! {
            let options = DownloadFromContainerOptions { path };
            let mut chunks = docker.download_from_container(&container, Some(options));
            while let Some(chunk) = chunks.next().await {
                yield chunk.map_err(HostError::from)?;
            }
        })
    }

    async fn remove_container(&self, name: &str) -> Result<(), HostError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(name, Some(options)).await?;
        Ok(())
    }

    async fn list_containers(&self, query: &ContainerQuery) -> Result<Vec<String>, HostError> {
        let mut filters = HashMap::from([("label".to_string(), vec![query.label.clone()])]);
        if query.running_only {
            filters.insert("status".to_string(), vec!["running".to_string()]);
        }
        let options = ListContainersOptions {
            all: !query.running_only,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .or(c.id)
            })
            .collect())
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), HostError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            // already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn prune_containers(&self, label: &str) -> Result<(), HostError> {
        let options = PruneContainersOptions {
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
        };
        self.docker.prune_containers(Some(options)).await?;
        Ok(())
    }

    async fn prune_volumes(&self, label: &str) -> Result<(), HostError> {
        let options = PruneVolumesOptions {
            filters: HashMap::from([
                ("label".to_string(), vec![label.to_string()]),
                ("all".to_string(), vec!["true".to_string()]),
            ]),
        };
        self.docker.prune_volumes(Some(options)).await?;
        Ok(())
    }

    async fn network_gateway(&self, network: &str) -> Result<Option<String>, HostError> {
        let network = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(network
            .ipam
            .and_then(|ipam| ipam.config)
            .and_then(|configs| configs.into_iter().find_map(|config| config.gateway)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reference_defaults_tag() {
        assert_eq!(split_reference("alpine"), ("alpine", "latest"));
        assert_eq!(split_reference("alpine:3.16"), ("alpine", "3.16"));
        assert_eq!(
            split_reference("registry:5000/team/io"),
            ("registry:5000/team/io", "latest")
        );
        assert_eq!(
            split_reference("registry:5000/team/io:v2"),
            ("registry:5000/team/io", "v2")
        );
        assert_eq!(
            split_reference("alpine@sha256:abcd"),
            ("alpine@sha256:abcd", "")
        );
    }

    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining == 0 {
                return Err(std::io::Error::other("disk went away"));
            }
            let n = self.remaining.min(buf.len());
            buf[..n].fill(7);
            self.remaining -= n;
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_chunked_streams_whole_archive() {
        let content = vec![1u8; UPLOAD_CHUNK + 10];
        let failure = ReadFailure::default();

        let chunks: Vec<Bytes> = chunked(std::io::Cursor::new(content), failure.clone())
            .collect()
            .await;

        assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), UPLOAD_CHUNK + 10);
        assert!(failure.check().is_ok());
    }

    #[tokio::test]
    async fn test_chunked_read_error_is_reported() {
        let failure = ReadFailure::default();

        let chunks: Vec<Bytes> = chunked(FailingReader { remaining: 16 }, failure.clone())
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        let error = failure.check().unwrap_err();
        assert!(matches!(error, HostError::Transport { .. }));
        assert!(error.to_string().contains("disk went away"));
        assert!(failure.check().is_ok());
    }

    #[test]
    fn test_server_errors_map_by_status() {
        let missing = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let busy = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "a prune operation is already running".to_string(),
        };

        assert!(HostError::from(missing).is_not_found());
        assert!(HostError::from(busy).is_retryable());
    }
}
