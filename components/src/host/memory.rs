//! A [`RuntimeHost`] that keeps images, volumes and containers in memory.
//!
//! Containers do not execute anything. An image can instead be bound to a
//! [`Program`], a closure that sees the container's mounted files and may
//! write files, print log lines and pick an exit code. Helper containers
//! started with a tty and no command stay running until removed; `chmod`
//! commands update file modes in the mounted volumes.

use super::{ContainerQuery, ContainerSpec, HostError, Labels, LogOptions, RuntimeHost};
use crate::archive::TarSpool;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::SpooledTempFile;
use tracing::debug;

pub type Program = Arc<dyn Fn(&mut ProgramContext) -> i64 + Send + Sync>;

const ARCHIVE_CHUNK: usize = 64 * 1024;
const STOPPED_EXIT_CODE: i64 = 143;

/// What a [`Program`] sees while it "runs".
pub struct ProgramContext {
    files: BTreeMap<String, Vec<u8>>,
    writable: Vec<String>,
    written: BTreeMap<String, Vec<u8>>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    environment: BTreeMap<String, String>,
    memory_limit_bytes: i64,
    network_enabled: bool,
}

impl ProgramContext {
    /// Contents of a file at an absolute container path.
    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.written
            .get(path)
            .or_else(|| self.files.get(path))
            .map(Vec::as_slice)
    }

    /// Absolute paths of all files below `dir`.
    pub fn files_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .keys()
            .chain(self.written.keys())
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Writes a file; returns `false` if no writable volume is mounted there.
    pub fn write(&mut self, path: &str, content: impl Into<Vec<u8>>) -> bool {
        let allowed = self
            .writable
            .iter()
            .any(|target| path.starts_with(&format!("{}/", target.trim_end_matches('/'))));
        if allowed {
            self.written.insert(path.to_string(), content.into());
        }
        allowed
    }

    pub fn println(&mut self, line: impl Into<String>) {
        self.stdout.push(line.into());
    }

    pub fn eprintln(&mut self, line: impl Into<String>) {
        self.stderr.push(line.into());
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        self.memory_limit_bytes
    }

    pub fn network_enabled(&self) -> bool {
        self.network_enabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i64),
}

#[derive(Debug, Clone)]
enum Entry {
    Dir { mode: u32 },
    File { content: Vec<u8>, mode: u32 },
}

#[derive(Debug, Default)]
struct Volume {
    labels: Labels,
    entries: BTreeMap<String, Entry>,
}

impl Volume {
    fn insert_file(&mut self, path: &str, content: Vec<u8>) {
        for dir in crate::paths::parent_dirs(path) {
            self.entries
                .entry(dir.trim_end_matches('/').to_string())
                .or_insert(Entry::Dir { mode: 0o755 });
        }
        self.entries
            .insert(path.to_string(), Entry::File { content, mode: 0o644 });
    }

    fn insert_dir(&mut self, path: &str) {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return;
        }
        for dir in crate::paths::parent_dirs(path) {
            self.entries
                .entry(dir.trim_end_matches('/').to_string())
                .or_insert(Entry::Dir { mode: 0o755 });
        }
        self.entries
            .entry(path.to_string())
            .or_insert(Entry::Dir { mode: 0o755 });
    }

    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{}/", path);
        matches!(self.entries.get(path), Some(Entry::Dir { .. }))
            || self.entries.keys().any(|k| k.starts_with(&prefix))
    }

    fn under<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        self.entries
            .iter()
            .filter(move |(k, _)| k.starts_with(&prefix))
    }
}

struct Container {
    spec: ContainerSpec,
    state: ContainerState,
    stdout: Vec<(DateTime<Utc>, String)>,
    stderr: Vec<(DateTime<Utc>, String)>,
}

#[derive(Default)]
struct State {
    images: BTreeSet<String>,
    unavailable: BTreeSet<String>,
    programs: HashMap<String, Program>,
    volumes: BTreeMap<String, Volume>,
    containers: BTreeMap<String, Container>,
    networks: BTreeMap<String, Option<String>>,
    pending_prune_failures: u32,
    pending_log_failures: u32,
    prune_attempts: u32,
    image_loads: u32,
    pulls: Vec<String>,
    history: Vec<ContainerSpec>,
}

impl State {
    /// Maps an absolute container path to `(volume, path in volume, read_only)`.
    fn resolve(&self, container: &str, path: &str) -> Result<(String, String, bool), HostError> {
        let container = self
            .containers
            .get(container)
            .ok_or_else(|| not_found(format!("No such container: {}", container)))?;
        resolve_mount(&container.spec, path)
            .ok_or_else(|| not_found(format!("Could not find the file {} in container", path)))
    }
}

fn resolve_mount(spec: &ContainerSpec, path: &str) -> Option<(String, String, bool)> {
    let path = normalize(path)?;
    spec.mounts
        .iter()
        .filter_map(|mount| {
            let target = normalize(&mount.target)?;
            let rest = if path == target {
                ""
            } else {
                path.strip_prefix(&format!("{}/", target))?
            };
            Some((target.len(), mount, rest.to_string()))
        })
        .max_by_key(|(len, _, _)| *len)
        .map(|(_, mount, rest)| (mount.volume.clone(), rest, mount.read_only))
}

/// Absolute path without a trailing slash and with `.`/`..` resolved.
fn normalize(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(format!("/{}", parts.join("/")))
}

fn not_found(message: String) -> HostError {
    HostError::NotFound { message }
}

fn label_matches(labels: &Labels, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(filter),
    }
}

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
}

/// Image ids and tags declared by a `docker save` archive.
fn saved_image_references<R: Read>(archive: R) -> Result<Vec<String>, HostError> {
    let invalid = |message: String| HostError::Api {
        status: 500,
        message,
    };
    let mut archive = tar::Archive::new(archive);
    let entries = archive.entries().map_err(|e| invalid(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
        let is_manifest = entry
            .path()
            .map(|p| p.to_string_lossy() == "manifest.json")
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| invalid(e.to_string()))?;
        let manifest: Vec<ManifestEntry> =
            serde_json::from_slice(&content).map_err(|e| invalid(e.to_string()))?;
        let mut references = Vec::new();
        for image in manifest {
            let hex = image
                .config
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .trim_end_matches(".json")
                .to_string();
            references.push(format!("sha256:{}", hex));
            references.extend(image.repo_tags.unwrap_or_default());
        }
        return Ok(references);
    }
    Err(invalid("archive does not contain manifest.json".to_string()))
}

/// In-memory [`RuntimeHost`] for tests and dry runs.
#[derive(Default)]
pub struct InMemoryHost {
    state: Mutex<State>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_image(&self, reference: impl Into<String>) {
        self.state().images.insert(reference.into());
    }

    /// Pulls of `reference` fail as if the registry did not know it.
    pub fn make_unavailable(&self, reference: impl Into<String>) {
        self.state().unavailable.insert(reference.into());
    }

    pub fn register_program<F>(&self, image: impl Into<String>, program: F)
    where
        F: Fn(&mut ProgramContext) -> i64 + Send + Sync + 'static,
    {
        self.state().programs.insert(image.into(), Arc::new(program));
    }

    pub fn add_network(&self, name: impl Into<String>, gateway: Option<&str>) {
        self.state()
            .networks
            .insert(name.into(), gateway.map(str::to_string));
    }

    /// The next `count` prune calls fail with a conflict.
    pub fn fail_next_prunes(&self, count: u32) {
        self.state().pending_prune_failures = count;
    }

    /// The next `count` log reads fail with a server error.
    pub fn fail_next_log_reads(&self, count: u32) {
        self.state().pending_log_failures = count;
    }

    pub fn prune_attempts(&self) -> u32 {
        self.state().prune_attempts
    }

    pub fn image_loads(&self) -> u32 {
        self.state().image_loads
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state().images.contains(reference)
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    /// Every container spec ever run, in order.
    pub fn history(&self) -> Vec<ContainerSpec> {
        self.state().history.clone()
    }

    pub fn containers(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    pub fn container_state(&self, name: &str) -> Option<ContainerState> {
        self.state().containers.get(name).map(|c| c.state)
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    pub fn volume_labels(&self, volume: &str) -> Option<Labels> {
        self.state().volumes.get(volume).map(|v| v.labels.clone())
    }

    /// File content at a path relative to the volume root.
    pub fn volume_file(&self, volume: &str, path: &str) -> Option<Vec<u8>> {
        match self.state().volumes.get(volume)?.entries.get(path)? {
            Entry::File { content, .. } => Some(content.clone()),
            Entry::Dir { .. } => None,
        }
    }

    pub fn volume_paths(&self, volume: &str) -> Vec<String> {
        self.state()
            .volumes
            .get(volume)
            .map(|v| v.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn volume_mode(&self, volume: &str, path: &str) -> Option<u32> {
        match self.state().volumes.get(volume)?.entries.get(path)? {
            Entry::File { mode, .. } | Entry::Dir { mode } => Some(*mode),
        }
    }

    pub fn write_volume_file(&self, volume: &str, path: &str, content: impl Into<Vec<u8>>) {
        self.state()
            .volumes
            .entry(volume.to_string())
            .or_default()
            .insert_file(path, content.into());
    }

    fn run_program(&self, program: Program, spec: &ContainerSpec) -> (i64, ProgramContext) {
        let mut context = {
            let state = self.state();
            let mut files = BTreeMap::new();
            for mount in &spec.mounts {
                let Some(volume) = state.volumes.get(&mount.volume) else {
                    continue;
                };
                let target = mount.target.trim_end_matches('/');
                for (path, entry) in &volume.entries {
                    if let Entry::File { content, .. } = entry {
                        files.insert(format!("{}/{}", target, path), content.clone());
                    }
                }
            }
            ProgramContext {
                files,
                writable: spec
                    .mounts
                    .iter()
                    .filter(|m| !m.read_only)
                    .map(|m| m.target.clone())
                    .collect(),
                written: BTreeMap::new(),
                stdout: Vec::new(),
                stderr: Vec::new(),
                environment: spec.environment.clone(),
                memory_limit_bytes: spec.run_config.memory_bytes(),
                network_enabled: spec.run_config.network != super::NetworkPolicy::Disabled,
            }
        };
        let exit_code = program(&mut context);
        (exit_code, context)
    }

    fn chmod(state: &mut State, spec: &ContainerSpec, mode: u32, targets: &[String]) {
        for target in targets {
            let Some((volume, path, _)) = resolve_mount(spec, target) else {
                continue;
            };
            let Some(volume) = state.volumes.get_mut(&volume) else {
                continue;
            };
            let prefix = if path.is_empty() {
                String::new()
            } else {
                format!("{}/", path)
            };
            for (key, entry) in volume.entries.iter_mut() {
                if key == &path || key.starts_with(&prefix) {
                    match entry {
                        Entry::Dir { mode: m } | Entry::File { mode: m, .. } => *m = mode,
                    }
                }
            }
        }
    }
}

fn parse_chmod(command: &[String]) -> Option<(u32, Vec<String>)> {
    let mut args = command.iter();
    if args.next()? != "chmod" {
        return None;
    }
    let mut mode = None;
    let mut targets = Vec::new();
    for arg in args {
        if arg.starts_with('-') {
            continue;
        }
        if mode.is_none() {
            mode = Some(u32::from_str_radix(arg, 8).ok()?);
        } else {
            targets.push(arg.clone());
        }
    }
    Some((mode?, targets))
}

#[async_trait]
impl RuntimeHost for InMemoryHost {
    async fn image_exists(&self, reference: &str) -> Result<bool, HostError> {
        Ok(self.state().images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), HostError> {
        let mut state = self.state();
        if state.unavailable.contains(reference) {
            return Err(not_found(format!("manifest for {} not found", reference)));
        }
        state.pulls.push(reference.to_string());
        state.images.insert(reference.to_string());
        Ok(())
    }

    async fn load_image(
        &self,
        archive: SpooledTempFile,
        _timeout: Duration,
    ) -> Result<(), HostError> {
        let references = saved_image_references(archive)?;
        let mut state = self.state();
        state.image_loads += 1;
        debug!(?references, "Loaded image archive");
        state.images.extend(references);
        Ok(())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<(), HostError> {
        let mut state = self.state();
        let volume = state.volumes.entry(name.to_string()).or_default();
        volume.labels = labels.clone();
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<(), HostError> {
        let program = {
            let mut state = self.state();
            if state.containers.contains_key(&spec.name) {
                return Err(HostError::Api {
                    status: 409,
                    message: format!("Conflict. The container name {} is already in use", spec.name),
                });
            }
            if !state.images.contains(&spec.image) {
                return Err(not_found(format!("No such image: {}", spec.image)));
            }
            for mount in &spec.mounts {
                state.volumes.entry(mount.volume.clone()).or_default();
            }
            state.history.push(spec.clone());
            match &spec.command {
                None => state.programs.get(&spec.image).cloned(),
                Some(_) => None,
            }
        };

        let mut container = Container {
            spec: spec.clone(),
            state: ContainerState::Running,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };

        if let Some(program) = program {
            let (exit_code, context) = self.run_program(program, spec);
            let now = Utc::now();
            container.state = ContainerState::Exited(exit_code);
            container.stdout = context.stdout.into_iter().map(|l| (now, l)).collect();
            container.stderr = context.stderr.into_iter().map(|l| (now, l)).collect();
            let mut state = self.state();
            for (path, content) in context.written {
                if let Some((volume, inner, false)) = resolve_mount(spec, &path) {
                    state
                        .volumes
                        .entry(volume)
                        .or_default()
                        .insert_file(&inner, content);
                }
            }
        } else if let Some(command) = &spec.command {
            if let Some((mode, targets)) = parse_chmod(command) {
                Self::chmod(&mut self.state(), spec, mode, &targets);
            }
            container.state = ContainerState::Exited(0);
        }

        let mut state = self.state();
        let finished = matches!(container.state, ContainerState::Exited(_));
        if !(finished && spec.auto_remove) {
            state.containers.insert(spec.name.clone(), container);
        }
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64, HostError> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found(format!("No such container: {}", name)))?;
        match container.state {
            ContainerState::Exited(code) => Ok(code),
            ContainerState::Running => {
                container.state = ContainerState::Exited(0);
                Ok(0)
            }
        }
    }

    async fn container_logs(&self, name: &str, options: LogOptions) -> Result<String, HostError> {
        let mut state = self.state();
        if state.pending_log_failures > 0 {
            state.pending_log_failures -= 1;
            return Err(HostError::Api {
                status: 500,
                message: "error from daemon in stream: log file is being rotated".to_string(),
            });
        }
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| not_found(format!("No such container: {}", name)))?;
        let mut lines: Vec<&(DateTime<Utc>, String)> = Vec::new();
        if options.stdout {
            lines.extend(container.stdout.iter());
        }
        if options.stderr {
            lines.extend(container.stderr.iter());
        }
        lines.sort_by_key(|(at, _)| *at);
        let skip = lines.len().saturating_sub(options.tail);
        let mut logs = String::new();
        for (at, line) in lines.into_iter().skip(skip) {
            if options.timestamps {
                logs.push_str(&at.to_rfc3339_opts(SecondsFormat::Nanos, true));
                logs.push(' ');
            }
            logs.push_str(line);
            logs.push('\n');
        }
        Ok(logs)
    }

    async fn put_archive(
        &self,
        container: &str,
        dir: &str,
        archive: SpooledTempFile,
    ) -> Result<(), HostError> {
        let invalid = |message: String| HostError::Api {
            status: 400,
            message,
        };
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut reader = tar::Archive::new(archive);
        for entry in reader.entries().map_err(|e| invalid(e.to_string()))? {
            let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| invalid(e.to_string()))?
                .to_string_lossy()
                .to_string();
            match entry.header().entry_type() {
                tar::EntryType::Directory => dirs.push(path),
                tar::EntryType::Regular => {
                    let mut content = Vec::new();
                    entry
                        .read_to_end(&mut content)
                        .map_err(|e| invalid(e.to_string()))?;
                    files.push((path, content));
                }
                _ => {}
            }
        }

        let mut state = self.state();
        let (volume, base, read_only) = state.resolve(container, dir)?;
        if read_only {
            return Err(HostError::Api {
                status: 403,
                message: format!("{} is mounted read-only", dir),
            });
        }
        let join = |path: &str| -> Result<String, HostError> {
            let joined = normalize(&format!("/{}/{}", base, path))
                .ok_or_else(|| invalid(format!("archive entry {} escapes {}", path, dir)))?;
            Ok(joined.trim_start_matches('/').to_string())
        };
        let volume = state.volumes.entry(volume).or_default();
        for path in dirs {
            volume.insert_dir(&join(&path)?);
        }
        for (path, content) in files {
            volume.insert_file(&join(&path)?, content);
        }
        Ok(())
    }

    fn get_archive(&self, container: &str, path: &str) -> BoxStream<'static, Result<Bytes, HostError>> {
        let built = (|| -> Result<Vec<u8>, HostError> {
            let state = self.state();
            let (volume_name, inner, _) = state.resolve(container, path)?;
            let missing = || not_found(format!("Could not find the file {} in container", path));
            let volume = state.volumes.get(&volume_name).ok_or_else(missing)?;
            let io_error = |e: std::io::Error| HostError::Transport {
                message: e.to_string(),
            };

            let top = crate::paths::file_name(path).to_string();
            let mut tar = TarSpool::new();
            match volume.entries.get(&inner) {
                Some(Entry::File { content, .. }) => {
                    tar.append_bytes(&top, content).map_err(io_error)?;
                }
                _ if volume.is_dir(&inner) => {
                    tar.append_dir(&top).map_err(io_error)?;
                    let strip = if inner.is_empty() { 0 } else { inner.len() + 1 };
                    for (key, entry) in volume.under(&inner) {
                        let relative = format!("{}/{}", top, &key[strip..]);
                        match entry {
                            Entry::Dir { .. } => tar.append_dir(&relative).map_err(io_error)?,
                            Entry::File { content, .. } => {
                                tar.append_bytes(&relative, content).map_err(io_error)?
                            }
                        }
                    }
                }
                _ => return Err(missing()),
            }
            let mut spool = tar.finish().map_err(io_error)?;
            let mut bytes = Vec::new();
            spool.read_to_end(&mut bytes).map_err(io_error)?;
            Ok(bytes)
        })();

        match built {
            Ok(bytes) => {
                let chunks: Vec<Result<Bytes, HostError>> = bytes
                    .chunks(ARCHIVE_CHUNK)
                    .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                    .collect();
                stream::iter(chunks).boxed()
            }
            Err(error) => stream::once(async move { Err(error) }).boxed(),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), HostError> {
        self.state()
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("No such container: {}", name)))
    }

    async fn list_containers(&self, query: &ContainerQuery) -> Result<Vec<String>, HostError> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| label_matches(&c.spec.labels, &query.label))
            .filter(|(_, c)| !query.running_only || c.state == ContainerState::Running)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<(), HostError> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| not_found(format!("No such container: {}", name)))?;
        if container.state == ContainerState::Running {
            container.state = ContainerState::Exited(STOPPED_EXIT_CODE);
        }
        if container.spec.auto_remove {
            state.containers.remove(name);
        }
        Ok(())
    }

    async fn prune_containers(&self, label: &str) -> Result<(), HostError> {
        let mut state = self.state();
        state.prune_attempts += 1;
        if state.pending_prune_failures > 0 {
            state.pending_prune_failures -= 1;
            return Err(HostError::Api {
                status: 409,
                message: "a prune operation is already running".to_string(),
            });
        }
        state.containers.retain(|_, c| {
            c.state == ContainerState::Running || !label_matches(&c.spec.labels, label)
        });
        Ok(())
    }

    async fn prune_volumes(&self, label: &str) -> Result<(), HostError> {
        let mut state = self.state();
        state.prune_attempts += 1;
        if state.pending_prune_failures > 0 {
            state.pending_prune_failures -= 1;
            return Err(HostError::Api {
                status: 409,
                message: "a prune operation is already running".to_string(),
            });
        }
        let in_use: BTreeSet<String> = state
            .containers
            .values()
            .flat_map(|c| c.spec.mounts.iter().map(|m| m.volume.clone()))
            .collect();
        state
            .volumes
            .retain(|name, v| in_use.contains(name) || !label_matches(&v.labels, label));
        Ok(())
    }

    async fn network_gateway(&self, network: &str) -> Result<Option<String>, HostError> {
        self.state()
            .networks
            .get(network)
            .cloned()
            .ok_or_else(|| not_found(format!("network {} not found", network)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{NetworkPolicy, RunConfig, VolumeMount};

    fn run_config() -> RunConfig {
        RunConfig {
            init: true,
            network: NetworkPolicy::Disabled,
            memory_limit_gb: 1,
            cpu_period: 100_000,
            cpu_quota: 100_000,
            cpu_shares: 1024,
            cpuset_cpus: "0".to_string(),
            runtime: None,
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges".to_string()],
            pids_limit: 128,
            log_driver: "json-file".to_string(),
            log_max_size: "1g".to_string(),
        }
    }

    fn helper(name: &str) -> ContainerSpec {
        ContainerSpec::new(name, "alpine", Labels::new(), run_config())
            .mount(VolumeMount::read_write("vol", "/data/"))
            .tty()
    }

    #[tokio::test]
    async fn test_archive_round_trip_through_volume() {
        let host = InMemoryHost::new();
        host.add_image("alpine");
        host.run_container(&helper("writer")).await.unwrap();

        let mut tar = TarSpool::new();
        tar.append_bytes("nested/value.json", b"42").unwrap();
        host.put_archive("writer", "/data/", tar.finish().unwrap())
            .await
            .unwrap();

        assert_eq!(host.volume_file("vol", "nested/value.json"), Some(b"42".to_vec()));

        let archive = crate::archive::collect(
            host.get_archive("writer", "/data/nested/value.json"),
            1 << 20,
        )
        .await
        .unwrap();
        assert_eq!(
            crate::archive::read_file(archive, "value.json").unwrap(),
            Some(b"42".to_vec())
        );
    }

    #[tokio::test]
    async fn test_combined_logs_have_no_timestamps() {
        let host = InMemoryHost::new();
        host.add_image("app");
        host.register_program("app", |ctx| {
            ctx.println("ready");
            ctx.eprintln("warming up");
            0
        });
        host.run_container(&ContainerSpec::new("app-1", "app", Labels::new(), run_config()))
            .await
            .unwrap();

        let combined = host.container_logs("app-1", LogOptions::combined(10)).await.unwrap();
        assert_eq!(combined, "ready\nwarming up\n");

        let stdout = host.container_logs("app-1", LogOptions::stdout(10)).await.unwrap();
        assert!(stdout.ends_with(" ready\n"));
        assert!(DateTime::parse_from_rfc3339(stdout.split(' ').next().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found() {
        let host = InMemoryHost::new();
        host.add_image("alpine");
        host.run_container(&helper("reader")).await.unwrap();

        let result = crate::archive::collect(host.get_archive("reader", "/data/nope"), 1024).await;
        assert!(matches!(
            result,
            Err(crate::archive::FetchError::Host(HostError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_chmod_command_sets_modes() {
        let host = InMemoryHost::new();
        host.add_image("alpine");
        host.write_volume_file("vol", "a/b.txt", "x");

        let chmod = ContainerSpec::new("chmod", "alpine", Labels::new(), run_config())
            .mount(VolumeMount::read_write("vol", "/data/"))
            .command(["chmod", "-R", "0777", "/data/"]);
        host.run_container(&chmod).await.unwrap();

        assert_eq!(host.wait_container("chmod").await.unwrap(), 0);
        assert_eq!(host.volume_mode("vol", "a/b.txt"), Some(0o777));
        assert_eq!(host.volume_mode("vol", "a"), Some(0o777));
    }

    #[tokio::test]
    async fn test_load_image_reads_manifest() {
        let host = InMemoryHost::new();
        let mut tar = TarSpool::new();
        tar.append_bytes(
            "manifest.json",
            br#"[{"Config": "blobs/sha256/abc123", "RepoTags": ["algo:latest"], "Layers": []}]"#,
        )
        .unwrap();

        host.load_image(tar.finish().unwrap(), Duration::from_secs(600))
            .await
            .unwrap();

        assert!(host.has_image("sha256:abc123"));
        assert!(host.has_image("algo:latest"));
        assert_eq!(host.image_loads(), 1);
    }

    #[test]
    fn test_parse_chmod() {
        let command: Vec<String> = ["chmod", "-R", "0777", "/input/", "/output/"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            parse_chmod(&command),
            Some((0o777, vec!["/input/".to_string(), "/output/".to_string()]))
        );
    }
}
