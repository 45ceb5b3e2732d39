pub mod cleanup;
pub mod run;
pub mod service;

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use components::store::{FsBlobStore, FsJobStore};
use components::{DockerHost, InMemoryHost, RuntimeHost};
use config_loader::{ComponentsSettings, SettingsLoader};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Runtime {
    /// The Docker Engine configured in the settings
    Docker,
    /// An in-memory host; containers run nothing
    Memory,
}

/// Everything a command needs that does not come from its own arguments.
pub struct Context {
    pub settings: Arc<ComponentsSettings>,
    pub host: Arc<dyn RuntimeHost>,
    pub store: PathBuf,
}

impl Context {
    pub fn load(runtime: Runtime, store: PathBuf) -> Result<Self> {
        let settings = SettingsLoader::new()
            .load()
            .context("Failed to load components settings")?;
        let host: Arc<dyn RuntimeHost> = match runtime {
            Runtime::Docker => Arc::new(
                DockerHost::connect(&settings.docker).context("Failed to connect to Docker")?,
            ),
            Runtime::Memory => Arc::new(InMemoryHost::new()),
        };
        tracing::debug!(?runtime, store = %store.display(), "Loaded context");
        Ok(Self {
            settings: Arc::new(settings),
            host,
            store,
        })
    }

    pub fn blobs(&self) -> Arc<FsBlobStore> {
        Arc::new(FsBlobStore::new(&self.store))
    }

    pub fn jobs(&self) -> Arc<FsJobStore> {
        Arc::new(FsJobStore::new(&self.store))
    }
}
