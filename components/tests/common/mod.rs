#![allow(dead_code)]

use components::archive::TarSpool;
use components::host::{InMemoryHost, ProgramContext};
use components::interface::{ComponentInterface, InterfaceKind};
use components::store::{BlobKey, MemoryBlobStore, MemoryJobStore};
use components::{Connection, Executor, ImageReference, JobClass, JobRef};
use config_loader::ComponentsSettings;
use std::io::Read;
use std::sync::Arc;

pub const IMAGE_BLOB: &str = "images/algorithm.tar";
pub const IO_IMAGE: &str = "alpine:3.16";

pub fn digest_hex() -> String {
    "3b".repeat(32)
}

pub fn digest() -> String {
    format!("sha256:{}", digest_hex())
}

/// A minimal `docker save` archive whose config has the given hex id.
pub fn saved_image(config_hex: &str) -> Vec<u8> {
    let manifest = format!(
        r#"[{{"Config": "blobs/sha256/{}", "RepoTags": null, "Layers": []}}]"#,
        config_hex
    );
    let mut tar = TarSpool::new();
    tar.append_bytes("manifest.json", manifest.as_bytes()).unwrap();
    let mut spool = tar.finish().unwrap();
    let mut bytes = Vec::new();
    spool.read_to_end(&mut bytes).unwrap();
    bytes
}

pub fn interface(slug: &str, kind: InterfaceKind, path: &str) -> ComponentInterface {
    ComponentInterface::new(slug, slug, kind, path).unwrap()
}

pub struct Harness {
    pub host: Arc<InMemoryHost>,
    pub blobs: Arc<MemoryBlobStore>,
    pub jobs: Arc<MemoryJobStore>,
    pub settings: ComponentsSettings,
    pub job: JobRef,
}

impl Harness {
    pub fn new(id: &str) -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert(IMAGE_BLOB, saved_image(&digest_hex()));
        let jobs = Arc::new(MemoryJobStore::with_blobs(Arc::clone(&blobs)));
        Self {
            host: Arc::new(InMemoryHost::new()),
            blobs,
            jobs,
            settings: ComponentsSettings {
                memory_limit: 4,
                cpuset_cpus: Some("0".to_string()),
                ..ComponentsSettings::default()
            },
            job: JobRef::new(JobClass::algorithm_job(), id).unwrap(),
        }
    }

    pub fn label(&self) -> String {
        self.job.label()
    }

    pub fn program<F>(&self, program: F)
    where
        F: Fn(&mut ProgramContext) -> i64 + Send + Sync + 'static,
    {
        self.host.register_program(digest(), program);
    }

    pub fn connection(&self, memory_limit_gb: u64) -> Connection {
        let image = ImageReference::new(digest(), BlobKey::new(IMAGE_BLOB)).unwrap();
        Connection::new(
            self.host.clone(),
            Arc::new(self.settings.clone()),
            self.job.clone(),
            image,
            memory_limit_gb,
        )
    }

    pub fn executor(&self, memory_limit_gb: u64) -> Executor {
        Executor::new(
            self.connection(memory_limit_gb),
            self.blobs.clone(),
            self.jobs.clone(),
        )
    }
}
