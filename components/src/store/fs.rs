use super::{BlobKey, BlobReader, BlobStore, JobStore, OutputTransaction, StoreError};
use crate::interface::ComponentInterface;
use crate::job::JobRef;
use crate::values::{
    CivValue, ComponentInterfaceValue, ImageEntity, NewFile, NewValue, StoredFile,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const OUTPUTS_DIR: &str = "outputs";
const OUTPUTS_FILE: &str = "outputs.json";

/// Blobs stored as files below a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &BlobKey) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(key.to_relative_path()?))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open(&self, key: &BlobKey) -> Result<BlobReader, StoreError> {
        let path = self.path_of(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &BlobKey, content: Bytes) -> Result<(), StoreError> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &content).await?;
        Ok(())
    }
}

/// Job outputs stored as `{root}/{label}/outputs/` with an `outputs.json`
/// listing every value. Files are keyed relative to `root`, so an
/// [`FsBlobStore`] on the same root can read them back.
#[derive(Debug, Clone)]
pub struct FsJobStore {
    root: PathBuf,
}

impl FsJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn outputs_dir(&self, job: &JobRef) -> PathBuf {
        self.root.join(job.label()).join(OUTPUTS_DIR)
    }

    /// Committed outputs of a job, empty if nothing was committed.
    pub async fn outputs(&self, job: &JobRef) -> Result<Vec<ComponentInterfaceValue>, StoreError> {
        let path = self.outputs_dir(job).join(OUTPUTS_FILE);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn begin_outputs(&self, job: &JobRef) -> Result<Box<dyn OutputTransaction>, StoreError> {
        let label = job.label();
        let staging = self
            .root
            .join(&label)
            .join(format!(".staging-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;
        debug!(job = %label, staging = %staging.display(), "Began output transaction");
        Ok(Box::new(FsOutputTransaction {
            label,
            staging,
            target: self.outputs_dir(job),
            values: Vec::new(),
            committed: false,
        }))
    }
}

struct FsOutputTransaction {
    label: String,
    staging: PathBuf,
    target: PathBuf,
    values: Vec<ComponentInterfaceValue>,
    committed: bool,
}

impl FsOutputTransaction {
    async fn stage_file(&self, id: Uuid, file: NewFile) -> Result<StoredFile, StoreError> {
        let relative = BlobKey::new(format!("{}/{}", id, file.name)).to_relative_path()?;
        let path = self.staging.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &file.content).await?;
        let blob = BlobKey::new(format!("{}/{}/{}/{}", self.label, OUTPUTS_DIR, id, file.name));
        Ok(StoredFile {
            name: file.name,
            blob,
        })
    }
}

#[async_trait]
impl OutputTransaction for FsOutputTransaction {
    async fn create_value(
        &mut self,
        interface: &ComponentInterface,
        value: NewValue,
    ) -> Result<ComponentInterfaceValue, StoreError> {
        let id = Uuid::new_v4();
        let value = match value {
            NewValue::Json(json) => CivValue::Json(json),
            NewValue::File(file) => CivValue::File(self.stage_file(id, file).await?),
            NewValue::Image(image) => {
                let mut files = Vec::with_capacity(image.files.len());
                for file in image.files {
                    files.push(self.stage_file(id, file).await?);
                }
                CivValue::Image(ImageEntity {
                    id: Uuid::new_v4(),
                    name: image.name,
                    element_type: image.element_type,
                    dimensions: image.dimensions,
                    files,
                })
            }
        };
        let civ = ComponentInterfaceValue {
            id,
            interface: interface.clone(),
            value,
            decompress: false,
        };
        self.values.push(civ.clone());
        Ok(civ)
    }

    async fn commit(mut self: Box<Self>) -> Result<Vec<ComponentInterfaceValue>, StoreError> {
        let manifest = serde_json::to_vec_pretty(&self.values)?;
        tokio::fs::write(self.staging.join(OUTPUTS_FILE), manifest).await?;

        // A rerun of the job replaces the outputs of the previous run.
        let superseded = self
            .target
            .with_file_name(format!(".superseded-{}", Uuid::new_v4()));
        let replaced = match tokio::fs::rename(&self.target, &superseded).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if let Err(error) = tokio::fs::rename(&self.staging, &self.target).await {
            if replaced {
                if let Err(restore) = tokio::fs::rename(&superseded, &self.target).await {
                    warn!(job = %self.label, error = %restore, "Failed to restore previous outputs");
                }
            }
            return Err(error.into());
        }
        self.committed = true;
        if replaced {
            if let Err(error) = tokio::fs::remove_dir_all(&superseded).await {
                warn!(job = %self.label, %error, "Failed to remove superseded outputs");
            }
        }
        debug!(job = %self.label, values = self.values.len(), replaced, "Committed outputs");
        Ok(std::mem::take(&mut self.values))
    }
}

impl Drop for FsOutputTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(error) = std::fs::remove_dir_all(&self.staging) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(staging = %self.staging.display(), %error, "Failed to discard staged outputs");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InterfaceKind;
    use crate::job::JobClass;
    use serde_json::json;
    use tempfile::TempDir;

    fn job() -> JobRef {
        JobRef::new(JobClass::evaluation(), "7").unwrap()
    }

    #[tokio::test]
    async fn test_commit_moves_staging_into_place() {
        let root = TempDir::new().unwrap();
        let store = FsJobStore::new(root.path());
        let metrics =
            ComponentInterface::new("metrics", "Metrics", InterfaceKind::AnyJson, "metrics.json")
                .unwrap();
        let table = ComponentInterface::new("table", "Table", InterfaceKind::Csv, "table.csv").unwrap();

        let mut transaction = store.begin_outputs(&job()).await.unwrap();
        transaction
            .create_value(&metrics, NewValue::Json(json!({"dice": 0.9})))
            .await
            .unwrap();
        let civ = transaction
            .create_value(
                &table,
                NewValue::File(NewFile {
                    name: "table.csv".to_string(),
                    content: Bytes::from_static(b"a,b\n1,2\n"),
                }),
            )
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        let outputs = store.outputs(&job()).await.unwrap();
        assert_eq!(outputs.len(), 2);

        let CivValue::File(file) = &civ.value else {
            panic!("expected a stored file");
        };
        let blobs = FsBlobStore::new(root.path());
        assert_eq!(blobs.read(&file.blob).await.unwrap(), b"a,b\n1,2\n");

        let leftovers: Vec<_> = std::fs::read_dir(root.path().join(job().label()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec![OUTPUTS_DIR.to_string()]);
    }

    #[tokio::test]
    async fn test_second_commit_replaces_previous_outputs() {
        let root = TempDir::new().unwrap();
        let store = FsJobStore::new(root.path());
        let flag = ComponentInterface::new("flag", "Flag", InterfaceKind::Bool, "flag.json").unwrap();

        for value in [true, false] {
            let mut transaction = store.begin_outputs(&job()).await.unwrap();
            transaction
                .create_value(&flag, NewValue::Json(json!(value)))
                .await
                .unwrap();
            transaction.commit().await.unwrap();
        }

        let outputs = store.outputs(&job()).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].value, CivValue::Json(json!(false)));
        let leftovers = std::fs::read_dir(root.path().join(job().label()))
            .unwrap()
            .count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_leaves_nothing() {
        let root = TempDir::new().unwrap();
        let store = FsJobStore::new(root.path());
        let flag = ComponentInterface::new("flag", "Flag", InterfaceKind::Bool, "flag.json").unwrap();

        let mut transaction = store.begin_outputs(&job()).await.unwrap();
        transaction
            .create_value(&flag, NewValue::Json(json!(true)))
            .await
            .unwrap();
        drop(transaction);

        assert!(store.outputs(&job()).await.unwrap().is_empty());
        let remaining = std::fs::read_dir(root.path().join(job().label()))
            .unwrap()
            .count();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_blob_store_reports_missing_keys() {
        let root = TempDir::new().unwrap();
        let blobs = FsBlobStore::new(root.path());

        assert!(matches!(
            blobs.open(&BlobKey::new("missing.tar")).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            blobs.open(&BlobKey::new("../outside")).await,
            Err(StoreError::InvalidKey { .. })
        ));
    }
}
