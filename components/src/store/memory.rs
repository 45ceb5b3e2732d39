use super::{BlobKey, BlobReader, BlobStore, JobStore, OutputTransaction, StoreError};
use crate::interface::ComponentInterface;
use crate::job::JobRef;
use crate::values::{
    CivValue, ComponentInterfaceValue, ImageEntity, NewFile, NewValue, StoredFile,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory blob store backed by a `HashMap<key, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobKey, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, content: impl Into<Bytes>) -> BlobKey {
        let key = BlobKey::new(key);
        lock(&self.blobs).insert(key.clone(), content.into());
        key
    }

    pub fn get(&self, key: &BlobKey) -> Option<Bytes> {
        lock(&self.blobs).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open(&self, key: &BlobKey) -> Result<BlobReader, StoreError> {
        let content = self.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok(Box::new(Cursor::new(content)))
    }

    async fn put(&self, key: &BlobKey, content: Bytes) -> Result<(), StoreError> {
        lock(&self.blobs).insert(key.clone(), content);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Committed {
    outputs: HashMap<String, Vec<ComponentInterfaceValue>>,
    rollbacks: usize,
}

/// In-memory job store. Committed files land in the shared blob store.
#[derive(Debug, Clone)]
pub struct MemoryJobStore {
    committed: Arc<Mutex<Committed>>,
    blobs: Arc<MemoryBlobStore>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::with_blobs(Arc::new(MemoryBlobStore::new()))
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blobs(blobs: Arc<MemoryBlobStore>) -> Self {
        Self {
            committed: Arc::default(),
            blobs,
        }
    }

    pub fn blobs(&self) -> &Arc<MemoryBlobStore> {
        &self.blobs
    }

    /// Committed outputs of a job, empty if nothing was committed.
    pub fn outputs(&self, job: &JobRef) -> Vec<ComponentInterfaceValue> {
        lock(&self.committed)
            .outputs
            .get(&job.label())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of transactions dropped without commit.
    pub fn rollbacks(&self) -> usize {
        lock(&self.committed).rollbacks
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn begin_outputs(&self, job: &JobRef) -> Result<Box<dyn OutputTransaction>, StoreError> {
        Ok(Box::new(MemoryOutputTransaction {
            label: job.label(),
            store: self.clone(),
            values: Vec::new(),
            files: Vec::new(),
            finished: false,
        }))
    }
}

struct MemoryOutputTransaction {
    label: String,
    store: MemoryJobStore,
    values: Vec<ComponentInterfaceValue>,
    files: Vec<(BlobKey, Bytes)>,
    finished: bool,
}

impl MemoryOutputTransaction {
    fn stage_file(&mut self, id: Uuid, file: NewFile) -> StoredFile {
        let blob = BlobKey::new(format!("{}/{}/{}", self.label, id, file.name));
        self.files.push((blob.clone(), file.content));
        StoredFile {
            name: file.name,
            blob,
        }
    }
}

#[async_trait]
impl OutputTransaction for MemoryOutputTransaction {
    async fn create_value(
        &mut self,
        interface: &ComponentInterface,
        value: NewValue,
    ) -> Result<ComponentInterfaceValue, StoreError> {
        let id = Uuid::new_v4();
        let value = match value {
            NewValue::Json(json) => CivValue::Json(json),
            NewValue::File(file) => CivValue::File(self.stage_file(id, file)),
            NewValue::Image(image) => {
                let files = image
                    .files
                    .into_iter()
                    .map(|file| self.stage_file(id, file))
                    .collect();
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
        let mut committed = lock(&self.store.committed);
        for (key, content) in self.files.drain(..) {
            lock(&self.store.blobs.blobs).insert(key, content);
        }
        let values = std::mem::take(&mut self.values);
        committed.outputs.insert(self.label.clone(), values.clone());
        drop(committed);
        self.finished = true;
        Ok(values)
    }
}

impl Drop for MemoryOutputTransaction {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.store.committed).rollbacks += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InterfaceKind;
    use crate::job::JobClass;
    use serde_json::json;

    fn job() -> JobRef {
        JobRef::new(JobClass::algorithm_job(), "42").unwrap()
    }

    #[tokio::test]
    async fn test_uncommitted_values_are_invisible() {
        let store = MemoryJobStore::new();
        let interface =
            ComponentInterface::new("score", "Score", InterfaceKind::Float, "score.json").unwrap();

        let mut transaction = store.begin_outputs(&job()).await.unwrap();
        transaction
            .create_value(&interface, NewValue::Json(json!(0.5)))
            .await
            .unwrap();
        drop(transaction);

        assert!(store.outputs(&job()).is_empty());
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_commit_publishes_files() {
        let store = MemoryJobStore::new();
        let interface =
            ComponentInterface::new("report", "Report", InterfaceKind::Pdf, "report.pdf").unwrap();

        let mut transaction = store.begin_outputs(&job()).await.unwrap();
        let civ = transaction
            .create_value(
                &interface,
                NewValue::File(NewFile {
                    name: "report.pdf".to_string(),
                    content: Bytes::from_static(b"%PDF-1.4"),
                }),
            )
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        let CivValue::File(file) = &civ.value else {
            panic!("expected a stored file");
        };
        assert_eq!(store.blobs().get(&file.blob).unwrap(), Bytes::from_static(b"%PDF-1.4"));
        assert_eq!(store.outputs(&job()), vec![civ]);
        assert_eq!(store.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_rerun_replaces_committed_outputs() {
        let store = MemoryJobStore::new();
        let interface =
            ComponentInterface::new("score", "Score", InterfaceKind::Float, "score.json").unwrap();

        let mut first = store.begin_outputs(&job()).await.unwrap();
        first
            .create_value(&interface, NewValue::Json(json!(0.5)))
            .await
            .unwrap();
        first.commit().await.unwrap();

        let mut second = store.begin_outputs(&job()).await.unwrap();
        let civ = second
            .create_value(&interface, NewValue::Json(json!(0.75)))
            .await
            .unwrap();
        second.commit().await.unwrap();

        assert_eq!(store.outputs(&job()), vec![civ]);
    }
}
