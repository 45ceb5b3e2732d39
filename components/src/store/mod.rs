//! Storage the engine consumes: a blob store for image archives and input
//! files, and a job store that records harvested outputs.
//!
//! Output values for one job are created inside a single
//! [`OutputTransaction`]. Nothing is visible until [`OutputTransaction::commit`]
//! succeeds; dropping the transaction discards everything it staged.

use crate::interface::ComponentInterface;
use crate::job::JobRef;
use crate::values::{ComponentInterfaceValue, NewValue};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

mod fs;
mod memory;

pub use fs::{FsBlobStore, FsJobStore};
pub use memory::{MemoryBlobStore, MemoryJobStore};

/// Key of a blob, a relative `/`-separated path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Self {
        BlobKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as a path below a store root, refusing absolute keys and
    /// any `..` component.
    pub fn to_relative_path(&self) -> Result<PathBuf, StoreError> {
        let path = Path::new(&self.0);
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                _ => return Err(StoreError::InvalidKey { key: self.0.clone() }),
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(StoreError::InvalidKey { key: self.0.clone() });
        }
        Ok(relative)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobKey {
    fn from(key: &str) -> Self {
        BlobKey::new(key)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("blob {key} not found")]
    NotFound { key: String },

    #[error("invalid blob key {key}")]
    InvalidKey { key: String },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Opens a blob for streaming reads. Missing blobs are
    /// [`StoreError::NotFound`].
    async fn open(&self, key: &BlobKey) -> Result<BlobReader, StoreError>;

    async fn put(&self, key: &BlobKey, content: Bytes) -> Result<(), StoreError>;

    async fn read(&self, key: &BlobKey) -> Result<Vec<u8>, StoreError> {
        let mut reader = self.open(key).await?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        Ok(content)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn begin_outputs(&self, job: &JobRef) -> Result<Box<dyn OutputTransaction>, StoreError>;
}

#[async_trait]
pub trait OutputTransaction: Send {
    /// Stores a new value for `interface`. The value is staged until commit.
    async fn create_value(
        &mut self,
        interface: &ComponentInterface,
        value: NewValue,
    ) -> Result<ComponentInterfaceValue, StoreError>;

    /// Publishes every staged value at once.
    async fn commit(self: Box<Self>) -> Result<Vec<ComponentInterfaceValue>, StoreError>;
}

/// Side effects that run for every output value once the harvest is committed,
/// e.g. granting permissions on the new value.
#[async_trait]
pub trait PostCreateHook: Send + Sync {
    async fn after_create(&self, value: &ComponentInterfaceValue) -> Result<(), StoreError>;
}
