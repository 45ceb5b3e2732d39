//! Getting the I/O helper image and a job's executable image onto the host.

use crate::archive;
use crate::connection::Connection;
use crate::error::InfrastructureError;
use crate::store::{BlobKey, BlobStore};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

/// Loading a large image archive can take a while.
pub const IMAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("image digest {digest} must look like sha256:<64 lowercase hex characters>")]
pub struct InvalidDigest {
    pub digest: String,
}

/// The executable image of a job: its content digest and the blob holding
/// its `docker save` archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawImageReference")]
pub struct ImageReference {
    digest: String,
    blob: BlobKey,
}

#[derive(Deserialize)]
struct RawImageReference {
    digest: String,
    blob: BlobKey,
}

impl TryFrom<RawImageReference> for ImageReference {
    type Error = InvalidDigest;

    fn try_from(raw: RawImageReference) -> Result<Self, Self::Error> {
        ImageReference::new(raw.digest, raw.blob)
    }
}

impl ImageReference {
    pub fn new(digest: impl Into<String>, blob: BlobKey) -> Result<Self, InvalidDigest> {
        let digest = digest.into();
        let valid = digest
            .strip_prefix("sha256:")
            .map(|hex| {
                hex.len() == 64
                    && hex
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            })
            .unwrap_or(false);
        if !valid {
            return Err(InvalidDigest { digest });
        }
        Ok(Self { digest, blob })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn blob(&self) -> &BlobKey {
        &self.blob
    }
}

impl Connection {
    /// Makes sure both the I/O helper image and the executable image are
    /// present on the host.
    pub async fn pull_images(&self, blobs: &dyn BlobStore) -> Result<(), InfrastructureError> {
        self.pull_helper_image().await?;
        self.pull_executable_image(blobs).await
    }

    #[instrument(skip(self), fields(job = %self.label()))]
    pub async fn pull_helper_image(&self) -> Result<(), InfrastructureError> {
        let image = self.settings().io_image.clone();
        let present = self
            .host()
            .image_exists(&image)
            .await
            .map_err(InfrastructureError::host("inspect helper image"))?;
        if !present {
            info!(%image, "Pulling helper image");
            self.host()
                .pull_image(&image)
                .await
                .map_err(|source| InfrastructureError::ImagePull { image, source })?;
        }
        Ok(())
    }

    /// Loads the executable image from the blob store unless the host
    /// already has it.
    #[instrument(skip(self, blobs), fields(job = %self.label(), digest = %self.image().digest()))]
    pub async fn pull_executable_image(&self, blobs: &dyn BlobStore) -> Result<(), InfrastructureError> {
        let digest = self.image().digest().to_string();
        let present = self
            .host()
            .image_exists(&digest)
            .await
            .map_err(InfrastructureError::host("inspect executable image"))?;
        if present {
            return Ok(());
        }

        let key = self.image().blob();
        let reader = blobs
            .open(key)
            .await
            .map_err(|source| InfrastructureError::MissingImageBlob {
                key: key.to_string(),
                source,
            })?;
        let (spool, size) = archive::spool_async(reader)
            .await
            .map_err(|source| InfrastructureError::ArchiveIo {
                path: key.to_string(),
                source,
            })?;
        info!(bytes = size, "Loading executable image");
        self.host()
            .load_image(spool, IMAGE_LOAD_TIMEOUT)
            .await
            .map_err(|source| InfrastructureError::ImageLoad {
                digest: digest.clone(),
                source,
            })?;

        let loaded = self
            .host()
            .image_exists(&digest)
            .await
            .map_err(InfrastructureError::host("inspect executable image"))?;
        if !loaded {
            return Err(InfrastructureError::ImageDigestMismatch { expected: digest });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_must_be_sha256() {
        let blob = BlobKey::new("algo.tar");
        assert!(ImageReference::new(format!("sha256:{}", "0f".repeat(32)), blob.clone()).is_ok());
        assert!(ImageReference::new("sha256:abc", blob.clone()).is_err());
        assert!(ImageReference::new(format!("md5:{}", "0".repeat(64)), blob.clone()).is_err());
        assert!(ImageReference::new(format!("sha256:{}", "A".repeat(64)), blob).is_err());
    }
}
