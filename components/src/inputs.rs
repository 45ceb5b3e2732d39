//! Materializes a job's input values in the input volume.

use crate::archive::{self, TarSpool};
use crate::connection::{Connection, INPUT_DIR};
use crate::decompress;
use crate::error::{ComponentFailure, ExecutionError, InfrastructureError};
use crate::host::VolumeMount;
use crate::paths;
use crate::store::{BlobKey, BlobStore};
use crate::values::{CivValue, ComponentInterfaceValue};
use std::collections::BTreeMap;
use tempfile::SpooledTempFile;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Per-value directory overrides, relative to `/input/`.
pub type InputPrefixes = BTreeMap<Uuid, String>;

enum Content {
    Inline(Vec<u8>),
    Spooled(SpooledTempFile, u64),
}

impl Connection {
    #[instrument(skip_all, fields(job = %self.label(), inputs = inputs.len()))]
    pub async fn provision_input_volume(
        &self,
        blobs: &dyn BlobStore,
        inputs: &[ComponentInterfaceValue],
        prefixes: &InputPrefixes,
    ) -> Result<(), ExecutionError> {
        let writer = self.helper("writer", VolumeMount::read_write(self.input_volume(), INPUT_DIR));
        self.host()
            .run_container(&writer)
            .await
            .map_err(InfrastructureError::host("start input writer"))?;

        let copied = self.copy_input_files(&writer.name, blobs, inputs, prefixes).await;
        self.remove_quietly(&writer.name).await;
        copied
    }

    async fn copy_input_files(
        &self,
        writer: &str,
        blobs: &dyn BlobStore,
        inputs: &[ComponentInterfaceValue],
        prefixes: &InputPrefixes,
    ) -> Result<(), ExecutionError> {
        for civ in inputs {
            let prefix = match prefixes.get(&civ.id) {
                Some(prefix) => paths::safe_join(INPUT_DIR, prefix)?,
                None => INPUT_DIR.to_string(),
            };
            let archive = if civ.decompress {
                self.decompressed_archive(blobs, civ, &prefix).await?
            } else {
                self.input_archive(blobs, civ, &prefix).await?
            };
            debug!(input = %civ.interface.slug, %prefix, "Copying input");
            self.host()
                .put_archive(writer, INPUT_DIR, archive)
                .await
                .map_err(InfrastructureError::host(format!(
                    "copy input {}",
                    civ.interface.slug
                )))?;
        }
        Ok(())
    }

    async fn input_archive(
        &self,
        blobs: &dyn BlobStore,
        civ: &ComponentInterfaceValue,
        prefix: &str,
    ) -> Result<SpooledTempFile, ExecutionError> {
        let destination = paths::safe_join(prefix, civ.relative_path())?;
        let mut files = Vec::new();
        match &civ.value {
            CivValue::Json(value) => {
                let content = serde_json::to_vec(value).map_err(|e| InfrastructureError::InvalidInput {
                    id: civ.id.to_string(),
                    message: e.to_string(),
                })?;
                files.push((destination, Content::Inline(content)));
            }
            CivValue::File(file) => {
                let (spool, size) = self.spool_blob(blobs, &file.blob).await?;
                files.push((destination, Content::Spooled(spool, size)));
            }
            CivValue::Image(image) => {
                for file in &image.files {
                    let path = paths::safe_join(&format!("{}/", destination), &file.name)?;
                    let (spool, size) = self.spool_blob(blobs, &file.blob).await?;
                    files.push((path, Content::Spooled(spool, size)));
                }
            }
        }

        let slug = civ.interface.slug.clone();
        let built = tokio::task::spawn_blocking(move || -> std::io::Result<SpooledTempFile> {
            let mut tar = TarSpool::new();
            for (path, content) in files {
                let relative = paths::strip_root(INPUT_DIR, &path).unwrap_or(path.as_str());
                match content {
                    Content::Inline(bytes) => tar.append_bytes(relative, &bytes)?,
                    Content::Spooled(spool, size) => tar.append_file(relative, size, spool)?,
                }
            }
            tar.finish()
        })
        .await
        .map_err(|e| InfrastructureError::InvalidInput {
            id: civ.id.to_string(),
            message: e.to_string(),
        })?;
        Ok(built.map_err(|source| InfrastructureError::ArchiveIo { path: slug, source })?)
    }

    async fn decompressed_archive(
        &self,
        blobs: &dyn BlobStore,
        civ: &ComponentInterfaceValue,
        prefix: &str,
    ) -> Result<SpooledTempFile, ExecutionError> {
        if !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(ComponentFailure::InvalidPrefix {
                prefix: prefix.to_string(),
            }
            .into());
        }
        let CivValue::File(file) = &civ.value else {
            return Err(InfrastructureError::InvalidInput {
                id: civ.id.to_string(),
                message: "only stored files can be decompressed".to_string(),
            }
            .into());
        };
        let (spool, _) = self.spool_blob(blobs, &file.blob).await?;
        let name = file.name.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || decompress::zip_to_tar(spool, &name, INPUT_DIR, &prefix))
            .await
            .map_err(|e| InfrastructureError::InvalidInput {
                id: civ.id.to_string(),
                message: e.to_string(),
            })?
    }

    async fn spool_blob(
        &self,
        blobs: &dyn BlobStore,
        key: &BlobKey,
    ) -> Result<(SpooledTempFile, u64), ExecutionError> {
        let reader = blobs.open(key).await?;
        let (spool, size) = archive::spool_async(reader)
            .await
            .map_err(|source| InfrastructureError::ArchiveIo {
                path: key.to_string(),
                source,
            })?;
        Ok((spool, size))
    }
}
