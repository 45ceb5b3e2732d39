//! Harvests output values from the output volume after the executor exits.

use crate::archive::{self, FetchError, UnpackError, MAX_ARCHIVE_SIZE};
use crate::connection::{Connection, OUTPUT_DIR};
use crate::error::{ComponentFailure, ExecutionError, InfrastructureError};
use crate::host::VolumeMount;
use crate::import::ImageImporter;
use crate::interface::{ComponentInterface, FileFormat, SuperKind};
use crate::json;
use crate::paths;
use crate::store::{JobStore, OutputTransaction, PostCreateHook};
use crate::values::{ComponentInterfaceValue, NewFile, NewImage, NewValue};
use bytes::Bytes;
use std::sync::Arc;
use tempfile::{SpooledTempFile, TempDir};
use tracing::{debug, instrument};

impl Connection {
    /// Creates one value per output interface inside a single transaction.
    /// Either every value is committed or none is. Hooks only see committed
    /// values.
    #[instrument(skip_all, fields(job = %self.label(), interfaces = interfaces.len()))]
    pub async fn get_outputs(
        &self,
        interfaces: &[ComponentInterface],
        jobs: &dyn JobStore,
        importer: Arc<dyn ImageImporter>,
        hooks: &[Arc<dyn PostCreateHook>],
    ) -> Result<Vec<ComponentInterfaceValue>, ExecutionError> {
        let reader = self.helper("reader", VolumeMount::read_only(self.output_volume(), OUTPUT_DIR));
        self.host()
            .run_container(&reader)
            .await
            .map_err(InfrastructureError::host("start output reader"))?;

        let harvested = self
            .harvest(&reader.name, interfaces, jobs, importer, hooks)
            .await;
        self.remove_quietly(&reader.name).await;
        harvested
    }

    async fn harvest(
        &self,
        reader: &str,
        interfaces: &[ComponentInterface],
        jobs: &dyn JobStore,
        importer: Arc<dyn ImageImporter>,
        hooks: &[Arc<dyn PostCreateHook>],
    ) -> Result<Vec<ComponentInterfaceValue>, ExecutionError> {
        let mut transaction = jobs.begin_outputs(self.job()).await?;
        for interface in interfaces {
            let civ = match interface.super_kind() {
                SuperKind::Image => {
                    self.create_image_result(reader, interface, transaction.as_mut(), Arc::clone(&importer))
                        .await?
                }
                SuperKind::File => {
                    self.create_file_result(reader, interface, transaction.as_mut())
                        .await?
                }
            };
            debug!(interface = %interface.slug, value = %civ.id, "Created output value");
        }
        let committed = transaction.commit().await?;
        for civ in &committed {
            for hook in hooks {
                hook.after_create(civ).await?;
            }
        }
        Ok(committed)
    }

    async fn fetch(&self, reader: &str, path: &str) -> Result<SpooledTempFile, FetchError> {
        archive::collect(self.host().get_archive(reader, path), MAX_ARCHIVE_SIZE).await
    }

    async fn create_image_result(
        &self,
        reader: &str,
        interface: &ComponentInterface,
        transaction: &mut dyn OutputTransaction,
        importer: Arc<dyn ImageImporter>,
    ) -> Result<ComponentInterfaceValue, ExecutionError> {
        let dir = paths::safe_join(OUTPUT_DIR, &interface.relative_path)?;
        let dir = dir.trim_end_matches('/').to_string();
        let archive = match self.fetch(reader, &dir).await {
            Ok(archive) => archive,
            Err(FetchError::Host(error)) if error.is_not_found() => {
                return Err(ComponentFailure::OutputListing { dir }.into())
            }
            Err(error) => return Err(fetch_failed(&dir, error).into()),
        };

        let top = paths::file_name(&dir).to_string();
        let unpacked = tokio::task::spawn_blocking(move || -> Result<_, UnpackError> {
            let tmp = TempDir::new()?;
            let written = archive::unpack_dir(archive, &top, tmp.path())?;
            Ok((tmp, written))
        })
        .await
        .map_err(|e| InfrastructureError::Import {
            message: e.to_string(),
        })?;
        let (tmp, written) = match unpacked {
            Ok(unpacked) => unpacked,
            Err(UnpackError::UnsafeEntry { entry }) => {
                return Err(ComponentFailure::UnsafeArchiveEntry { entry, prefix: dir }.into())
            }
            Err(UnpackError::Io(source)) => {
                return Err(InfrastructureError::ArchiveIo { path: dir, source }.into())
            }
        };
        if written.is_empty() {
            return Err(ComponentFailure::OutputDirEmpty { dir }.into());
        }

        let (tmp, result) = tokio::task::spawn_blocking(move || {
            let result = importer.import(tmp.path());
            (tmp, result)
        })
        .await
        .map_err(|e| InfrastructureError::Import {
            message: e.to_string(),
        })?;
        let mut result = result.map_err(|e| InfrastructureError::Import {
            message: e.to_string(),
        })?;
        for (path, error) in &result.file_errors {
            debug!(file = %path.display(), %error, "File was not imported");
        }
        let image = match result.new_images.len() {
            0 => return Err(ComponentFailure::NoImagesImported { dir }.into()),
            1 => result.new_images.remove(0),
            found => return Err(ComponentFailure::TooManyImages { dir, found }.into()),
        };
        if interface.validate_image(&image).is_err() {
            return Err(ComponentFailure::InvalidImage { dir }.into());
        }

        let mut files = Vec::with_capacity(image.files.len());
        for path in &image.files {
            let content = tokio::fs::read(path)
                .await
                .map_err(|source| InfrastructureError::ArchiveIo {
                    path: path.display().to_string(),
                    source,
                })?;
            files.push(NewFile {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                content: Bytes::from(content),
            });
        }
        drop(tmp);

        let value = NewValue::Image(NewImage {
            name: image.name,
            element_type: image.element_type,
            dimensions: image.dimensions,
            files,
        });
        Ok(transaction.create_value(interface, value).await?)
    }

    async fn create_file_result(
        &self,
        reader: &str,
        interface: &ComponentInterface,
        transaction: &mut dyn OutputTransaction,
    ) -> Result<ComponentInterfaceValue, ExecutionError> {
        let path = paths::safe_join(OUTPUT_DIR, &interface.relative_path)?;
        let not_produced = || ComponentFailure::OutputNotProduced { path: path.clone() };
        let archive = match self.fetch(reader, &path).await {
            Ok(archive) => archive,
            Err(FetchError::Host(error)) if error.is_not_found() => return Err(not_produced().into()),
            Err(error) => return Err(fetch_failed(&path, error).into()),
        };

        let name = paths::file_name(&path).to_string();
        let content = tokio::task::spawn_blocking(move || archive::read_file(archive, &name))
            .await
            .map_err(|e| InfrastructureError::Import {
                message: e.to_string(),
            })?
            .map_err(|source| InfrastructureError::ArchiveIo {
                path: path.clone(),
                source,
            })?
            .ok_or_else(not_produced)?;

        let value = match interface.kind.file_format() {
            Some(FileFormat::Json) => {
                let invalid_json = || ComponentFailure::InvalidJson { path: path.clone() };
                let text = String::from_utf8(content).map_err(|_| invalid_json())?;
                let value = json::parse_lenient(&text).map_err(|_| invalid_json())?;
                interface
                    .validate_value(&value)
                    .map_err(|_| ComponentFailure::InvalidOutput { path: path.clone() })?;
                NewValue::Json(value)
            }
            Some(FileFormat::Stored) => {
                interface
                    .validate_file(&content)
                    .map_err(|_| ComponentFailure::InvalidOutput { path: path.clone() })?;
                NewValue::File(NewFile {
                    name: paths::file_name(&path).to_string(),
                    content: Bytes::from(content),
                })
            }
            None => return Err(ComponentFailure::InvalidOutput { path }.into()),
        };
        Ok(transaction.create_value(interface, value).await?)
    }
}

fn fetch_failed(path: &str, error: FetchError) -> InfrastructureError {
    match error {
        FetchError::TooLarge { limit } => InfrastructureError::ArchiveTooLarge {
            path: path.to_string(),
            limit,
        },
        FetchError::Io(source) => InfrastructureError::ArchiveIo {
            path: path.to_string(),
            source,
        },
        FetchError::Host(source) => InfrastructureError::Host {
            operation: format!("fetch {}", path),
            source,
        },
    }
}
