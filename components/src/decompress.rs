//! Legacy zip inputs that are unpacked into the input volume instead of
//! being copied as a single file.

use crate::archive::TarSpool;
use crate::error::{ComponentFailure, ExecutionError, InfrastructureError};
use crate::paths;
use std::collections::BTreeSet;
use std::io::{Read, Seek};
use tempfile::SpooledTempFile;
use zip::ZipArchive;

const MACOS_METADATA: &str = "__MACOSX";

struct ZipEntry {
    index: usize,
    parts: Vec<String>,
    is_dir: bool,
}

/// Converts a zip archive into a tar archive whose entries are relative to
/// `root` and placed below `prefix`. `prefix` is an absolute directory at or
/// below `root`.
///
/// `__MACOSX/` entries are skipped. When the zip holds a single top-level
/// directory its contents are moved up one level and the directory itself is
/// dropped.
pub fn zip_to_tar<R: Read + Seek>(
    zip: R,
    archive_name: &str,
    root: &str,
    prefix: &str,
) -> Result<SpooledTempFile, ExecutionError> {
    let invalid = || ComponentFailure::InvalidArchive {
        archive: archive_name.to_string(),
    };
    let io_error = |source| InfrastructureError::ArchiveIo {
        path: archive_name.to_string(),
        source,
    };

    let mut zip = ZipArchive::new(zip).map_err(|_| invalid())?;
    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let file = zip.by_index(index).map_err(|_| invalid())?;
        let name = file.name().to_string();
        if name == MACOS_METADATA || name.starts_with(&format!("{}/", MACOS_METADATA)) {
            continue;
        }
        let unsafe_entry = || ComponentFailure::UnsafeArchiveEntry {
            entry: name.clone(),
            prefix: prefix.to_string(),
        };
        if file.enclosed_name().is_none() {
            return Err(unsafe_entry().into());
        }
        paths::safe_join(prefix, &name).map_err(|_| unsafe_entry())?;
        let parts: Vec<String> = name
            .split('/')
            .filter(|p| !p.is_empty() && *p != ".")
            .map(str::to_string)
            .collect();
        if parts.is_empty() {
            continue;
        }
        entries.push(ZipEntry {
            index,
            parts,
            is_dir: file.is_dir(),
        });
    }

    let top_level: BTreeSet<&str> = entries.iter().map(|e| e.parts[0].as_str()).collect();
    let hoist = top_level.len() == 1
        && entries
            .iter()
            .any(|e| e.is_dir || e.parts.len() > 1);
    let strip = usize::from(hoist);

    let base = paths::strip_root(root, prefix)
        .ok_or_else(|| ComponentFailure::PathEscape {
            path: prefix.to_string(),
            root: root.to_string(),
        })?
        .trim_end_matches('/')
        .to_string();
    let target = |parts: &[String]| {
        let relative = parts.join("/");
        if base.is_empty() {
            relative
        } else {
            format!("{}/{}", base, relative)
        }
    };

    let mut tar = TarSpool::new();
    if !base.is_empty() {
        tar.append_dir(&base).map_err(io_error)?;
        tar.append_parents(&base).map_err(io_error)?;
    }
    for entry in &entries {
        let parts = &entry.parts[strip..];
        if parts.is_empty() {
            continue;
        }
        let path = target(parts);
        if entry.is_dir {
            tar.append_parents(&path).map_err(io_error)?;
            tar.append_dir(&path).map_err(io_error)?;
        } else {
            let file = zip.by_index(entry.index).map_err(|_| invalid())?;
            let size = file.size();
            tar.append_file(&path, size, file).map_err(io_error)?;
        }
    }
    Ok(tar.finish().map_err(io_error)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    fn zip_of(files: &[&str]) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for name in files {
            if name.ends_with('/') {
                writer.add_directory(*name, FileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(name.as_bytes()).unwrap();
            }
        }
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    fn tar_names(spool: SpooledTempFile) -> Vec<String> {
        let mut archive = tar::Archive::new(spool);
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                path.trim_end_matches('/').to_string()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_single_top_level_directory_is_hoisted() {
        let zip = zip_of(&["payload/", "payload/a.csv", "payload/sub/b.csv", "__MACOSX/._a.csv"]);

        let tar = zip_to_tar(zip, "predictions.zip", "/input/", "/input/").unwrap();

        assert_eq!(tar_names(tar), vec!["a.csv", "sub", "sub/b.csv"]);
    }

    #[test]
    fn test_several_top_level_entries_are_kept() {
        let zip = zip_of(&["a.csv", "b/c.csv"]);

        let tar = zip_to_tar(zip, "predictions.zip", "/input/", "/input/").unwrap();

        assert_eq!(tar_names(tar), vec!["a.csv", "b", "b/c.csv"]);
    }

    #[test]
    fn test_entries_land_below_prefix() {
        let zip = zip_of(&["a.csv"]);

        let tar = zip_to_tar(zip, "predictions.zip", "/input/", "/input/case-1/").unwrap();

        assert_eq!(tar_names(tar), vec!["case-1", "case-1/a.csv"]);
    }

    #[test]
    fn test_invalid_zip_is_a_component_failure() {
        let result = zip_to_tar(Cursor::new(b"not a zip".to_vec()), "x.zip", "/input/", "/input/");

        assert!(matches!(
            result,
            Err(ExecutionError::Component(ComponentFailure::InvalidArchive { .. }))
        ));
    }

    #[test]
    fn test_traversal_entry_is_rejected() {
        let zip = zip_of(&["../../etc/cron.d/evil"]);

        let result = zip_to_tar(zip, "evil.zip", "/input/", "/input/");

        assert!(matches!(
            result,
            Err(ExecutionError::Component(ComponentFailure::UnsafeArchiveEntry { .. }))
        ));
    }
}
