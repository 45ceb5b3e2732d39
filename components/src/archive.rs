//! Tar archives: the wire format for moving files in and out of containers.
//!
//! Archives are staged in spooled buffers that stay in memory up to
//! [`MAX_SPOOL_SIZE`] bytes and move to disk beyond that.

use crate::host::HostError;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::SpooledTempFile;
use thiserror::Error;

pub const MAX_SPOOL_SIZE: usize = 1_000_000_000;

/// Largest archive accepted from a container for a single artifact.
pub const MAX_ARCHIVE_SIZE: u64 = 2_000_000_000;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

pub fn spooled() -> SpooledTempFile {
    SpooledTempFile::new(MAX_SPOOL_SIZE)
}

/// Copies a reader into a fresh spooled buffer, returning it rewound along
/// with the number of bytes copied.
pub fn spool<R: Read>(mut reader: R) -> io::Result<(SpooledTempFile, u64)> {
    let mut spool = spooled();
    let size = io::copy(&mut reader, &mut spool)?;
    spool.seek(SeekFrom::Start(0))?;
    Ok((spool, size))
}

/// Async counterpart of [`spool`] for blob store readers.
pub async fn spool_async<R>(mut reader: R) -> io::Result<(SpooledTempFile, u64)>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut spool = spooled();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        spool.write_all(&buf[..read])?;
        size += read as u64;
    }
    spool.seek(SeekFrom::Start(0))?;
    Ok((spool, size))
}

/// Builds a tar archive of relative paths in a spooled buffer.
pub struct TarSpool {
    builder: tar::Builder<SpooledTempFile>,
    dirs: BTreeSet<String>,
}

impl TarSpool {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(spooled()),
            dirs: BTreeSet::new(),
        }
    }

    /// Adds a directory entry once, however often it is requested.
    pub fn append_dir(&mut self, path: &str) -> io::Result<()> {
        let path = format!("{}/", path.trim_end_matches('/'));
        if path == "/" || !self.dirs.insert(path.clone()) {
            return Ok(());
        }
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(DIR_MODE);
        header.set_mtime(now());
        self.builder.append_data(&mut header, &path, io::empty())
    }

    /// Adds a directory entry for every ancestor of `path`.
    pub fn append_parents(&mut self, path: &str) -> io::Result<()> {
        for dir in crate::paths::parent_dirs(path) {
            self.append_dir(&dir)?;
        }
        Ok(())
    }

    pub fn append_file<R: Read>(&mut self, path: &str, size: u64, reader: R) -> io::Result<()> {
        self.append_parents(path)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mode(FILE_MODE);
        header.set_mtime(now());
        self.builder.append_data(&mut header, path, reader)
    }

    pub fn append_bytes(&mut self, path: &str, content: &[u8]) -> io::Result<()> {
        self.append_file(path, content.len() as u64, content)
    }

    /// Finishes the archive and returns it rewound.
    pub fn finish(self) -> io::Result<SpooledTempFile> {
        let mut spool = self.builder.into_inner()?;
        spool.seek(SeekFrom::Start(0))?;
        Ok(spool)
    }
}

impl Default for TarSpool {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("archive exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Drains an archive stream into a spooled buffer, giving up once more than
/// `limit` bytes have arrived.
pub async fn collect(
    mut stream: BoxStream<'static, Result<Bytes, HostError>>,
    limit: u64,
) -> Result<SpooledTempFile, FetchError> {
    let mut spool = spooled();
    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        received += chunk.len() as u64;
        if received > limit {
            return Err(FetchError::TooLarge { limit });
        }
        spool.write_all(&chunk)?;
    }
    spool.seek(SeekFrom::Start(0))?;
    Ok(spool)
}

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("archive entry {entry} is not a safe relative path")]
    UnsafeEntry { entry: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Contents of the first regular file in the archive named `name`.
pub fn read_file<R: Read>(archive: R, name: &str) -> io::Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.into_owned();
        if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            let mut content = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut content)?;
            return Ok(Some(content));
        }
    }
    Ok(None)
}

/// Writes the regular files of a directory archive into `dest`, dropping the
/// archive's top-level directory `top`. Returns the written paths relative
/// to `dest`.
pub fn unpack_dir<R: Read>(archive: R, top: &str, dest: &Path) -> Result<Vec<PathBuf>, UnpackError> {
    let mut archive = tar::Archive::new(archive);
    let mut written = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.into_owned();
        let relative = relative_entry_path(&path, top).ok_or_else(|| UnpackError::UnsafeEntry {
            entry: path.to_string_lossy().to_string(),
        })?;
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&target)?;
        io::copy(&mut entry, &mut file)?;
        written.push(relative);
    }
    Ok(written)
}

fn relative_entry_path(path: &Path, top: &str) -> Option<PathBuf> {
    let mut components = path.components().peekable();
    while components.peek() == Some(&Component::CurDir) {
        components.next();
    }
    match components.peek() {
        Some(Component::Normal(first)) if first.to_str() == Some(top) => {
            components.next();
        }
        _ => {}
    }
    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tempfile::TempDir;

    fn archive_of(files: &[(&str, &[u8])]) -> SpooledTempFile {
        let mut tar = TarSpool::new();
        for (path, content) in files {
            tar.append_bytes(path, content).unwrap();
        }
        tar.finish().unwrap()
    }

    #[test]
    fn test_parents_are_added_once() {
        let spool = archive_of(&[("a/b/one.json", &b"1"[..]), ("a/b/two.json", &b"2"[..])]);

        let mut archive = tar::Archive::new(spool);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                path.trim_end_matches('/').to_string()
            })
            .collect();
        assert_eq!(names, vec!["a", "a/b", "a/b/one.json", "a/b/two.json"]);
    }

    #[test]
    fn test_read_file_finds_by_name() {
        let spool = archive_of(&[("result.json", &b"true"[..])]);
        assert_eq!(read_file(spool, "result.json").unwrap(), Some(b"true".to_vec()));

        let spool = archive_of(&[("result.json", &b"true"[..])]);
        assert_eq!(read_file(spool, "other.json").unwrap(), None);
    }

    #[test]
    fn test_unpack_dir_strips_top_level() {
        let spool = archive_of(&[("ct/image.mha", &b"data"[..]), ("ct/extra/notes.txt", &b"n"[..])]);
        let dest = TempDir::new().unwrap();

        let mut written = unpack_dir(spool, "ct", dest.path()).unwrap();
        written.sort();

        assert_eq!(
            written,
            vec![PathBuf::from("extra/notes.txt"), PathBuf::from("image.mha")]
        );
        assert_eq!(fs::read(dest.path().join("image.mha")).unwrap(), b"data");
    }

    #[test]
    fn test_relative_entry_path_rejects_traversal() {
        assert_eq!(relative_entry_path(Path::new("ct/../../etc/passwd"), "ct"), None);
        assert_eq!(
            relative_entry_path(Path::new("./ct/a.mha"), "ct"),
            Some(PathBuf::from("a.mha"))
        );
    }

    #[tokio::test]
    async fn test_collect_stops_at_limit() {
        let chunks = vec![Ok(Bytes::from(vec![0u8; 600])), Ok(Bytes::from(vec![0u8; 600]))];
        let result = collect(stream::iter(chunks).boxed(), 1000).await;
        assert!(matches!(result, Err(FetchError::TooLarge { limit: 1000 })));

        let chunks = vec![Ok(Bytes::from_static(b"abc"))];
        let mut spool = collect(stream::iter(chunks).boxed(), 1000).await.unwrap();
        let mut content = String::new();
        spool.read_to_string(&mut content).unwrap();
        assert_eq!(content, "abc");
    }
}
