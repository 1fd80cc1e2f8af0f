//! Blob stores — the key-value interface an expert library persists through

use crate::error::{ExpertError, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// One stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Key-value object store grouped into named containers.
///
/// Implementations report retryable failures as `ExpertError::TransientIo`;
/// the library wraps every call in its `RetryPolicy`.
pub trait BlobStore: Send + Sync {
    /// Where the store lives; two stores with the same location share objects
    fn location(&self) -> String;

    fn list_files(&self, container: &str) -> Result<Vec<FileInfo>>;

    /// Fetch an object to a local path the caller may read
    fn download(&self, container: &str, name: &str) -> Result<PathBuf>;

    fn upload(&self, container: &str, name: &str, bytes: &[u8]) -> Result<()>;

    fn delete(&self, container: &str, name: &str) -> Result<()>;

    fn create_container(&self, container: &str) -> Result<()>;

    fn container_exists(&self, container: &str) -> Result<bool>;
}

/// Classify an I/O failure for the retry policy
fn classify(err: std::io::Error, what: &str) -> ExpertError {
    match err.kind() {
        ErrorKind::NotFound => ExpertError::not_found(what.to_string()),
        ErrorKind::Interrupted
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => ExpertError::TransientIo(format!("{}: {}", what, err)),
        _ => ExpertError::Io(err),
    }
}

/// Directory-backed store: one sub-directory per container
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        if container.is_empty() || container.contains("..") {
            return Err(ExpertError::config(format!("invalid container name '{}'", container)));
        }
        Ok(self.root.join(container))
    }

    fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(ExpertError::config(format!("invalid object name '{}'", name)));
        }
        Ok(self.container_dir(container)?.join(name))
    }
}

impl BlobStore for LocalBlobStore {
    fn location(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn list_files(&self, container: &str) -> Result<Vec<FileInfo>> {
        let dir = self.container_dir(container)?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| classify(e, &format!("container '{}'", container)))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if meta.is_file() && !name.starts_with('.') {
                files.push(FileInfo {
                    name,
                    size: meta.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn download(&self, container: &str, name: &str) -> Result<PathBuf> {
        let path = self.object_path(container, name)?;
        if !path.is_file() {
            return Err(ExpertError::not_found(format!("object '{}/{}'", container, name)));
        }
        Ok(path)
    }

    fn upload(&self, container: &str, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(container, name)?;
        // Write-then-rename so readers never observe a partial object
        let tmp = self.object_path(container, &format!(".{}.partial", name))?;
        fs::write(&tmp, bytes).map_err(|e| classify(e, &format!("upload '{}/{}'", container, name)))?;
        fs::rename(&tmp, &path).map_err(|e| classify(e, &format!("upload '{}/{}'", container, name)))?;
        debug!("Uploaded {}/{} ({} bytes)", container, name, bytes.len());
        Ok(())
    }

    fn delete(&self, container: &str, name: &str) -> Result<()> {
        let path = self.object_path(container, name)?;
        fs::remove_file(&path).map_err(|e| classify(e, &format!("object '{}/{}'", container, name)))
    }

    fn create_container(&self, container: &str) -> Result<()> {
        fs::create_dir_all(self.container_dir(container)?)?;
        Ok(())
    }

    fn container_exists(&self, container: &str) -> Result<bool> {
        Ok(self.container_dir(container)?.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        assert!(!store.container_exists("lib").unwrap());
        store.create_container("lib").unwrap();
        store.upload("lib", "a.meta", b"{}").unwrap();
        store.upload("lib", "b.ckpt", &[1, 2, 3]).unwrap();
        let files = store.list_files("lib").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1], FileInfo { name: "b.ckpt".into(), size: 3 });
        let path = store.download("lib", "b.ckpt").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
        store.delete("lib", "b.ckpt").unwrap();
        assert!(matches!(store.download("lib", "b.ckpt"), Err(ExpertError::NotFound(_))));
        assert!(matches!(store.delete("lib", "b.ckpt"), Err(ExpertError::NotFound(_))));
    }

    #[test]
    fn test_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        assert!(store.upload("..", "x", b"").is_err());
        assert!(store.upload("lib", "../x", b"").is_err());
    }

    #[test]
    fn test_classify_transient_kinds() {
        let err = classify(std::io::Error::new(ErrorKind::TimedOut, "slow"), "x");
        assert!(err.is_transient());
        let err = classify(std::io::Error::new(ErrorKind::PermissionDenied, "no"), "x");
        assert!(!err.is_transient());
    }
}
