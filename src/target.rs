//! Artifact handles and the storage collaborator they delegate to.

use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Identifies a named data artifact produced by a specific task instance.
///
/// A `TargetRef` is created every time an output port is evaluated and is
/// never mutated. Two targets are equal iff they name the same task and the
/// same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    task: Arc<str>,
    path: Utf8PathBuf,
}

impl TargetRef {
    pub fn new(task: impl Into<Arc<str>>, path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            task: task.into(),
            path: path.into(),
        }
    }

    /// Name of the task owning this artifact.
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self, storage: &dyn Storage) -> Result<bool, StorageError> {
        storage.exists(&self.path).map_err(|e| self.tag(e))
    }

    /// Deletes the artifact. A target that does not exist is not an error.
    pub fn remove(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        storage.remove(&self.path).map_err(|e| self.tag(e))
    }

    pub fn read(&self, storage: &dyn Storage) -> Result<Vec<u8>, StorageError> {
        storage.read(&self.path).map_err(|e| self.tag(e))
    }

    pub fn read_to_string(&self, storage: &dyn Storage) -> Result<String, StorageError> {
        let bytes = self.read(storage)?;
        String::from_utf8(bytes)
            .map_err(|e| self.tag(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    pub fn write(&self, storage: &dyn Storage, data: impl AsRef<[u8]>) -> Result<(), StorageError> {
        storage.write(&self.path, data.as_ref()).map_err(|e| self.tag(e))
    }

    fn tag(&self, source: io::Error) -> StorageError {
        StorageError {
            target: self.to_string(),
            source,
        }
    }
}

impl Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task, self.path)
    }
}

/// Key-addressable blob service backing the targets.
pub trait Storage: Send + Sync {
    fn exists(&self, path: &Utf8Path) -> io::Result<bool>;
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Utf8Path, data: &[u8]) -> io::Result<()>;
    fn remove(&self, path: &Utf8Path) -> io::Result<()>;
}

/// Storage on the local file system, with relative paths resolved against a
/// root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: Utf8PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Absolute path (or root-relative path) of a target's file on disk.
    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(path)
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new(".")
    }
}

impl Storage for LocalStorage {
    fn exists(&self, path: &Utf8Path) -> io::Result<bool> {
        self.resolve(path).as_std_path().try_exists()
    }

    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn write(&self, path: &Utf8Path, data: &[u8]) -> io::Result<()> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let dest = self.resolve(path);
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }

        // Written next to the destination so the rename stays on one device.
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = Utf8PathBuf::from(format!("{dest}.tmp-{}-{n}", std::process::id()));

        fs::write(&temp, data)?;
        fs::rename(&temp, &dest).inspect_err(|_| {
            fs::remove_file(&temp).ok();
        })
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, LocalStorage::new(root))
    }

    #[test]
    fn test_equality_on_task_and_path() {
        let a = TargetRef::new("W", "foo.txt");
        let b = TargetRef::new("W", "foo.txt");
        let c = TargetRef::new("R", "foo.txt");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "W:foo.txt");
    }

    #[test]
    fn test_write_then_exists() {
        let (_dir, storage) = storage();
        let target = TargetRef::new("W", "nested/foo.txt");

        assert!(!target.exists(&storage).unwrap());
        target.write(&storage, "foo").unwrap();
        assert!(target.exists(&storage).unwrap());
        assert_eq!(target.read_to_string(&storage).unwrap(), "foo");
    }

    #[test]
    fn test_errors_are_tagged_with_target() {
        let (_dir, storage) = storage();
        let target = TargetRef::new("W", "missing.txt");

        let err = target.read(&storage).unwrap_err();
        assert_eq!(err.target, "W:missing.txt");
        assert_eq!(err.source.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let (_dir, storage) = storage();
        storage.remove(Utf8Path::new("nothing")).unwrap();
    }

    #[test]
    fn test_remove_written_target() {
        let (_dir, storage) = storage();
        let target = TargetRef::new("W", "foo.txt");

        target.write(&storage, "foo").unwrap();
        target.remove(&storage).unwrap();
        assert!(!target.exists(&storage).unwrap());
    }
}
