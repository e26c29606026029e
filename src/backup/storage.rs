//! Remote Storage
//!
//! Optional upload channel for finished artifacts. [`DirectoryRemoteStore`]
//! mirrors artifacts into another directory, standing in for an object store.

use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{DrError, Result};

/// Upload/download boundary for finished artifacts.
pub trait RemoteStore: Send + Sync {
    /// Copy `local` to `key`; returns the remote location string.
    fn upload(&self, local: &Path, key: &str) -> Result<String>;
    /// Copy the object at `location` to `dst`.
    fn fetch(&self, location: &str, dst: &Path) -> Result<()>;
    fn delete(&self, location: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DirectoryRemoteStore {
    root: PathBuf,
}

impl DirectoryRemoteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = key.strip_prefix("dir://").unwrap_or(key);
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DrError::Config(format!("invalid remote key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteStore for DirectoryRemoteStore {
    fn upload(&self, local: &Path, key: &str) -> Result<String> {
        let dst = self.resolve(key)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = fs::copy(local, &dst)?;
        debug!(key, bytes, "Uploaded artifact");
        Ok(format!("dir://{}", key))
    }

    fn fetch(&self, location: &str, dst: &Path) -> Result<()> {
        let src = self.resolve(location)?;
        if !src.exists() {
            return Err(DrError::NotFound(format!("remote object {}", location)));
        }
        fs::copy(src, dst)?;
        Ok(())
    }

    fn delete(&self, location: &str) -> Result<()> {
        let path = self.resolve(location)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_upload_fetch_delete() {
        let local = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        let remote = DirectoryRemoteStore::new(remote_dir.path());
        let artifact = local.path().join("a.tar.gz");
        fs::write(&artifact, b"artifact").unwrap();

        let location = remote.upload(&artifact, "daily/a.tar.gz").unwrap();
        assert_eq!(location, "dir://daily/a.tar.gz");

        let copy = local.path().join("copy");
        remote.fetch(&location, &copy).unwrap();
        assert_eq!(fs::read(&copy).unwrap(), b"artifact");

        remote.delete(&location).unwrap();
        assert!(matches!(remote.fetch(&location, &copy), Err(DrError::NotFound(_))));
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let remote = DirectoryRemoteStore::new("/tmp/remote");
        assert!(remote.resolve("../etc/passwd").is_err());
    }
}
