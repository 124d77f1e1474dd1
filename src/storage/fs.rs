use crate::config::types::{Result, UpletError};
use crate::storage::{short_read, validate_key, BlobStore};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One file per key under `root`; writes become visible atomically
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            UpletError::Filesystem(format!("Failed to create blob root {:?}: {}", root, e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn not_found(key: &str, err: io::Error) -> UpletError {
        if err.kind() == io::ErrorKind::NotFound {
            UpletError::NotFound(key.to_string())
        } else {
            UpletError::Io(err)
        }
    }
}

fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Removes a temporary file unless the write completed
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, reader: &mut dyn Read, size: u64) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| UpletError::Validation(format!("invalid blob key: {}", key)))?;
        fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut guard = TempGuard {
            path: parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4())),
            armed: true,
        };

        let mut tmp = File::create(&guard.path)?;
        let copied = io::copy(&mut reader.take(size), &mut tmp)?;
        if copied < size {
            return Err(short_read(copied, size));
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&guard.path, &path)?;
        guard.armed = false;
        sync_directory(parent)?;

        log::debug!("Stored blob {} ({} bytes)", key, size);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_for(key)?;
        let file = File::open(&path).map_err(|e| Self::not_found(key, e))?;
        if file.metadata()?.is_dir() {
            return Err(UpletError::NotFound(key.to_string()));
        }
        Ok(Box::new(file))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::remove_file(&path).map_err(|e| Self::not_found(key, e))
    }

    /// Same-filesystem rename; atomic, so the blob is never visible under neither key
    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let from = self.path_for(old)?;
        let to = self.path_for(new)?;
        if !from.is_file() {
            return Err(UpletError::NotFound(old.to_string()));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to).map_err(|e| Self::not_found(old, e))?;
        if let Some(parent) = to.parent() {
            sync_directory(parent)?;
        }
        Ok(())
    }
}
