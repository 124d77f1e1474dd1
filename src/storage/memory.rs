use crate::config::types::{Result, UpletError};
use crate::storage::{read_exact_size, validate_key, BlobStore};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory blob store with failure injection
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delete fail with a transient error
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // a panicking writer cannot leave a half-inserted blob
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, reader: &mut dyn Read, size: u64) -> Result<()> {
        validate_key(key)?;
        let bytes = read_exact_size(reader, size)?;
        self.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let bytes = self
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| UpletError::NotFound(key.to_string()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(UpletError::Transient(format!("delete of {} failed", key)));
        }
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| UpletError::NotFound(key.to_string()))
    }
}
