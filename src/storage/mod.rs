//! Blob storage
//!
//! Opaque byte payloads keyed by strings. Resource blobs use `<kind>/<uuid>`
//! keys (see [`crate::model::ResourceKind::blob_key`]).

pub mod fs;
pub mod http;
pub mod memory;

pub use fs::FsBlobStore;
pub use http::StorageApi;
pub use memory::MemoryBlobStore;

use crate::config::types::{Result, UpletError};
use std::io::{self, Read};

/// Key-addressed blob storage shared between handler threads
pub trait BlobStore: Send + Sync {
    /// Store exactly `size` bytes from `reader`; a short read fails and leaves nothing at `key`
    fn put(&self, key: &str, reader: &mut dyn Read, size: u64) -> Result<()>;

    /// Open a blob; missing keys fail with `NotFound`
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Copy `old` to `new`, then delete `old`.
    ///
    /// The copy is durable before the source is deleted, so a failing delete
    /// leaves the blob under both keys rather than under neither.
    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let bytes = self.get_bytes(old)?;
        self.put_bytes(new, &bytes)?;
        self.delete(old).map_err(|e| {
            log::warn!("Blob copied to {} but source {} was not deleted: {}", new, old, e);
            e
        })
    }

    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut reader = bytes;
        self.put(key, &mut reader, bytes.len() as u64)
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.get(key)?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Read exactly `size` bytes, failing on a short read
pub(crate) fn read_exact_size(reader: &mut dyn Read, size: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(size.min(64 * 1024 * 1024) as usize);
    reader.take(size).read_to_end(&mut bytes)?;
    if (bytes.len() as u64) < size {
        return Err(short_read(bytes.len() as u64, size));
    }
    Ok(bytes)
}

/// Yields exactly `size` bytes of `inner` for streamed uploads; running dry
/// early is an `UnexpectedEof` error instead of a silently short body
pub(crate) struct SizedReader<R> {
    inner: R,
    expected: u64,
    remaining: u64,
}

impl<R: Read> SizedReader<R> {
    pub(crate) fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            expected: size,
            remaining: size,
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "short read: got {} of {} bytes",
                    self.expected - self.remaining,
                    self.expected
                ),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

pub(crate) fn short_read(got: u64, expected: u64) -> UpletError {
    UpletError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short read: got {} of {} bytes", got, expected),
    ))
}

/// Reject keys that could escape the store root
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(UpletError::Validation("blob key is empty".to_string()));
    }
    if key.starts_with('/') {
        return Err(UpletError::Validation(format!("blob key is absolute: {}", key)));
    }
    if key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(UpletError::Validation(format!("invalid blob key: {}", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cannot_escape_the_root() {
        assert!(validate_key("model/1234").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("data/../../etc").is_err());
        assert!(validate_key("data//x").is_err());
    }

    #[test]
    fn short_reader_is_an_error() {
        let mut reader: &[u8] = b"abc";
        let err = read_exact_size(&mut reader, 10).unwrap_err();
        assert!(err.to_string().contains("short read"));

        let mut reader: &[u8] = b"abcdef";
        assert_eq!(read_exact_size(&mut reader, 4).unwrap(), b"abcd");
    }

    #[test]
    fn sized_reader_stops_at_size_and_refuses_to_run_dry() {
        let mut bytes = Vec::new();
        SizedReader::new(&b"abcdef"[..], 4).read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"abcd");

        let err = SizedReader::new(&b"abc"[..], 10)
            .read_to_end(&mut Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("got 3 of 10"));
    }
}
