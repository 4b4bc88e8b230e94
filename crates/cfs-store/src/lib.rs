#![forbid(unsafe_code)]
//! Backing stores for compactfs images.
//!
//! Provides the `BackingStore` trait, the narrow positioned-read contract
//! the region reader is written against, and three implementations: an
//! in-memory blob, a file read with `pread` semantics, and a generic
//! seek+read handle serialized behind a lock.

use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Byte-addressed, read-only source of image bytes.
///
/// Implementations must be safe to call concurrently: either the read is
/// positioned (no shared cursor) or the implementation serializes access to
/// its cursor internally.
pub trait BackingStore: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which may be less than requested.
    /// `Ok(0)` means no more data is available at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl<S: BackingStore + ?Sized> BackingStore for Box<S> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

impl<S: BackingStore + ?Sized> BackingStore for Arc<S> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

// ── In-memory blob ──────────────────────────────────────────────────────────

/// An image held entirely in memory. Reads are a single bulk copy.
#[derive(Clone)]
pub struct MemoryStore {
    bytes: Arc<[u8]>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl BackingStore for MemoryStore {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        let Some(available) = self.bytes.get(start..) else {
            return Ok(0);
        };
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

// ── File-backed store ───────────────────────────────────────────────────────

/// File-backed store using `pread`-style positioned reads.
///
/// `FileExt::read_at` does not touch the file's seek position, so concurrent
/// readers need no synchronization.
#[derive(Debug, Clone)]
pub struct FileStore {
    file: Arc<File>,
    len: u64,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let store = Self::from_file(file)?;
        debug!(path = %path.as_ref().display(), len = store.len, "opened file store");
        Ok(store)
    }

    pub fn from_file(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl BackingStore for FileStore {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read_at(buf, offset) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

// ── Streamed store ──────────────────────────────────────────────────────────

/// A sequential seek+read handle shared behind a lock.
///
/// Each `read_at` holds the lock across the seek and the read, so the
/// cursor is never observed half-moved by another thread.
pub struct StreamStore<R> {
    inner: Mutex<R>,
    len: u64,
}

impl<R: Read + Seek> StreamStore<R> {
    /// Wrap `inner`, measuring its length by seeking to the end.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner: Mutex::new(inner),
            len,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R> fmt::Debug for StreamStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStore").field("len", &self.len).finish()
    }
}

impl<R: Read + Seek + Send> BackingStore for StreamStore<R> {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.seek(SeekFrom::Start(offset))?;
        loop {
            match inner.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn sample() -> Vec<u8> {
        (0_u8..=63).collect()
    }

    #[test]
    fn memory_store_reads_and_clamps() {
        let store = MemoryStore::new(sample());
        assert_eq!(store.len_bytes(), 64);

        let mut buf = [0_u8; 4];
        assert_eq!(store.read_at(10, &mut buf).unwrap(), 4);
        assert_eq!(buf, [10, 11, 12, 13]);

        let mut tail = [0_u8; 8];
        assert_eq!(store.read_at(60, &mut tail).unwrap(), 4);
        assert_eq!(&tail[..4], &[60, 61, 62, 63]);

        assert_eq!(store.read_at(64, &mut buf).unwrap(), 0);
        assert_eq!(store.read_at(u64::MAX, &mut buf).unwrap(), 0);
    }

    #[test]
    fn file_store_reads_positioned() {
        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(&sample()).expect("write");
        let store = FileStore::from_file(file).expect("store");
        assert_eq!(store.len_bytes(), 64);

        let mut buf = [0_u8; 3];
        assert_eq!(store.read_at(32, &mut buf).unwrap(), 3);
        assert_eq!(buf, [32, 33, 34]);
        // Positioned reads do not depend on call order.
        assert_eq!(store.read_at(1, &mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(store.read_at(64, &mut buf).unwrap(), 0);
    }

    #[test]
    fn file_store_open_by_path() {
        let mut named = tempfile::NamedTempFile::new().expect("tempfile");
        named.write_all(&sample()).expect("write");
        let store = FileStore::open(named.path()).expect("open");
        assert_eq!(store.len_bytes(), 64);
    }

    #[test]
    fn stream_store_seeks_per_read() {
        let store = StreamStore::new(Cursor::new(sample())).expect("store");
        assert_eq!(store.len_bytes(), 64);

        let mut buf = [0_u8; 2];
        assert_eq!(store.read_at(40, &mut buf).unwrap(), 2);
        assert_eq!(buf, [40, 41]);
        assert_eq!(store.read_at(5, &mut buf).unwrap(), 2);
        assert_eq!(buf, [5, 6]);
        assert_eq!(store.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn stores_are_usable_as_trait_objects() {
        let stores: Vec<Box<dyn BackingStore>> = vec![
            Box::new(MemoryStore::new(sample())),
            Box::new(StreamStore::new(Cursor::new(sample())).expect("stream")),
        ];
        for store in &stores {
            let mut buf = [0_u8; 1];
            assert_eq!(store.read_at(7, &mut buf).unwrap(), 1);
            assert_eq!(buf[0], 7);
        }
    }
}
