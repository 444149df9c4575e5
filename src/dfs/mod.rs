//! Filesystem façade over the distributed filesystem.
//!
//! Every component that touches storage goes through the [`Dfs`] trait
//! rather than `std::fs`, so the same engine code runs against the remote
//! DFS, the local OS, or a cache layer stacked in between
//! ([`CachedDfs`](crate::pbc::CachedDfs), [`MirrorDfs`](crate::mirror::MirrorDfs)).
//!
//! ## Design Overview
//!
//! Three file traits, one per access pattern:
//!
//! - [`SequentialFile`] — forward-only reads (WAL replay, MANIFEST replay).
//! - [`RandomAccessFile`] — positioned reads of immutable files (SSTables).
//! - [`WritableFile`] — append-only writes (WAL, MANIFEST, table builds).
//!
//! [`LocalDfs`] implements the façade over the local OS. Random-access files
//! are memory-mapped with an explicit length; the mapping is immutable for
//! the life of the handle, which is exactly the SSTable contract.
//!
//! ## Path model
//!
//! All paths are **relative, `/`-separated** strings resolved against the
//! implementation's root. Engine directories embed
//! `table/tablet/lg/<file_number>.sst`, and inherited files keep their
//! parent-tablet paths, so path strings are stable identities across
//! load/unload/split.
//!
//! ## Error model
//!
//! [`DfsError`] separates `NotFound` and `PermissionDenied` from generic
//! I/O: permission failures are terminal for an engine (it force-unloads),
//! while other I/O errors are retried with backoff.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by façade operations.
#[derive(Debug, Error)]
pub enum DfsError {
    /// The named file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Non-retriable storage failure. Engines treat this as terminal.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other underlying I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path the operation targeted.
        path: String,
        /// Underlying error.
        source: io::Error,
    },
}

impl DfsError {
    /// Classify an `io::Error` for `path` into the façade taxonomy.
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Io {
                path: path.to_string(),
                source: err,
            },
        }
    }

    /// True when the failure is terminal for the owning engine.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// True when the failure is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// ------------------------------------------------------------------------------------------------
// File traits
// ------------------------------------------------------------------------------------------------

/// Forward-only file reads.
pub trait SequentialFile: Read + Send + std::fmt::Debug {}

/// Positioned reads of an immutable file.
///
/// Implementations must be safe to share across threads; SSTable readers
/// hold one handle per open table and read concurrently.
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the bytes read,
    /// which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DfsError>;

    /// Total file length in bytes.
    fn len(&self) -> u64;

    /// True when the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only file writes.
pub trait WritableFile: Send {
    /// Append `data` at the current end of file.
    fn append(&mut self, data: &[u8]) -> Result<(), DfsError>;

    /// Push buffered bytes to the OS.
    fn flush(&mut self) -> Result<(), DfsError>;

    /// Write through to stable storage.
    fn sync(&mut self) -> Result<(), DfsError>;
}

// ------------------------------------------------------------------------------------------------
// The façade
// ------------------------------------------------------------------------------------------------

/// Filesystem operations used by engines, caches, and the tablet server.
///
/// Object-safe so cache layers can wrap any inner implementation.
pub trait Dfs: Send + Sync {
    /// Open `path` for sequential reading.
    fn open_sequential(&self, path: &str) -> Result<Box<dyn SequentialFile>, DfsError>;

    /// Open `path` for positioned reads.
    ///
    /// `size` is the caller's knowledge of the file length (the table cache
    /// carries it in file metadata); `None` makes the implementation look
    /// the length up, which costs an extra round trip on a remote DFS.
    fn open_random(
        &self,
        path: &str,
        size: Option<u64>,
    ) -> Result<Arc<dyn RandomAccessFile>, DfsError>;

    /// Create (or truncate) `path` for appending.
    fn create(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError>;

    /// Open an existing `path` for appending, creating it if absent.
    fn open_append(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError>;

    /// Atomically rename `from` to `to`.
    fn rename(&self, from: &str, to: &str) -> Result<(), DfsError>;

    /// Delete a file.
    fn delete(&self, path: &str) -> Result<(), DfsError>;

    /// True when `path` names an existing file or directory.
    fn exists(&self, path: &str) -> bool;

    /// List the entry names (not full paths) of directory `dir`.
    fn list(&self, dir: &str) -> Result<Vec<String>, DfsError>;

    /// Length of the file at `path`.
    fn file_size(&self, path: &str) -> Result<u64, DfsError>;

    /// Create `dir` and any missing parents.
    fn create_dir_all(&self, dir: &str) -> Result<(), DfsError>;

    /// Recursively delete directory `dir`.
    fn delete_dir(&self, dir: &str) -> Result<(), DfsError>;

    /// Fsync the directory entry itself, making renames/creates durable.
    fn sync_dir(&self, dir: &str) -> Result<(), DfsError>;
}

// ------------------------------------------------------------------------------------------------
// Local implementation
// ------------------------------------------------------------------------------------------------

/// [`Dfs`] over the local OS, rooted at a base directory.
///
/// Doubles as the "local fallback" of the remote DFS and as the backing
/// store for SSD cache layers.
#[derive(Debug, Clone)]
pub struct LocalDfs {
    root: PathBuf,
}

impl LocalDfs {
    /// Create a façade rooted at `root`. The directory is created if absent.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, DfsError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| DfsError::from_io(&root.to_string_lossy(), e))?;
        debug!(root = %root.display(), "local dfs mounted");
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Dfs for LocalDfs {
    fn open_sequential(&self, path: &str) -> Result<Box<dyn SequentialFile>, DfsError> {
        let file = File::open(self.resolve(path)).map_err(|e| DfsError::from_io(path, e))?;
        Ok(Box::new(LocalSequentialFile { file }))
    }

    fn open_random(
        &self,
        path: &str,
        size: Option<u64>,
    ) -> Result<Arc<dyn RandomAccessFile>, DfsError> {
        let full = self.resolve(path);
        let file = File::open(&full).map_err(|e| DfsError::from_io(path, e))?;
        let len = match size {
            Some(len) => len,
            None => file
                .metadata()
                .map_err(|e| DfsError::from_io(path, e))?
                .len(),
        };

        // Mapping an empty file is rejected by the OS; serve it from a
        // zero-length buffer instead.
        if len == 0 {
            return Ok(Arc::new(EmptyRandomFile));
        }

        // Table files are immutable once written and never truncated while
        // open, so the mapping stays valid for the life of the handle.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DfsError::from_io(path, e))?;
        trace!(path, len, "random-access file mapped");
        Ok(Arc::new(LocalRandomFile { mmap, len }))
    }

    fn create(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        if let Some(parent) = self.resolve(path).parent() {
            fs::create_dir_all(parent).map_err(|e| DfsError::from_io(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.resolve(path))
            .map_err(|e| DfsError::from_io(path, e))?;
        Ok(Box::new(LocalWritableFile {
            file,
            path: path.to_string(),
        }))
    }

    fn open_append(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        if let Some(parent) = self.resolve(path).parent() {
            fs::create_dir_all(parent).map_err(|e| DfsError::from_io(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(path))
            .map_err(|e| DfsError::from_io(path, e))?;
        Ok(Box::new(LocalWritableFile {
            file,
            path: path.to_string(),
        }))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), DfsError> {
        fs::rename(self.resolve(from), self.resolve(to))
            .map_err(|e| DfsError::from_io(from, e))
    }

    fn delete(&self, path: &str) -> Result<(), DfsError> {
        fs::remove_file(self.resolve(path)).map_err(|e| DfsError::from_io(path, e))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, DfsError> {
        let mut names = Vec::new();
        let entries = fs::read_dir(self.resolve(dir)).map_err(|e| DfsError::from_io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DfsError::from_io(dir, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, path: &str) -> Result<u64, DfsError> {
        let meta = fs::metadata(self.resolve(path)).map_err(|e| DfsError::from_io(path, e))?;
        Ok(meta.len())
    }

    fn create_dir_all(&self, dir: &str) -> Result<(), DfsError> {
        fs::create_dir_all(self.resolve(dir)).map_err(|e| DfsError::from_io(dir, e))
    }

    fn delete_dir(&self, dir: &str) -> Result<(), DfsError> {
        fs::remove_dir_all(self.resolve(dir)).map_err(|e| DfsError::from_io(dir, e))
    }

    fn sync_dir(&self, dir: &str) -> Result<(), DfsError> {
        let file = File::open(self.resolve(dir)).map_err(|e| DfsError::from_io(dir, e))?;
        file.sync_all().map_err(|e| DfsError::from_io(dir, e))
    }
}

// ------------------------------------------------------------------------------------------------
// Local file handles
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct LocalSequentialFile {
    file: File,
}

impl Read for LocalSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl SequentialFile for LocalSequentialFile {}

struct LocalRandomFile {
    mmap: Mmap,
    len: u64,
}

impl RandomAccessFile for LocalRandomFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DfsError> {
        if offset >= self.len {
            return Ok(0);
        }
        let start = offset as usize;
        let end = (offset + buf.len() as u64).min(self.len) as usize;
        let n = end - start;
        buf[..n].copy_from_slice(&self.mmap[start..end]);
        Ok(n)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

struct EmptyRandomFile;

impl RandomAccessFile for EmptyRandomFile {
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, DfsError> {
        Ok(0)
    }

    fn len(&self) -> u64 {
        0
    }
}

struct LocalWritableFile {
    file: File,
    path: String,
}

impl WritableFile for LocalWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<(), DfsError> {
        self.file
            .write_all(data)
            .map_err(|e| DfsError::from_io(&self.path, e))
    }

    fn flush(&mut self) -> Result<(), DfsError> {
        self.file
            .flush()
            .map_err(|e| DfsError::from_io(&self.path, e))
    }

    fn sync(&mut self) -> Result<(), DfsError> {
        self.file
            .sync_all()
            .map_err(|e| DfsError::from_io(&self.path, e))
    }
}

// ------------------------------------------------------------------------------------------------
// Remote-read throttling
// ------------------------------------------------------------------------------------------------

/// Counting limiter for concurrent remote reads.
///
/// Sized below the server's read pool: even with every permit held by a
/// remote read, local (cache-hit) reads still find free workers.
pub struct ReadLimiter {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl ReadLimiter {
    /// A limiter handing out at most `permits` concurrent permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            cv: Condvar::new(),
        }
    }

    /// Take one permit, blocking while none is free.
    pub fn acquire(&self) -> ReadPermit<'_> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
        ReadPermit { limiter: self }
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.lock().map(|p| *p).unwrap_or(0)
    }
}

/// RAII permit returned by [`ReadLimiter::acquire`].
pub struct ReadPermit<'a> {
    limiter: &'a ReadLimiter,
}

impl Drop for ReadPermit<'_> {
    fn drop(&mut self) {
        let mut permits = self
            .limiter
            .permits
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.limiter.cv.notify_one();
    }
}

/// A [`Dfs`] gating positioned reads behind a [`ReadLimiter`].
///
/// Stacked directly over the remote filesystem, **below** the cache
/// layers: memtable hits, in-memory block-cache hits, and SSD cache hits
/// never reach this layer, so only true remote reads spend permits.
/// Sequential reads (WAL and MANIFEST replay during recovery) pass
/// unthrottled.
pub struct ThrottledDfs {
    inner: Arc<dyn Dfs>,
    limiter: Arc<ReadLimiter>,
}

impl ThrottledDfs {
    /// Stack the limiter over `inner` with `permits` concurrent reads.
    pub fn new(inner: Arc<dyn Dfs>, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            limiter: Arc::new(ReadLimiter::new(permits)),
        })
    }

    /// The limiter behind this mount.
    pub fn limiter(&self) -> &Arc<ReadLimiter> {
        &self.limiter
    }
}

impl Dfs for ThrottledDfs {
    fn open_sequential(&self, path: &str) -> Result<Box<dyn SequentialFile>, DfsError> {
        self.inner.open_sequential(path)
    }

    fn open_random(
        &self,
        path: &str,
        size: Option<u64>,
    ) -> Result<Arc<dyn RandomAccessFile>, DfsError> {
        let file = self.inner.open_random(path, size)?;
        Ok(Arc::new(ThrottledRandomFile {
            inner: file,
            limiter: Arc::clone(&self.limiter),
        }))
    }

    fn create(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        self.inner.create(path)
    }

    fn open_append(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        self.inner.open_append(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), DfsError> {
        self.inner.rename(from, to)
    }

    fn delete(&self, path: &str) -> Result<(), DfsError> {
        self.inner.delete(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, DfsError> {
        self.inner.list(dir)
    }

    fn file_size(&self, path: &str) -> Result<u64, DfsError> {
        self.inner.file_size(path)
    }

    fn create_dir_all(&self, dir: &str) -> Result<(), DfsError> {
        self.inner.create_dir_all(dir)
    }

    fn delete_dir(&self, dir: &str) -> Result<(), DfsError> {
        self.inner.delete_dir(dir)
    }

    fn sync_dir(&self, dir: &str) -> Result<(), DfsError> {
        self.inner.sync_dir(dir)
    }
}

struct ThrottledRandomFile {
    inner: Arc<dyn RandomAccessFile>,
    limiter: Arc<ReadLimiter>,
}

impl RandomAccessFile for ThrottledRandomFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DfsError> {
        let _permit = self.limiter.acquire();
        self.inner.read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

// ------------------------------------------------------------------------------------------------
// Path helpers shared by engine and caches
// ------------------------------------------------------------------------------------------------

/// Join path segments with `/`, skipping empty segments.
pub fn join_path(segments: &[&str]) -> String {
    let mut out = String::new();
    for seg in segments {
        if seg.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(seg);
    }
    out
}

/// The parent directory of a `/`-separated path, or `""` at the top.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// The final component of a `/`-separated path.
pub fn basename_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
