//! Virtual Filesystem - Engine Storage I/O Routed Through The Host Loop
//!
//! The engine performs file I/O through the [`FileSystem`] trait. Two
//! implementations ship with the crate:
//! - [`NativeFileSystem`]: plain `std::fs`, used when no host handlers exist
//! - [`VirtualFileSystem`]: the adapter, which sends `open`, `read`,
//!   `read_at`, `file_size`, `truncate` and `glob` through bridge calls to host
//!   handlers when they are configured and falls back to native I/O otherwise
//!
//! Path utilities (`directory_exists`, `file_exists`, `list_files`,
//! `path_separator`, `join_path`, working directory) are never bridged.

mod adapter;
mod host;
mod native;

pub use adapter::VirtualFileSystem;
pub use host::{
    FileSystemHandlers, HostChannels, HostFileSystem, OpenRequest, ReadAtRequest, ReadRequest,
    StdHostFileSystem, TruncateRequest,
};
pub use native::{glob_match, NativeFileSystem};

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::FsError;

/// Identity of an open file. Host handlers choose it for host-opened files;
/// the adapter assigns it for native ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File open mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(1 << 0);
    pub const WRITE: OpenFlags = OpenFlags(1 << 1);
    pub const CREATE: OpenFlags = OpenFlags(1 << 2);
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 3);
    pub const APPEND: OpenFlags = OpenFlags(1 << 4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Lock requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileLockType {
    #[default]
    NoLock,
    ReadLock,
    WriteLock,
}

/// Output of a sequential read: the bytes and how many of them are valid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    pub count: usize,
}

impl ReadChunk {
    pub fn new(data: Vec<u8>) -> Self {
        let count = data.len();
        Self { data, count }
    }
}

/// Bookkeeping shared by every handle a filesystem hands out.
#[derive(Debug, Default)]
pub(crate) struct HandleRegistry {
    next_native_id: AtomicU64,
    open: AtomicUsize,
}

impl HandleRegistry {
    fn next_native_id(&self) -> FileId {
        FileId(self.next_native_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn opened(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    fn closed(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

pub(crate) enum HandleOrigin {
    /// Opened by a host handler; `FileId` is the host's descriptor.
    Host,
    /// Opened natively by the adapter.
    Native(std::fs::File),
}

/// An open file owned by the engine for as long as it needs it.
///
/// Dropping the handle is the adapter's native cleanup path: native files
/// are closed and the handle leaves the adapter's registry. Host descriptors
/// are never closed through the bridge.
pub struct FileHandle {
    path: String,
    id: FileId,
    pub(crate) origin: HandleOrigin,
    registry: Arc<HandleRegistry>,
}

impl FileHandle {
    pub(crate) fn host(path: &str, id: FileId, registry: Arc<HandleRegistry>) -> Self {
        registry.opened();
        Self {
            path: path.to_string(),
            id,
            origin: HandleOrigin::Host,
            registry,
        }
    }

    pub(crate) fn native(path: &str, file: std::fs::File, registry: Arc<HandleRegistry>) -> Self {
        registry.opened();
        Self {
            path: path.to_string(),
            id: registry.next_native_id(),
            origin: HandleOrigin::Native(file),
            registry,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    /// Returns `true` if a host handler opened this file.
    pub fn is_host(&self) -> bool {
        matches!(self.origin, HandleOrigin::Host)
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("host", &self.is_host())
            .finish()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        trace!(path = %self.path, id = %self.id, host = self.is_host(), "Closing file handle");
        self.registry.closed();
    }
}

/// The storage capability set the engine consumes.
///
/// Calls against one handle are serialized by the caller. Implementations
/// only promise that each call completes before it returns.
pub trait FileSystem: Send + Sync {
    fn open_file(&self, path: &str, flags: OpenFlags, lock: FileLockType)
        -> Result<FileHandle, FsError>;

    /// Read up to `len` bytes at the handle's sequential cursor, advancing it.
    fn read(&self, handle: &FileHandle, len: usize) -> Result<ReadChunk, FsError>;

    /// Read up to `len` bytes at `offset` without moving the sequential cursor.
    fn read_at(&self, handle: &FileHandle, len: usize, offset: u64) -> Result<Vec<u8>, FsError>;

    fn file_size(&self, handle: &FileHandle) -> Result<u64, FsError>;

    fn truncate(&self, handle: &FileHandle, size: u64) -> Result<(), FsError>;

    /// Expand `pattern` to matching paths. No match is an empty list.
    fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError>;

    fn directory_exists(&self, path: &str) -> bool;

    fn file_exists(&self, path: &str) -> bool;

    /// Call `visitor(name, is_dir)` for each entry of `directory`.
    /// Returns `false` if the directory does not exist.
    fn list_files(
        &self,
        directory: &str,
        visitor: &mut dyn FnMut(&str, bool),
    ) -> Result<bool, FsError>;

    fn path_separator(&self) -> &'static str;

    fn join_path(&self, base: &str, path: &str) -> String;

    fn working_directory(&self) -> Result<String, FsError>;

    fn set_working_directory(&self, path: &str) -> Result<(), FsError>;
}
