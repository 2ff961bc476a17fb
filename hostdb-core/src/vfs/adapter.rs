//! The filesystem adapter installed into the engine.
//!
//! Routing rules:
//! - `open_file` and `glob` go to the host when a handler exists
//! - handle operations follow the handle: host-opened handles use their host
//!   handler (and fail with [`FsError::Unsupported`] when it is missing),
//!   native handles always use native I/O
//! - path utilities are always native

use std::sync::Arc;

use tracing::{debug, trace};

use super::host::{HostChannels, OpenRequest, ReadAtRequest, ReadRequest, TruncateRequest};
use super::native::NativeFileSystem;
use super::{FileHandle, FileLockType, FileSystem, HandleRegistry, OpenFlags, ReadChunk};
use crate::error::FsError;

/// Engine-facing filesystem that forwards to host handlers over the bridge.
pub struct VirtualFileSystem {
    channels: HostChannels,
    native: NativeFileSystem,
    registry: Arc<HandleRegistry>,
}

impl VirtualFileSystem {
    pub fn new(channels: HostChannels) -> Self {
        let registry = Arc::new(HandleRegistry::default());
        Self {
            channels,
            native: NativeFileSystem::with_registry(registry.clone()),
            registry,
        }
    }

    pub fn channels(&self) -> &HostChannels {
        &self.channels
    }

    /// Handles opened through this adapter that the engine still holds.
    pub fn open_handles(&self) -> usize {
        self.registry.open_count()
    }

    fn unsupported(operation: &'static str, handle: &FileHandle) -> FsError {
        FsError::Unsupported {
            operation,
            id: handle.id().0,
        }
    }
}

impl FileSystem for VirtualFileSystem {
    fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        lock: FileLockType,
    ) -> Result<FileHandle, FsError> {
        let Some(channel) = &self.channels.open_file else {
            return self.native.open_file(path, flags, lock);
        };
        let fd = channel.invoke(OpenRequest {
            path: path.to_string(),
            flags,
            lock,
        })?;
        debug!(path, %fd, "Host opened file for engine");
        Ok(FileHandle::host(path, fd, self.registry.clone()))
    }

    fn read(&self, handle: &FileHandle, len: usize) -> Result<ReadChunk, FsError> {
        if !handle.is_host() {
            return self.native.read(handle, len);
        }
        let channel = self
            .channels
            .read
            .as_ref()
            .ok_or_else(|| Self::unsupported("read", handle))?;
        let mut chunk = channel.invoke(ReadRequest {
            fd: handle.id(),
            length: len,
        })?;
        // Host buffers may be allocated at the requested size; only `count`
        // bytes are valid.
        chunk.count = chunk.count.min(chunk.data.len()).min(len);
        chunk.data.truncate(chunk.count);
        trace!(path = handle.path(), len, read = chunk.count, "Host sequential read");
        Ok(chunk)
    }

    fn read_at(&self, handle: &FileHandle, len: usize, offset: u64) -> Result<Vec<u8>, FsError> {
        if !handle.is_host() {
            return self.native.read_at(handle, len, offset);
        }
        let channel = self
            .channels
            .read_with_location
            .as_ref()
            .ok_or_else(|| Self::unsupported("read_with_location", handle))?;
        let mut data = channel.invoke(ReadAtRequest {
            fd: handle.id(),
            length: len,
            offset,
        })?;
        data.truncate(len);
        Ok(data)
    }

    fn file_size(&self, handle: &FileHandle) -> Result<u64, FsError> {
        if !handle.is_host() {
            return self.native.file_size(handle);
        }
        let channel = self
            .channels
            .get_file_size
            .as_ref()
            .ok_or_else(|| Self::unsupported("get_file_size", handle))?;
        Ok(channel.invoke(handle.path().to_string())?)
    }

    fn truncate(&self, handle: &FileHandle, size: u64) -> Result<(), FsError> {
        if !handle.is_host() {
            return self.native.truncate(handle, size);
        }
        let channel = self
            .channels
            .truncate
            .as_ref()
            .ok_or_else(|| Self::unsupported("truncate", handle))?;
        Ok(channel.invoke(TruncateRequest {
            fd: handle.id(),
            size,
        })?)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError> {
        match &self.channels.glob {
            Some(channel) => Ok(channel.invoke(pattern.to_string())?),
            None => self.native.glob(pattern),
        }
    }

    fn directory_exists(&self, path: &str) -> bool {
        self.native.directory_exists(path)
    }

    fn file_exists(&self, path: &str) -> bool {
        self.native.file_exists(path)
    }

    fn list_files(
        &self,
        directory: &str,
        visitor: &mut dyn FnMut(&str, bool),
    ) -> Result<bool, FsError> {
        self.native.list_files(directory, visitor)
    }

    fn path_separator(&self) -> &'static str {
        self.native.path_separator()
    }

    fn join_path(&self, base: &str, path: &str) -> String {
        self.native.join_path(base, path)
    }

    fn working_directory(&self) -> Result<String, FsError> {
        self.native.working_directory()
    }

    fn set_working_directory(&self, path: &str) -> Result<(), FsError> {
        self.native.set_working_directory(path)
    }
}
