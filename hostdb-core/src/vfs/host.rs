//! Host-side filesystem handlers and the channels that carry them.
//!
//! Handlers run on the host loop. Each one receives its request plus a
//! [`Completion`] and must signal it exactly once, either right away or later
//! from a local task.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::rc::Rc;

use tracing::{debug, info};

use super::native::{native_glob, pread, read_up_to};
use super::{FileId, FileLockType, OpenFlags, ReadChunk};
use crate::bridge::{CallbackChannel, ChannelBuilder, ChannelOptions, Completion};
use crate::host::HostLoop;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub path: String,
    pub flags: OpenFlags,
    pub lock: FileLockType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub fd: FileId,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAtRequest {
    pub fd: FileId,
    pub length: usize,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateRequest {
    pub fd: FileId,
    pub size: u64,
}

type Handler<A, R> = Box<dyn FnMut(A, Completion<R>)>;

/// The optional host handler set. Operations left unset fall back to native
/// I/O inside the adapter.
#[derive(Default)]
pub struct FileSystemHandlers {
    open_file: Option<Handler<OpenRequest, FileId>>,
    read: Option<Handler<ReadRequest, ReadChunk>>,
    read_with_location: Option<Handler<ReadAtRequest, Vec<u8>>>,
    get_file_size: Option<Handler<String, u64>>,
    glob: Option<Handler<String, Vec<String>>>,
    truncate: Option<Handler<TruncateRequest, ()>>,
    options: ChannelOptions,
}

impl FileSystemHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every operation to one [`HostFileSystem`] implementation.
    pub fn from_host<T: HostFileSystem>(host_fs: T) -> Self {
        let shared = Rc::new(RefCell::new(host_fs));
        let fs = shared.clone();
        let mut handlers = Self::new().open_file(move |req, done| fs.borrow_mut().open_file(req, done));
        let fs = shared.clone();
        handlers = handlers.read(move |req, done| fs.borrow_mut().read(req, done));
        let fs = shared.clone();
        handlers = handlers
            .read_with_location(move |req, done| fs.borrow_mut().read_with_location(req, done));
        let fs = shared.clone();
        handlers = handlers.get_file_size(move |path, done| fs.borrow_mut().get_file_size(path, done));
        let fs = shared.clone();
        handlers = handlers.glob(move |pattern, done| fs.borrow_mut().glob(pattern, done));
        let fs = shared;
        handlers.truncate(move |req, done| fs.borrow_mut().truncate(req, done))
    }

    pub fn open_file(mut self, f: impl FnMut(OpenRequest, Completion<FileId>) + 'static) -> Self {
        self.open_file = Some(Box::new(f));
        self
    }

    pub fn read(mut self, f: impl FnMut(ReadRequest, Completion<ReadChunk>) + 'static) -> Self {
        self.read = Some(Box::new(f));
        self
    }

    pub fn read_with_location(
        mut self,
        f: impl FnMut(ReadAtRequest, Completion<Vec<u8>>) + 'static,
    ) -> Self {
        self.read_with_location = Some(Box::new(f));
        self
    }

    pub fn get_file_size(mut self, f: impl FnMut(String, Completion<u64>) + 'static) -> Self {
        self.get_file_size = Some(Box::new(f));
        self
    }

    pub fn glob(mut self, f: impl FnMut(String, Completion<Vec<String>>) + 'static) -> Self {
        self.glob = Some(Box::new(f));
        self
    }

    pub fn truncate(mut self, f: impl FnMut(TruncateRequest, Completion<()>) + 'static) -> Self {
        self.truncate = Some(Box::new(f));
        self
    }

    /// Queue capacity and call timeout applied to every channel.
    pub fn channel_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.open_file.is_none()
            && self.read.is_none()
            && self.read_with_location.is_none()
            && self.get_file_size.is_none()
            && self.glob.is_none()
            && self.truncate.is_none()
    }

    /// Create one channel per configured handler on `host`.
    pub fn bind(self, host: &HostLoop) -> HostChannels {
        let options = self.options;
        fn bind_one<A: Send + 'static, R: Send + 'static>(
            host: &HostLoop,
            name: &str,
            options: ChannelOptions,
            handler: Option<Handler<A, R>>,
        ) -> Option<CallbackChannel<A, R>> {
            handler.map(|h| {
                ChannelBuilder::new(format!("fs.{name}"))
                    .options(options)
                    .build(host, h)
            })
        }

        let channels = HostChannels {
            read_with_location: bind_one(host, "read_with_location", options, self.read_with_location),
            read: bind_one(host, "read", options, self.read),
            glob: bind_one(host, "glob", options, self.glob),
            get_file_size: bind_one(host, "get_file_size", options, self.get_file_size),
            open_file: bind_one(host, "open_file", options, self.open_file),
            truncate: bind_one(host, "truncate", options, self.truncate),
        };
        info!(handlers = ?channels.configured(), "Bound host filesystem handlers");
        channels
    }
}

/// The channel set bound to a filesystem adapter.
#[derive(Clone, Default)]
pub struct HostChannels {
    pub(crate) read_with_location: Option<CallbackChannel<ReadAtRequest, Vec<u8>>>,
    pub(crate) read: Option<CallbackChannel<ReadRequest, ReadChunk>>,
    pub(crate) glob: Option<CallbackChannel<String, Vec<String>>>,
    pub(crate) get_file_size: Option<CallbackChannel<String, u64>>,
    pub(crate) open_file: Option<CallbackChannel<OpenRequest, FileId>>,
    pub(crate) truncate: Option<CallbackChannel<TruncateRequest, ()>>,
}

impl HostChannels {
    /// Names of the channels that have a handler, in release order.
    pub fn configured(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if let Some(c) = &self.read_with_location {
            names.push(c.name());
        }
        if let Some(c) = &self.read {
            names.push(c.name());
        }
        if let Some(c) = &self.glob {
            names.push(c.name());
        }
        if let Some(c) = &self.get_file_size {
            names.push(c.name());
        }
        if let Some(c) = &self.open_file {
            names.push(c.name());
        }
        if let Some(c) = &self.truncate {
            names.push(c.name());
        }
        names
    }

    /// Release every channel in a fixed order. Safe to call repeatedly.
    pub fn release_all(&self) {
        if let Some(c) = &self.read_with_location {
            c.release();
        }
        if let Some(c) = &self.read {
            c.release();
        }
        if let Some(c) = &self.glob {
            c.release();
        }
        if let Some(c) = &self.get_file_size {
            c.release();
        }
        if let Some(c) = &self.open_file {
            c.release();
        }
        if let Some(c) = &self.truncate {
            c.release();
        }
    }

    /// Returns `true` when every configured channel has been released.
    pub fn all_released(&self) -> bool {
        self.read_with_location.as_ref().map_or(true, |c| c.is_released())
            && self.read.as_ref().map_or(true, |c| c.is_released())
            && self.glob.as_ref().map_or(true, |c| c.is_released())
            && self.get_file_size.as_ref().map_or(true, |c| c.is_released())
            && self.open_file.as_ref().map_or(true, |c| c.is_released())
            && self.truncate.as_ref().map_or(true, |c| c.is_released())
    }
}

/// A complete host-side filesystem, for hosts that implement every handler
/// in one place. See [`FileSystemHandlers::from_host`].
pub trait HostFileSystem: 'static {
    fn open_file(&mut self, request: OpenRequest, done: Completion<FileId>);

    /// Read at the descriptor's own cursor and advance it.
    fn read(&mut self, request: ReadRequest, done: Completion<ReadChunk>);

    /// Read at an explicit offset without touching the cursor.
    fn read_with_location(&mut self, request: ReadAtRequest, done: Completion<Vec<u8>>);

    fn get_file_size(&mut self, path: String, done: Completion<u64>);

    fn glob(&mut self, pattern: String, done: Completion<Vec<String>>);

    fn truncate(&mut self, request: TruncateRequest, done: Completion<()>);
}

/// Host filesystem backed by `std::fs`, running every call on the host loop.
///
/// Descriptors it hands out stay open until the value is dropped, which
/// happens once the adapter's channels are released and drained.
#[derive(Debug, Default)]
pub struct StdHostFileSystem {
    files: HashMap<FileId, File>,
    next_fd: u64,
}

impl StdHostFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }
}

impl HostFileSystem for StdHostFileSystem {
    fn open_file(&mut self, request: OpenRequest, done: Completion<FileId>) {
        let write = request.flags.contains(OpenFlags::WRITE);
        let opened = OpenOptions::new()
            .read(true)
            .write(write)
            .create(write && request.flags.contains(OpenFlags::CREATE))
            .open(&request.path);
        match opened {
            Ok(file) => {
                self.next_fd += 1;
                let fd = FileId(self.next_fd);
                self.files.insert(fd, file);
                debug!(path = %request.path, %fd, "Host opened file");
                done.complete(fd);
            }
            Err(e) => done.fail(format!("{}: {e}", request.path)),
        }
    }

    fn read(&mut self, request: ReadRequest, done: Completion<ReadChunk>) {
        let Some(file) = self.files.get(&request.fd) else {
            return done.fail(format!("bad descriptor {}", request.fd));
        };
        match read_up_to(file, request.length) {
            Ok(data) => done.complete(ReadChunk::new(data)),
            Err(e) => done.fail(e.to_string()),
        }
    }

    fn read_with_location(&mut self, request: ReadAtRequest, done: Completion<Vec<u8>>) {
        let Some(file) = self.files.get(&request.fd) else {
            return done.fail(format!("bad descriptor {}", request.fd));
        };
        match pread(file, request.length, request.offset) {
            Ok(data) => done.complete(data),
            Err(e) => done.fail(e.to_string()),
        }
    }

    fn get_file_size(&mut self, path: String, done: Completion<u64>) {
        match std::fs::metadata(&path) {
            Ok(meta) => done.complete(meta.len()),
            Err(e) => done.fail(format!("{path}: {e}")),
        }
    }

    fn glob(&mut self, pattern: String, done: Completion<Vec<String>>) {
        done.complete(native_glob(&pattern));
    }

    fn truncate(&mut self, request: TruncateRequest, done: Completion<()>) {
        let Some(file) = self.files.get(&request.fd) else {
            return done.fail(format!("bad descriptor {}", request.fd));
        };
        match file.set_len(request.size) {
            Ok(()) => done.complete(()),
            Err(e) => done.fail(e.to_string()),
        }
    }
}
