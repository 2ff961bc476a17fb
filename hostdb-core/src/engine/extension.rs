//! Engine Extensions
//!
//! Extensions are named bundles of SQL functions loaded into the engine while
//! a database initializes. SQLite functions live on a connection, so the
//! engine re-applies every loaded extension to each connection it opens.
//!
//! The built-in [`FileFunctions`] extension reads through the engine's
//! installed [`FileSystem`], which is how queries reach host file handlers:
//!
//! | Function            | Result                                  |
//! |---------------------|-----------------------------------------|
//! | `read_text(path)`   | file contents as UTF-8 text             |
//! | `read_blob(path)`   | file contents as a blob                 |
//! | `file_size(path)`   | size in bytes                           |
//! | `glob_count(pat)`   | number of paths matching the pattern    |

use std::collections::HashMap;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::sync::Arc;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{EngineError, FsError};
use crate::vfs::{FileLockType, FileSystem, OpenFlags};

/// Largest single read issued while loading a whole file.
const READ_CHUNK: usize = 64 * 1024;

/// A named set of SQL functions.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Register the extension's functions on `conn`.
    fn register(&self, conn: &Connection, fs: &SharedFs) -> Result<(), EngineError>;
}

/// The engine's filesystem, shareable with SQL function closures.
#[derive(Clone)]
pub struct SharedFs(Arc<dyn FileSystem>);

// Function closures must be unwind safe. The filesystem keeps no state that a
// panic inside a SQL function could leave half-updated.
impl UnwindSafe for SharedFs {}
impl RefUnwindSafe for SharedFs {}

impl SharedFs {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self(fs)
    }

    pub fn get(&self) -> &dyn FileSystem {
        &*self.0
    }

    /// Read a whole file through sequential reads.
    pub fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let fs = self.get();
        let handle = fs.open_file(path, OpenFlags::READ, FileLockType::ReadLock)?;
        let size = fs.file_size(&handle)?;
        let mut data = Vec::with_capacity(size as usize);
        loop {
            let chunk = fs.read(&handle, READ_CHUNK)?;
            if chunk.count == 0 {
                break;
            }
            data.extend_from_slice(&chunk.data[..chunk.count]);
        }
        Ok(data)
    }

    pub fn size_of(&self, path: &str) -> Result<u64, FsError> {
        let fs = self.get();
        let handle = fs.open_file(path, OpenFlags::READ, FileLockType::NoLock)?;
        fs.file_size(&handle)
    }
}

fn user_error(err: FsError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

fn path_arg(ctx: &Context<'_>) -> rusqlite::Result<String> {
    ctx.get::<String>(0)
}

/// Built-in file access functions.
#[derive(Debug, Default)]
pub struct FileFunctions;

impl Extension for FileFunctions {
    fn name(&self) -> &str {
        "file_functions"
    }

    fn register(&self, conn: &Connection, fs: &SharedFs) -> Result<(), EngineError> {
        let flags = FunctionFlags::SQLITE_UTF8;

        let files = fs.clone();
        conn.create_scalar_function("read_text", 1, flags, move |ctx| {
            let path = path_arg(ctx)?;
            let bytes = files.read_all(&path).map_err(user_error)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })?;

        let files = fs.clone();
        conn.create_scalar_function("read_blob", 1, flags, move |ctx| {
            let path = path_arg(ctx)?;
            files.read_all(&path).map_err(user_error)
        })?;

        let files = fs.clone();
        conn.create_scalar_function("file_size", 1, flags, move |ctx| {
            let path = path_arg(ctx)?;
            let size = files.size_of(&path).map_err(user_error)?;
            Ok(size as i64)
        })?;

        let files = fs.clone();
        conn.create_scalar_function("glob_count", 1, flags, move |ctx| {
            let pattern = path_arg(ctx)?;
            let hits = files.get().glob(&pattern).map_err(user_error)?;
            Ok(hits.len() as i64)
        })?;

        Ok(())
    }
}

/// Extensions a database loads during initialization, in registration order.
#[derive(Clone)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn Extension>>,
    index: HashMap<String, usize>,
}

impl ExtensionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// A registry holding the built-in extensions.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileFunctions));
        registry
    }

    /// Add `extension`. A second extension with the same name is skipped.
    pub fn register(&mut self, extension: Arc<dyn Extension>) -> bool {
        let name = extension.name().to_string();
        if self.index.contains_key(&name) {
            warn!(extension = %name, "Extension already registered, skipping");
            return false;
        }
        debug!(extension = %name, "Registering extension");
        self.index.insert(name, self.extensions.len());
        self.extensions.push(extension);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.index.get(name).map(|&i| self.extensions[i].clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.extensions.iter()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Apply `extension` to `conn`, naming it in any failure.
pub(crate) fn load_into(
    conn: &Connection,
    extension: &dyn Extension,
    fs: &SharedFs,
) -> Result<(), EngineError> {
    extension.register(conn, fs).map_err(|e| match e {
        EngineError::Extension { .. } => e,
        other => EngineError::Extension {
            name: extension.name().to_string(),
            reason: other.to_string(),
        },
    })?;
    info!(extension = extension.name(), "Extension loaded");
    Ok(())
}
