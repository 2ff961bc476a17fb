//! Native `std::fs` implementation of the engine's storage capability set.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use std::sync::Arc;

use tracing::{debug, trace};

use super::{
    FileHandle, FileLockType, FileSystem, HandleOrigin, HandleRegistry, OpenFlags, ReadChunk,
};
use crate::error::FsError;

/// Filesystem that talks straight to the operating system.
#[derive(Debug, Default)]
pub struct NativeFileSystem {
    registry: Arc<HandleRegistry>,
}

impl NativeFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_registry(registry: Arc<HandleRegistry>) -> Self {
        Self { registry }
    }

    /// Number of handles opened through this filesystem that are still alive.
    pub fn open_handles(&self) -> usize {
        self.registry.open_count()
    }
}

fn native_file(handle: &FileHandle) -> Result<&File, FsError> {
    match &handle.origin {
        HandleOrigin::Native(file) => Ok(file),
        HandleOrigin::Host => Err(FsError::InvalidHandle(format!(
            "{} was opened by the host",
            handle.path()
        ))),
    }
}

/// Read until `len` bytes are buffered or the reader reports end of file.
pub(super) fn read_up_to(mut reader: impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(unix)]
pub(super) fn pread(file: &File, len: usize, offset: u64) -> io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;

    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(not(unix))]
pub(super) fn pread(file: &File, len: usize, offset: u64) -> io::Result<Vec<u8>> {
    use std::io::{Seek, SeekFrom};

    let mut file = file;
    let cursor = file.stream_position()?;
    file.seek(SeekFrom::Start(offset))?;
    let data = read_up_to(file, len);
    file.seek(SeekFrom::Start(cursor))?;
    data
}

impl FileSystem for NativeFileSystem {
    fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        lock: FileLockType,
    ) -> Result<FileHandle, FsError> {
        let mut options = OpenOptions::new();
        let write = flags.contains(OpenFlags::WRITE) || flags.contains(OpenFlags::APPEND);
        options
            .read(flags.contains(OpenFlags::READ) || !write)
            .write(write)
            .append(flags.contains(OpenFlags::APPEND))
            .create(write && flags.contains(OpenFlags::CREATE))
            .truncate(write && flags.contains(OpenFlags::TRUNCATE));
        let file = options.open(path)?;
        debug!(path, ?flags, ?lock, "Opened native file");
        Ok(FileHandle::native(path, file, self.registry.clone()))
    }

    fn read(&self, handle: &FileHandle, len: usize) -> Result<ReadChunk, FsError> {
        let data = read_up_to(native_file(handle)?, len)?;
        trace!(path = handle.path(), len, read = data.len(), "Native sequential read");
        Ok(ReadChunk::new(data))
    }

    fn read_at(&self, handle: &FileHandle, len: usize, offset: u64) -> Result<Vec<u8>, FsError> {
        Ok(pread(native_file(handle)?, len, offset)?)
    }

    fn file_size(&self, handle: &FileHandle) -> Result<u64, FsError> {
        Ok(native_file(handle)?.metadata()?.len())
    }

    fn truncate(&self, handle: &FileHandle, size: u64) -> Result<(), FsError> {
        Ok(native_file(handle)?.set_len(size)?)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError> {
        Ok(native_glob(pattern))
    }

    fn directory_exists(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }

    fn file_exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn list_files(
        &self,
        directory: &str,
        visitor: &mut dyn FnMut(&str, bool),
    ) -> Result<bool, FsError> {
        if !Path::new(directory).is_dir() {
            return Ok(false);
        }
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            visitor(&entry.file_name().to_string_lossy(), is_dir);
        }
        Ok(true)
    }

    fn path_separator(&self) -> &'static str {
        MAIN_SEPARATOR_STR
    }

    fn join_path(&self, base: &str, path: &str) -> String {
        Path::new(base).join(path).to_string_lossy().into_owned()
    }

    fn working_directory(&self) -> Result<String, FsError> {
        Ok(std::env::current_dir()?.to_string_lossy().into_owned())
    }

    fn set_working_directory(&self, path: &str) -> Result<(), FsError> {
        Ok(std::env::set_current_dir(path)?)
    }
}

fn has_wildcard(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

/// Expand a path pattern component by component. Results are sorted.
pub(super) fn native_glob(pattern: &str) -> Vec<String> {
    if !has_wildcard(pattern) {
        return if Path::new(pattern).exists() {
            vec![pattern.to_string()]
        } else {
            Vec::new()
        };
    }

    let root = if pattern.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    let components: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    let mut current = vec![root];

    for (i, component) in components.iter().enumerate() {
        let last = i + 1 == components.len();
        let mut next = Vec::new();
        for base in current {
            if !has_wildcard(component) {
                let candidate = base.join(component);
                if (last && candidate.exists()) || candidate.is_dir() {
                    next.push(candidate);
                }
                continue;
            }
            let dir = if base.as_os_str().is_empty() {
                Path::new(".")
            } else {
                base.as_path()
            };
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') && !component.starts_with('.') {
                    continue;
                }
                if !glob_match(component, &name) {
                    continue;
                }
                let candidate = base.join(&*name);
                if last || candidate.is_dir() {
                    next.push(candidate);
                }
            }
        }
        current = next;
    }

    let mut matches: Vec<String> = current
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    matches.sort();
    matches
}

/// Match one path component against a pattern with `*`, `?` and `[...]`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    backtrack = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => match match_class(&p, pi, t[ti]) {
                    Some((true, next)) => {
                        pi = next;
                        ti += 1;
                        continue;
                    }
                    Some((false, _)) => {}
                    None if t[ti] == '[' => {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                    None => {}
                },
                c if c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((star, consumed)) => {
                pi = star + 1;
                ti = consumed + 1;
                backtrack = Some((star, consumed + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Evaluate a `[...]` class starting at `p[start]`. Returns whether `c`
/// matched and the index after the closing bracket, or `None` if the class is
/// unterminated.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && (p[i] == '!' || p[i] == '^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() && (p[i] != ']' || first) {
        first = false;
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            if p[i] <= c && c <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
