use super::{Backend, Descriptor};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};

/// One open descriptor of a [`MemoryBackend`].
struct MemoryStream {
    path: PathBuf,
    readable: bool,
    writable: bool,
    append: bool,
    data: Cursor<Vec<u8>>,
}

/// A backend that keeps archives in memory instead of on disk.
///
/// Opens follow the usual `open(2)` rules for `O_CREAT`, `O_EXCL`, `O_TRUNC`
/// and `O_APPEND`. Bytes written through a descriptor become visible to later
/// opens once that descriptor is closed.
#[derive(Debug)]
pub struct MemoryBackend {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    streams: Mutex<HashMap<Descriptor, MemoryStream>>,
    next_fd: AtomicI32,
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("len", &self.data.get_ref().len())
            .finish()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the maps half-updated.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn bad_descriptor() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            // Stay clear of stdin, stdout and stderr.
            next_fd: AtomicI32::new(3),
        }
    }

    /// Stores `contents` at `path`, replacing anything already there.
    pub fn insert_file(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        lock(&self.files).insert(path.into(), contents.into());
    }

    /// Returns a copy of the committed contents of `path`.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        lock(&self.files).get(path.as_ref()).cloned()
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        lock(&self.files).contains_key(path.as_ref())
    }

    /// Number of descriptors that have been opened and not yet closed.
    pub fn open_descriptors(&self) -> usize {
        lock(&self.streams).len()
    }
}

impl Backend for MemoryBackend {
    fn open(&self, path: &Path, flags: OFlag, _mode: Mode) -> io::Result<Descriptor> {
        let access = flags & OFlag::O_ACCMODE;
        let readable = access != OFlag::O_WRONLY;
        let writable = access == OFlag::O_WRONLY || access == OFlag::O_RDWR;

        let mut files = lock(&self.files);
        let existing = files.get(path);
        let initial = match existing {
            Some(_) if flags.contains(OFlag::O_CREAT | OFlag::O_EXCL) => {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            Some(_) if writable && flags.contains(OFlag::O_TRUNC) => Vec::new(),
            Some(data) => data.clone(),
            None if flags.contains(OFlag::O_CREAT) => Vec::new(),
            None => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
        };
        if existing.is_none() || (writable && flags.contains(OFlag::O_TRUNC)) {
            files.insert(path.to_path_buf(), initial.clone());
        }
        drop(files);

        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        lock(&self.streams).insert(
            fd,
            MemoryStream {
                path: path.to_path_buf(),
                readable,
                writable,
                append: flags.contains(OFlag::O_APPEND),
                data: Cursor::new(initial),
            },
        );
        Ok(fd)
    }

    fn close(&self, fd: Descriptor) -> io::Result<()> {
        let stream = lock(&self.streams).remove(&fd).ok_or_else(bad_descriptor)?;
        if stream.writable {
            lock(&self.files).insert(stream.path, stream.data.into_inner());
        }
        Ok(())
    }

    fn read(&self, fd: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        let mut streams = lock(&self.streams);
        let stream = streams.get_mut(&fd).ok_or_else(bad_descriptor)?;
        if !stream.readable {
            return Err(bad_descriptor());
        }
        stream.data.read(buf)
    }

    fn write(&self, fd: Descriptor, buf: &[u8]) -> io::Result<usize> {
        let mut streams = lock(&self.streams);
        let stream = streams.get_mut(&fd).ok_or_else(bad_descriptor)?;
        if !stream.writable {
            return Err(bad_descriptor());
        }
        if stream.append {
            stream.data.seek(SeekFrom::End(0))?;
        }
        stream.data.write(buf)
    }
}
