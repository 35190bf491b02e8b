//! The archive handle and its lifecycle.
//!
//! An [`Archive`] is created by exactly two constructors, [`Archive::open`]
//! for a fresh stream and [`Archive::from_descriptor`] for one the caller
//! already holds, and released by exactly one operation, [`Archive::close`].
//! Dropping a handle that was never closed performs the same release.
//!
//! Construction either yields a fully usable handle (access mode validated,
//! backend bound, bookkeeping table built, stream acquired) or fails without
//! leaving anything allocated or open.
use crate::backend::{Backend, DEFAULT_BACKEND, Descriptor};
use crate::error::{Error, Result};
use crate::flags::{AccessMode, Options, fresh_open_flags};
use crate::state::{AuxKind, AuxState, Hashers, TeardownSummary};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of one tar block. Archive streams are read and written in multiples
/// of it.
pub const BLOCK_SIZE: usize = 512;

/// Permission bits used for archives created without an explicit mode.
const DEFAULT_CREATE_MODE: u32 = 0o644;

/// Configures and opens an [`Archive`], in the style of
/// [`std::fs::OpenOptions`].
///
/// # Example
///
/// ```rust,no_run
/// use tarkit_core::{ArchiveBuilder, Options};
/// use nix::fcntl::OFlag;
///
/// # fn main() -> tarkit_core::Result<()> {
/// let archive = ArchiveBuilder::new()
///     .flags(OFlag::O_WRONLY | OFlag::O_CREAT)
///     .options(Options::NO_OVERWRITE)
///     .open("backup.tar")?;
/// archive.close().into_result()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ArchiveBuilder<'b> {
    flags: OFlag,
    mode: Mode,
    options: Options,
    backend: &'b dyn Backend,
    hashers: Hashers,
}

impl Default for ArchiveBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'b> ArchiveBuilder<'b> {
    /// Read-only, default backend, no options.
    pub fn new() -> Self {
        Self {
            flags: OFlag::O_RDONLY,
            mode: Mode::from_bits_truncate(DEFAULT_CREATE_MODE as _),
            options: Options::empty(),
            backend: &DEFAULT_BACKEND,
            hashers: Hashers::default(),
        }
    }

    pub fn flags(&mut self, flags: OFlag) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Permission bits for a newly created archive.
    pub fn mode(&mut self, mode: Mode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn options(&mut self, options: Options) -> &mut Self {
        self.options = options;
        self
    }

    /// Binds `backend` instead of [`DEFAULT_BACKEND`].
    pub fn backend(&mut self, backend: &'b dyn Backend) -> &mut Self {
        self.backend = backend;
        self
    }

    /// Overrides the hash functions the bookkeeping table is built with.
    pub fn hashers(&mut self, hashers: Hashers) -> &mut Self {
        self.hashers = hashers;
        self
    }

    /// Everything both constructors share: validate the access mode, then
    /// build the table. The result holds no stream yet.
    fn init(&self, path: &Path) -> Result<Archive<'b>> {
        let access = AccessMode::from_flags(self.flags)?;
        let state = AuxState::for_mode(access, self.hashers)?;
        Ok(Archive {
            pathname: path.to_path_buf(),
            access,
            flags: self.flags,
            mode: self.mode,
            options: self.options,
            backend: self.backend,
            fd: -1,
            state,
            open: false,
        })
    }

    /// Opens the archive at `path` through the bound backend.
    ///
    /// With [`Options::NO_OVERWRITE`] and `O_CREAT`, the backend is asked for
    /// an exclusive create, so an existing archive makes the open fail rather
    /// than being truncated.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the flags request read/write access.
    /// - [`Error::Allocation`] if the bookkeeping table cannot be built.
    /// - [`Error::Backend`] if the backend's `open` fails.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Archive<'b>> {
        let path = path.as_ref();
        let mut archive = self.init(path)?;

        let flags = fresh_open_flags(self.flags, self.options);
        let fd = archive
            .backend
            .open(path, flags, self.mode)
            .map_err(|e| Error::backend("open", path, e))?;
        archive.bind(fd);

        debug!(
            path = %path.display(),
            fd,
            access = %archive.access,
            options = ?archive.options,
            "opened archive"
        );
        Ok(archive)
    }

    /// Wraps a descriptor the caller already opened. The backend's `open` is
    /// never called; `close` will still release `fd` through the backend.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the flags request read/write access.
    /// - [`Error::Allocation`] if the bookkeeping table cannot be built.
    pub fn from_descriptor(&self, fd: Descriptor, path: impl AsRef<Path>) -> Result<Archive<'b>> {
        let path = path.as_ref();
        let mut archive = self.init(path)?;
        archive.bind(fd);

        debug!(path = %path.display(), fd, access = %archive.access, "adopted archive descriptor");
        Ok(archive)
    }
}

impl fmt::Debug for ArchiveBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveBuilder")
            .field("flags", &self.flags)
            .field("mode", &self.mode)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// The result of closing an archive.
///
/// Closing always releases the stream and the bookkeeping table. `status` only
/// reports what the backend said about releasing the stream.
#[must_use]
#[derive(Debug)]
pub struct CloseReport {
    pub status: Result<()>,
    pub teardown: TeardownSummary,
}

impl CloseReport {
    pub fn into_result(self) -> Result<()> {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// An open archive session.
///
/// The handle owns its stream and its bookkeeping table and borrows its
/// backend. It does no locking; share it across threads only behind external
/// synchronization.
pub struct Archive<'b> {
    pathname: PathBuf,
    access: AccessMode,
    flags: OFlag,
    mode: Mode,
    options: Options,
    backend: &'b dyn Backend,
    fd: Descriptor,
    state: AuxState,
    open: bool,
}

impl<'b> Archive<'b> {
    /// Opens `path` with `flags`, creating it with permission bits `mode` if
    /// requested. `backend` defaults to [`DEFAULT_BACKEND`].
    ///
    /// See [`ArchiveBuilder::open`] for the error conditions.
    pub fn open(
        path: impl AsRef<Path>,
        backend: Option<&'b dyn Backend>,
        flags: OFlag,
        mode: Mode,
        options: Options,
    ) -> Result<Self> {
        let mut builder = ArchiveBuilder::new();
        builder.flags(flags).mode(mode).options(options);
        if let Some(backend) = backend {
            builder.backend(backend);
        }
        builder.open(path)
    }

    /// Adopts `fd` as the stream of a new handle.
    ///
    /// See [`ArchiveBuilder::from_descriptor`] for the error conditions.
    pub fn from_descriptor(
        fd: Descriptor,
        path: impl AsRef<Path>,
        backend: Option<&'b dyn Backend>,
        flags: OFlag,
        mode: Mode,
        options: Options,
    ) -> Result<Self> {
        let mut builder = ArchiveBuilder::new();
        builder.flags(flags).mode(mode).options(options);
        if let Some(backend) = backend {
            builder.backend(backend);
        }
        builder.from_descriptor(fd, path)
    }

    fn bind(&mut self, fd: Descriptor) {
        self.fd = fd;
        self.open = true;
    }

    /// The descriptor of the bound stream.
    pub fn descriptor(&self) -> Descriptor {
        self.fd
    }

    pub fn pathname(&self) -> &Path {
        &self.pathname
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access
    }

    /// The flags the handle was requested with, before any open-time
    /// additions.
    pub fn flags(&self) -> OFlag {
        self.flags
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn backend(&self) -> &'b dyn Backend {
        self.backend
    }

    pub fn state(&self) -> &AuxState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AuxState {
        &mut self.state
    }

    /// Fills `block` from the stream.
    ///
    /// Returns `BLOCK_SIZE` unless the stream ended first, in which case the
    /// count of bytes that were available is returned (`0` at a clean end).
    pub fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<usize> {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.backend.read(self.fd, &mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::backend("read", &self.pathname, e)),
            }
        }
        Ok(filled)
    }

    /// Writes all of `block` to the stream.
    pub fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        io::Write::write_all(self, block).map_err(|e| Error::backend("write", &self.pathname, e))
    }

    /// Releases the stream through the backend and tears the table down.
    ///
    /// Both happen exactly once, whatever the backend reports. The handle is
    /// consumed either way.
    pub fn close(mut self) -> CloseReport {
        self.release()
    }

    fn release(&mut self) -> CloseReport {
        self.open = false;
        let status = self
            .backend
            .close(self.fd)
            .map_err(|e| Error::backend("close", &self.pathname, e));
        let teardown = self.state.teardown();

        debug!(
            path = %self.pathname.display(),
            fd = self.fd,
            table = ?teardown.kind,
            entries = teardown.entries,
            ok = status.is_ok(),
            "closed archive"
        );
        CloseReport { status, teardown }
    }

    /// Which table this handle carries.
    pub fn state_kind(&self) -> AuxKind {
        self.state.kind()
    }
}

impl Drop for Archive<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.release().status {
            warn!(error = %e, "archive dropped without close; backend close failed");
        }
    }
}

impl io::Read for Archive<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.backend.read(self.fd, buf)
    }
}

impl io::Write for Archive<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.backend.write(self.fd, buf)
    }

    /// Nothing is buffered here; bytes reach the backend only through
    /// `write` and `close`.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Archive<'_> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for Archive<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("pathname", &self.pathname)
            .field("access", &self.access)
            .field("fd", &self.fd)
            .field("options", &self.options)
            .field("state", &self.state.kind())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Codec, CompressedBackend, MemoryBackend};
    use std::io::{Read, Write};

    #[test]
    fn test_builder_defaults_to_read_only() {
        let backend = MemoryBackend::new();
        backend.insert_file("b.tar", vec![0u8; BLOCK_SIZE]);
        let archive = ArchiveBuilder::new().backend(&backend).open("b.tar").unwrap();
        assert_eq!(archive.access_mode(), AccessMode::Read);
        assert_eq!(archive.state_kind(), AuxKind::Paths);
        assert!(archive.close().is_ok());
    }

    #[test]
    fn test_block_round_trip() {
        let backend = MemoryBackend::new();
        let mut block = [0u8; BLOCK_SIZE];
        block[..5].copy_from_slice(b"ustar");

        let mut writer = ArchiveBuilder::new()
            .flags(OFlag::O_WRONLY | OFlag::O_CREAT)
            .backend(&backend)
            .open("a.tar")
            .unwrap();
        writer.write_block(&block).unwrap();
        writer.write_block(&[0u8; BLOCK_SIZE]).unwrap();
        writer.close().into_result().unwrap();

        let mut reader = ArchiveBuilder::new().backend(&backend).open("a.tar").unwrap();
        let mut got = [0u8; BLOCK_SIZE];
        assert_eq!(reader.read_block(&mut got).unwrap(), BLOCK_SIZE);
        assert_eq!(got, block);
        assert_eq!(reader.read_block(&mut got).unwrap(), BLOCK_SIZE);
        assert_eq!(reader.read_block(&mut got).unwrap(), 0);
        reader.close().into_result().unwrap();
    }

    #[test]
    fn test_short_final_block_reports_available_bytes() {
        let backend = MemoryBackend::new();
        backend.insert_file("short.tar", vec![7u8; 100]);
        let mut archive = ArchiveBuilder::new().backend(&backend).open("short.tar").unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(archive.read_block(&mut block).unwrap(), 100);
        assert!(archive.close().is_ok());
    }

    #[test]
    fn test_std_io_traits_delegate_to_backend() {
        let backend = MemoryBackend::new();
        let mut writer = ArchiveBuilder::new()
            .flags(OFlag::O_WRONLY | OFlag::O_CREAT)
            .backend(&backend)
            .open("io.tar")
            .unwrap();
        writer.write_all(b"streamed").unwrap();
        writer.flush().unwrap();
        drop(writer);
        assert_eq!(backend.contents("io.tar").unwrap(), b"streamed");
        assert_eq!(backend.open_descriptors(), 0);

        let mut reader = ArchiveBuilder::new().backend(&backend).open("io.tar").unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "streamed");
    }

    #[test]
    fn test_flush_leaves_compressed_stream_open_until_close() {
        let inner = std::sync::Arc::new(MemoryBackend::new());
        let gzip = CompressedBackend::with_shared_inner(Codec::Gzip, std::sync::Arc::clone(&inner));
        let mut writer = ArchiveBuilder::new()
            .flags(OFlag::O_WRONLY | OFlag::O_CREAT)
            .backend(&gzip)
            .open("flush.tgz")
            .unwrap();
        writer.write_block(&[1u8; BLOCK_SIZE]).unwrap();
        writer.flush().unwrap();
        writer.write_block(&[2u8; BLOCK_SIZE]).unwrap();
        writer.flush().unwrap();
        assert!(!inner.exists("flush.tgz"));
        writer.close().into_result().unwrap();

        let mut reader = ArchiveBuilder::new().backend(&gzip).open("flush.tgz").unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(reader.read_block(&mut block).unwrap(), BLOCK_SIZE);
        assert_eq!(block, [1u8; BLOCK_SIZE]);
        assert_eq!(reader.read_block(&mut block).unwrap(), BLOCK_SIZE);
        assert_eq!(block, [2u8; BLOCK_SIZE]);
        assert_eq!(reader.read_block(&mut block).unwrap(), 0);
        reader.close().into_result().unwrap();
    }

    #[test]
    fn test_drop_releases_unclosed_handle() {
        let backend = MemoryBackend::new();
        {
            let _archive = ArchiveBuilder::new()
                .flags(OFlag::O_WRONLY | OFlag::O_CREAT)
                .backend(&backend)
                .open("dropped.tar")
                .unwrap();
            assert_eq!(backend.open_descriptors(), 1);
        }
        assert_eq!(backend.open_descriptors(), 0);
    }
}
