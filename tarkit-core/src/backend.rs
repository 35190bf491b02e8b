//! The pluggable I/O layer an archive handle delegates its raw bytes to.
//!
//! A [`Backend`] is a fixed set of four operations: `open`, `close`, `read`
//! and `write`, keyed by a descriptor. Every method is required, so a backend
//! is always complete. Handles only borrow their backend; one backend value
//! may serve many handles at once.
//!
//! Implementations provided here:
//! - [`RawBackend`]: forwards to the platform's file-descriptor primitives.
//!   The shared [`DEFAULT_BACKEND`] instance is used when a caller does not
//!   supply one.
//! - [`MemoryBackend`]: keeps archives in memory.
//! - [`CompressedBackend`]: layers gzip, xz, or zstd over another backend.

mod compressed;
mod memory;
mod raw;

pub use self::compressed::{Codec, CompressedBackend};
pub use self::memory::MemoryBackend;
pub use self::raw::RawBackend;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

/// The identifier a backend hands out for an open stream.
pub type Descriptor = RawFd;

/// The backend bound to handles that do not name one.
pub static DEFAULT_BACKEND: RawBackend = RawBackend;

/// Raw byte I/O for an archive stream.
pub trait Backend: Send + Sync {
    /// Opens `path` with `flags` and, when creating, permission bits `mode`.
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> io::Result<Descriptor>;

    /// Releases `fd`. The descriptor is invalid afterwards even on error.
    fn close(&self, fd: Descriptor) -> io::Result<()>;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&self, fd: Descriptor, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes up to `buf.len()` bytes and returns how many were accepted.
    fn write(&self, fd: Descriptor, buf: &[u8]) -> io::Result<usize>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> io::Result<Descriptor> {
        (**self).open(path, flags, mode)
    }

    fn close(&self, fd: Descriptor) -> io::Result<()> {
        (**self).close(fd)
    }

    fn read(&self, fd: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(fd, buf)
    }

    fn write(&self, fd: Descriptor, buf: &[u8]) -> io::Result<usize> {
        (**self).write(fd, buf)
    }
}

impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> io::Result<Descriptor> {
        (**self).open(path, flags, mode)
    }

    fn close(&self, fd: Descriptor) -> io::Result<()> {
        (**self).close(fd)
    }

    fn read(&self, fd: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(fd, buf)
    }

    fn write(&self, fd: Descriptor, buf: &[u8]) -> io::Result<usize> {
        (**self).write(fd, buf)
    }
}

/// Adapts one descriptor of a backend to `std::io::Read` and `Write`.
///
/// This is how codecs and other stream adapters sit on top of a backend.
pub struct DescriptorIo<B> {
    backend: B,
    fd: Descriptor,
}

impl<B: Backend> DescriptorIo<B> {
    pub fn new(backend: B, fd: Descriptor) -> Self {
        Self { backend, fd }
    }
}

impl<B: Backend> io::Read for DescriptorIo<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.backend.read(self.fd, buf)
    }
}

impl<B: Backend> io::Write for DescriptorIo<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.backend.write(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
