use super::{Backend, Descriptor};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Forwards every operation to the platform's `open`, `close`, `read` and
/// `write` with no buffering or transformation.
///
/// The type is stateless; [`super::DEFAULT_BACKEND`] is the shared instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawBackend;

/// Maps a `-1`-style return value to the thread's last OS error.
fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

impl Backend for RawBackend {
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> io::Result<Descriptor> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "path contains an interior NUL byte",
            )
        })?;

        // `open` is variadic, so the mode is passed promoted to `c_uint`.
        let fd = unsafe { libc::open(c_path.as_ptr(), flags.bits(), mode.bits() as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn close(&self, fd: Descriptor) -> io::Result<()> {
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read(&self, fd: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        cvt(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn write(&self, fd: Descriptor, buf: &[u8]) -> io::Result<usize> {
        cvt(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }
}
