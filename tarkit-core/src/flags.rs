//! Access modes, open flags, and the handle's option bitmask.
use crate::error::{Error, Result};
use nix::fcntl::OFlag;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Whether a handle reads an existing archive or writes a new one.
///
/// A handle is never both. The mode is fixed when the handle is constructed
/// and decides which bookkeeping table the handle carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    /// Classifies `flags` by their `O_ACCMODE` bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for `O_RDWR` or any other access
    /// value that is neither read-only nor write-only.
    pub fn from_flags(flags: OFlag) -> Result<Self> {
        let access = flags & OFlag::O_ACCMODE;
        if access == OFlag::O_RDONLY {
            Ok(Self::Read)
        } else if access == OFlag::O_WRONLY {
            Ok(Self::Write)
        } else if access == OFlag::O_RDWR {
            Err(Error::invalid_argument(
                "archives cannot be opened for both reading and writing",
            ))
        } else {
            Err(Error::invalid_argument(format!(
                "unrecognized access mode bits {:#o}",
                access.bits()
            )))
        }
    }

    pub fn is_read(self) -> bool {
        self == Self::Read
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Behavioral options attached to a handle.
///
/// Only [`Options::NO_OVERWRITE`] is acted on when a handle is opened. The
/// remaining bits are carried for the layers built on top of the handle and
/// are never interpreted here; unknown bits survive [`Options::from_bits`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Options(u32);

impl Options {
    /// Use GNU extensions when writing headers.
    pub const GNU: Self = Self(1);
    /// Report each member as it is processed.
    pub const VERBOSE: Self = Self(2);
    /// Fail instead of replacing an archive that already exists.
    pub const NO_OVERWRITE: Self = Self(4);
    /// Keep reading past the end-of-archive marker.
    pub const IGNORE_EOT: Self = Self(8);
    /// Reject headers without the expected magic.
    pub const CHECK_MAGIC: Self = Self(16);
    /// Reject headers without the expected version.
    pub const CHECK_VERSION: Self = Self(32);
    /// Accept headers whose checksum does not match.
    pub const IGNORE_CRC: Self = Self(64);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Options {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Options {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Options {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Options, &str); 7] = [
            (Options::GNU, "GNU"),
            (Options::VERBOSE, "VERBOSE"),
            (Options::NO_OVERWRITE, "NO_OVERWRITE"),
            (Options::IGNORE_EOT, "IGNORE_EOT"),
            (Options::CHECK_MAGIC, "CHECK_MAGIC"),
            (Options::CHECK_VERSION, "CHECK_VERSION"),
            (Options::IGNORE_CRC, "IGNORE_CRC"),
        ];

        let mut set = f.debug_set();
        let mut known = 0;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
                known |= flag.0;
            }
        }
        let unknown = self.0 & !known;
        if unknown != 0 {
            set.entry(&format_args!("{unknown:#x}"));
        }
        set.finish()
    }
}

/// Computes the flags handed to the backend's `open` for a fresh archive.
///
/// Overwrite protection only matters when creation was requested: an
/// `O_EXCL` open then fails instead of truncating an existing archive.
/// Descriptors are never inherited across `exec`.
pub(crate) fn fresh_open_flags(flags: OFlag, options: Options) -> OFlag {
    let mut flags = flags;
    if options.contains(Options::NO_OVERWRITE) && flags.contains(OFlag::O_CREAT) {
        flags |= OFlag::O_EXCL;
    }
    flags | OFlag::O_CLOEXEC
}
