//! Per-session bookkeeping chosen by the handle's access mode.
//!
//! A read session tracks where each archived path was actually extracted to,
//! so later hard-link members can be pointed at the right file. A write
//! session tracks device and inode identities, so a second link to an already
//! archived file can be stored as a link instead of a second copy.
//!
//! Exactly one of the two tables exists per handle. It is chosen once when the
//! handle is built and torn down once when the handle is closed.
use crate::error::Result;
use crate::flags::AccessMode;
use crate::table::{HashFn, Table};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Bucket count of the read-mode path table.
pub const PATH_TABLE_CAPACITY: usize = 256;
/// Bucket count of the write-mode device table.
pub const DEVICE_TABLE_CAPACITY: usize = 16;
/// Bucket count of each device's inode table.
pub const INODE_TABLE_CAPACITY: usize = 256;

pub type DeviceId = u64;
pub type InodeId = u64;

/// Buckets a path by the first byte of its final component.
pub fn path_hash(path: &Path, buckets: usize) -> usize {
    let name = path.file_name().unwrap_or(path.as_os_str());
    let first = name.as_bytes().first().copied().unwrap_or(0);
    usize::from(first) % buckets
}

pub fn device_hash(dev: &DeviceId, buckets: usize) -> usize {
    (*dev % buckets as u64) as usize
}

pub fn inode_hash(ino: &InodeId, buckets: usize) -> usize {
    (*ino % buckets as u64) as usize
}

/// The hash functions a handle builds its table with.
#[derive(Clone, Copy)]
pub struct Hashers {
    pub path: HashFn<Path>,
    pub device: HashFn<DeviceId>,
}

impl Default for Hashers {
    fn default() -> Self {
        Self {
            path: path_hash,
            device: device_hash,
        }
    }
}

impl fmt::Debug for Hashers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hashers")
            .field("path", &(self.path as usize as *const ()))
            .field("device", &(self.device as usize as *const ()))
            .finish()
    }
}

/// Read-mode table: archived path to the path it was extracted as.
#[derive(Debug)]
pub struct PathTable {
    table: Table<PathBuf, PathBuf, Path>,
}

impl PathTable {
    pub fn new(hash: HashFn<Path>) -> Result<Self> {
        Ok(Self {
            table: Table::new(PATH_TABLE_CAPACITY, hash)?,
        })
    }

    /// Remembers that `archived` was written to disk as `extracted`.
    pub fn record(&mut self, archived: PathBuf, extracted: PathBuf) -> Result<Option<PathBuf>> {
        self.table.insert(archived, extracted)
    }

    /// Where `archived` ended up, if it was extracted in this session.
    pub fn lookup(&self, archived: &Path) -> Option<&Path> {
        self.table.get(archived).map(PathBuf::as_path)
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// All inodes seen on one device during a write session.
#[derive(Debug)]
pub struct DeviceEntry {
    dev: DeviceId,
    inodes: Table<InodeId, PathBuf>,
}

impl DeviceEntry {
    fn new(dev: DeviceId) -> Result<Self> {
        Ok(Self {
            dev,
            inodes: Table::<InodeId, PathBuf>::new(INODE_TABLE_CAPACITY, inode_hash)?,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }

    pub fn inodes(&self) -> usize {
        self.inodes.len()
    }

    /// Releases the nested inode table, returning how many inodes it held.
    pub fn release(mut self) -> usize {
        self.inodes.drain_with(|_, _| {})
    }
}

/// Write-mode table: device id to the inodes archived from that device.
#[derive(Debug)]
pub struct DeviceTable {
    table: Table<DeviceId, DeviceEntry>,
}

impl DeviceTable {
    pub fn new(hash: HashFn<DeviceId>) -> Result<Self> {
        Ok(Self {
            table: Table::new(DEVICE_TABLE_CAPACITY, hash)?,
        })
    }

    /// Records that `path` is the file at `dev`/`ino`.
    ///
    /// Returns the path first recorded for the same identity when this is a
    /// further hard link to it, and `None` the first time an identity is seen.
    pub fn record(&mut self, dev: DeviceId, ino: InodeId, path: &Path) -> Result<Option<PathBuf>> {
        if self.table.get(&dev).is_none() {
            self.table.insert(dev, DeviceEntry::new(dev)?)?;
        }
        let Some(entry) = self.table.get_mut(&dev) else {
            return Ok(None);
        };
        if let Some(first) = entry.inodes.get(&ino) {
            return Ok(Some(first.clone()));
        }
        entry.inodes.insert(ino, path.to_path_buf())?;
        Ok(None)
    }

    /// The path first recorded for `dev`/`ino`, if any.
    pub fn lookup(&self, dev: DeviceId, ino: InodeId) -> Option<&Path> {
        self.table
            .get(&dev)
            .and_then(|entry| entry.inodes.get(&ino))
            .map(PathBuf::as_path)
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Number of distinct devices seen.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Which table a handle carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuxKind {
    Paths,
    Devices,
}

/// What tearing down a table released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TeardownSummary {
    pub kind: AuxKind,
    /// Top-level entries released.
    pub entries: usize,
    /// Entries released from nested tables (inodes under each device).
    pub nested: usize,
}

/// The bookkeeping table of one archive handle.
#[derive(Debug)]
pub enum AuxState {
    Paths(PathTable),
    Devices(DeviceTable),
}

impl AuxState {
    /// Builds the table for `mode`: path-keyed for reading, device-keyed for
    /// writing.
    pub fn for_mode(mode: AccessMode, hashers: Hashers) -> Result<Self> {
        Ok(match mode {
            AccessMode::Read => Self::Paths(PathTable::new(hashers.path)?),
            AccessMode::Write => Self::Devices(DeviceTable::new(hashers.device)?),
        })
    }

    pub fn kind(&self) -> AuxKind {
        match self {
            Self::Paths(_) => AuxKind::Paths,
            Self::Devices(_) => AuxKind::Devices,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Self::Paths(t) => t.capacity(),
            Self::Devices(t) => t.capacity(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Paths(t) => t.len(),
            Self::Devices(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paths(&self) -> Option<&PathTable> {
        match self {
            Self::Paths(t) => Some(t),
            Self::Devices(_) => None,
        }
    }

    pub fn paths_mut(&mut self) -> Option<&mut PathTable> {
        match self {
            Self::Paths(t) => Some(t),
            Self::Devices(_) => None,
        }
    }

    pub fn devices(&self) -> Option<&DeviceTable> {
        match self {
            Self::Devices(t) => Some(t),
            Self::Paths(_) => None,
        }
    }

    pub fn devices_mut(&mut self) -> Option<&mut DeviceTable> {
        match self {
            Self::Devices(t) => Some(t),
            Self::Paths(_) => None,
        }
    }

    /// Releases every entry with the destructor that fits the table: plain
    /// drops for paths, [`DeviceEntry::release`] for devices.
    pub(crate) fn teardown(&mut self) -> TeardownSummary {
        match self {
            Self::Paths(t) => TeardownSummary {
                kind: AuxKind::Paths,
                entries: t.table.drain_with(|_, extracted| drop(extracted)),
                nested: 0,
            },
            Self::Devices(t) => {
                let mut nested = 0;
                let entries = t.table.drain_with(|_, entry| nested += entry.release());
                TeardownSummary {
                    kind: AuxKind::Devices,
                    entries,
                    nested,
                }
            }
        }
    }
}
