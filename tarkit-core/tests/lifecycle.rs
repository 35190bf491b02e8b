//! Lifecycle tests for the archive handle: construction, table selection,
//! overwrite protection, descriptor adoption and close.

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fs;
use std::io;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;
use tarkit_core::backend::{Codec, CompressedBackend, MemoryBackend};
use tarkit_core::state::{DeviceId, Hashers, device_hash, path_hash};
use tarkit_core::{
    AccessMode, Archive, ArchiveBuilder, AuxKind, BLOCK_SIZE, Backend, Descriptor, Error, Options,
};

/// Counts backend calls and remembers the flags of the last `open`.
#[derive(Default)]
struct RecordingBackend {
    inner: MemoryBackend,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_close: bool,
    last_flags: Mutex<Option<OFlag>>,
}

impl RecordingBackend {
    fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn last_flags(&self) -> Option<OFlag> {
        *self.last_flags.lock().unwrap()
    }
}

impl Backend for RecordingBackend {
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> io::Result<Descriptor> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_flags.lock().unwrap() = Some(flags);
        self.inner.open(path, flags, mode)
    }

    fn close(&self, fd: Descriptor) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let closed = self.inner.close(fd);
        if self.fail_close {
            return Err(io::Error::other("injected close failure"));
        }
        closed
    }

    fn read(&self, fd: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(fd, buf)
    }

    fn write(&self, fd: Descriptor, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(fd, buf)
    }
}

fn create_mode() -> Mode {
    Mode::from_bits_truncate(0o644)
}

#[test]
fn test_read_write_access_is_rejected_before_anything_is_opened() {
    let backend = RecordingBackend::default();
    let extras = [OFlag::empty(), OFlag::O_CREAT, OFlag::O_CREAT | OFlag::O_TRUNC];

    for extra in extras {
        let err = Archive::open(
            "rw.tar",
            Some(&backend as &dyn Backend),
            OFlag::O_RDWR | extra,
            create_mode(),
            Options::NO_OVERWRITE,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{extra:?}");

        let err = Archive::from_descriptor(
            7,
            "rw.tar",
            Some(&backend as &dyn Backend),
            OFlag::O_RDWR | extra,
            create_mode(),
            Options::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{extra:?}");
    }

    assert_eq!(backend.opens(), 0);
    assert_eq!(backend.closes(), 0);
    assert!(!backend.inner.exists("rw.tar"));
}

static PATH_HASH_CALLS: AtomicUsize = AtomicUsize::new(0);
static DEVICE_HASH_CALLS: AtomicUsize = AtomicUsize::new(0);

fn counting_path_hash(path: &Path, buckets: usize) -> usize {
    PATH_HASH_CALLS.fetch_add(1, Ordering::SeqCst);
    path_hash(path, buckets)
}

fn counting_device_hash(dev: &DeviceId, buckets: usize) -> usize {
    DEVICE_HASH_CALLS.fetch_add(1, Ordering::SeqCst);
    device_hash(dev, buckets)
}

#[test]
fn test_table_selection_follows_access_mode() {
    let backend = MemoryBackend::new();
    backend.insert_file("r.tar", Vec::new());
    let hashers = Hashers {
        path: counting_path_hash,
        device: counting_device_hash,
    };

    let mut reader = ArchiveBuilder::new()
        .backend(&backend)
        .hashers(hashers)
        .open("r.tar")
        .unwrap();
    assert_eq!(reader.state().kind(), AuxKind::Paths);
    assert_eq!(reader.state().capacity(), 256);
    reader
        .state_mut()
        .paths_mut()
        .unwrap()
        .record(PathBuf::from("etc/passwd"), PathBuf::from("/x/etc/passwd"))
        .unwrap();
    assert!(PATH_HASH_CALLS.load(Ordering::SeqCst) > 0);
    assert_eq!(DEVICE_HASH_CALLS.load(Ordering::SeqCst), 0);
    reader.close().into_result().unwrap();

    let path_calls = PATH_HASH_CALLS.load(Ordering::SeqCst);
    let mut writer = ArchiveBuilder::new()
        .flags(OFlag::O_WRONLY | OFlag::O_CREAT)
        .backend(&backend)
        .hashers(hashers)
        .open("w.tar")
        .unwrap();
    assert_eq!(writer.state().kind(), AuxKind::Devices);
    assert_eq!(writer.state().capacity(), 16);
    writer
        .state_mut()
        .devices_mut()
        .unwrap()
        .record(3, 42, Path::new("bin/sh"))
        .unwrap();
    assert!(DEVICE_HASH_CALLS.load(Ordering::SeqCst) > 0);
    assert_eq!(PATH_HASH_CALLS.load(Ordering::SeqCst), path_calls);
    writer.close().into_result().unwrap();
}

#[test]
fn test_overwrite_protection_adds_exclusive_create() {
    let backend = RecordingBackend::default();

    let archive = Archive::open(
        "new.tar",
        Some(&backend as &dyn Backend),
        OFlag::O_WRONLY | OFlag::O_CREAT,
        create_mode(),
        Options::NO_OVERWRITE,
    )
    .unwrap();
    assert!(backend.last_flags().unwrap().contains(OFlag::O_EXCL));
    archive.close().into_result().unwrap();

    let archive = Archive::open(
        "new.tar",
        Some(&backend as &dyn Backend),
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        create_mode(),
        Options::GNU | Options::VERBOSE,
    )
    .unwrap();
    assert!(!backend.last_flags().unwrap().contains(OFlag::O_EXCL));
    assert_eq!(archive.flags(), OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC);
    archive.close().into_result().unwrap();

    // Without O_CREAT there is nothing to protect.
    let archive = Archive::open(
        "new.tar",
        Some(&backend as &dyn Backend),
        OFlag::O_WRONLY,
        create_mode(),
        Options::NO_OVERWRITE,
    )
    .unwrap();
    assert!(!backend.last_flags().unwrap().contains(OFlag::O_EXCL));
    archive.close().into_result().unwrap();
}

#[test]
fn test_close_runs_once_even_when_backend_close_fails() {
    let backend = RecordingBackend::failing_close();
    let mut archive = Archive::open(
        "c.tar",
        Some(&backend as &dyn Backend),
        OFlag::O_WRONLY | OFlag::O_CREAT,
        create_mode(),
        Options::empty(),
    )
    .unwrap();
    archive
        .state_mut()
        .devices_mut()
        .unwrap()
        .record(1, 2, Path::new("a"))
        .unwrap();

    let report = archive.close();
    assert_eq!(backend.closes(), 1);
    assert_eq!(report.teardown.kind, AuxKind::Devices);
    assert_eq!(report.teardown.entries, 1);
    assert_eq!(report.teardown.nested, 1);
    match report.into_result() {
        Err(Error::Backend { op, .. }) => assert_eq!(op, "close"),
        other => panic!("expected a backend close error, got {other:?}"),
    }
    // The stream was still released.
    assert_eq!(backend.inner.open_descriptors(), 0);
}

#[test]
fn test_adopted_descriptor_skips_backend_open() {
    let backend = RecordingBackend::default();
    let archive = Archive::from_descriptor(
        42,
        "adopted.tar",
        Some(&backend as &dyn Backend),
        OFlag::O_RDONLY,
        Mode::empty(),
        Options::empty(),
    )
    .unwrap();

    assert_eq!(backend.opens(), 0);
    assert_eq!(archive.descriptor(), 42);
    assert_eq!(archive.pathname(), Path::new("adopted.tar"));
    assert_eq!(archive.access_mode(), AccessMode::Read);

    // The backend never handed out 42, so its close reports a bad descriptor.
    let report = archive.close();
    assert_eq!(backend.closes(), 1);
    assert_eq!(report.teardown.kind, AuxKind::Paths);
    assert!(!report.is_ok());
}

#[test]
fn test_existing_archive_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.tar");
    fs::write(&path, b"precious").unwrap();

    let err = Archive::open(
        &path,
        None,
        OFlag::O_WRONLY | OFlag::O_CREAT,
        create_mode(),
        Options::NO_OVERWRITE,
    )
    .unwrap_err();

    assert!(matches!(err, Error::Backend { op: "open", .. }));
    assert_eq!(err.io_kind(), Some(io::ErrorKind::AlreadyExists));
    assert_eq!(fs::read(&path).unwrap(), b"precious");
}

#[test]
fn test_read_only_open_builds_path_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b.tar");
    fs::write(&path, vec![0u8; 2 * BLOCK_SIZE]).unwrap();

    let mut archive =
        Archive::open(&path, None, OFlag::O_RDONLY, Mode::empty(), Options::empty()).unwrap();
    assert_eq!(archive.state().kind(), AuxKind::Paths);
    assert_eq!(archive.state().capacity(), 256);

    let mut block = [1u8; BLOCK_SIZE];
    assert_eq!(archive.read_block(&mut block).unwrap(), BLOCK_SIZE);
    assert!(block.iter().all(|&b| b == 0));
    archive.close().into_result().unwrap();
}

#[test]
fn test_write_only_close_tears_down_device_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c.tar");
    let backend = RecordingBackend::default();

    let mut archive = ArchiveBuilder::new()
        .flags(OFlag::O_WRONLY | OFlag::O_CREAT)
        .backend(&backend)
        .open(&path)
        .unwrap();
    let devices = archive.state_mut().devices_mut().unwrap();
    assert_eq!(devices.capacity(), 16);
    assert_eq!(devices.record(5, 9, Path::new("one")).unwrap(), None);
    assert_eq!(
        devices.record(5, 9, Path::new("two")).unwrap(),
        Some(PathBuf::from("one"))
    );

    let report = archive.close();
    assert!(report.is_ok());
    assert_eq!(backend.closes(), 1);
    assert_eq!(report.teardown.kind, AuxKind::Devices);
    assert_eq!(report.teardown.nested, 1);
}

#[test]
fn test_adopting_a_real_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fd.tar");
    fs::write(&path, vec![9u8; BLOCK_SIZE]).unwrap();
    let fd = fs::File::open(&path).unwrap().into_raw_fd();

    let mut archive =
        Archive::from_descriptor(fd, &path, None, OFlag::O_RDONLY, Mode::empty(), Options::empty())
            .unwrap();
    assert_eq!(archive.descriptor(), fd);

    let mut block = [0u8; BLOCK_SIZE];
    assert_eq!(archive.read_block(&mut block).unwrap(), BLOCK_SIZE);
    assert_eq!(block[0], 9);
    archive.close().into_result().unwrap();
}

#[test]
fn test_compressed_backend_behind_a_handle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("z.tar.gz");
    let gzip = CompressedBackend::new(Codec::Gzip);

    let mut writer = ArchiveBuilder::new()
        .flags(OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC)
        .backend(&gzip)
        .open(&path)
        .unwrap();
    let mut block = [0u8; BLOCK_SIZE];
    block[..4].copy_from_slice(b"head");
    for _ in 0..8 {
        writer.write_block(&block).unwrap();
    }
    writer.close().into_result().unwrap();

    let on_disk = fs::read(&path).unwrap();
    assert_eq!(&on_disk[..2], &[0x1f, 0x8b]);
    assert!(on_disk.len() < 8 * BLOCK_SIZE);

    let mut reader = ArchiveBuilder::new().backend(&gzip).open(&path).unwrap();
    let mut count = 0;
    let mut got = [0u8; BLOCK_SIZE];
    while reader.read_block(&mut got).unwrap() == BLOCK_SIZE {
        assert_eq!(got, block);
        count += 1;
    }
    assert_eq!(count, 8);
    reader.close().into_result().unwrap();
}

#[test]
fn test_compressed_pipe_reader_and_writer_share_a_backend() {
    let gzip = Arc::new(CompressedBackend::new(Codec::Gzip));
    let mut fds: [Descriptor; 2] = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let [read_end, write_end] = fds;

    let (tx, rx) = mpsc::channel();
    let reader_backend = Arc::clone(&gzip);
    thread::spawn(move || {
        let mut reader = Archive::from_descriptor(
            read_end,
            "pipe-r",
            Some(&*reader_backend),
            OFlag::O_RDONLY,
            Mode::empty(),
            Options::empty(),
        )
        .unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        let mut count = 0;
        while reader.read_block(&mut block).unwrap() == BLOCK_SIZE {
            count += 1;
        }
        reader.close().into_result().unwrap();
        tx.send(count).unwrap();
    });

    let mut writer = Archive::from_descriptor(
        write_end,
        "pipe-w",
        Some(&*gzip),
        OFlag::O_WRONLY,
        Mode::empty(),
        Options::empty(),
    )
    .unwrap();
    let block = [7u8; BLOCK_SIZE];
    for _ in 0..4 {
        writer.write_block(&block).unwrap();
    }
    writer.close().into_result().unwrap();

    let count = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(count, 4);
}
