use super::{Backend, Descriptor, DescriptorIo, RawBackend};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;
use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

const XZ_PRESET: u32 = 6;

/// A compression format that can be layered over a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Gzip,
    Xz,
    Zstd,
}

impl Codec {
    /// Picks a codec from the extension of `path`, if it names one.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "gz" | "gzip" | "tgz" => Some(Self::Gzip),
            "xz" | "txz" => Some(Self::Xz),
            "zst" | "zstd" | "tzst" => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    fn decoder<R: Read + Send + 'static>(self, inner: R) -> io::Result<Box<dyn Read + Send>> {
        Ok(match self {
            Self::Gzip => Box::new(MultiGzDecoder::new(inner)),
            Self::Xz => Box::new(XzDecoder::new_multi_decoder(inner)),
            Self::Zstd => Box::new(ZstdDecoder::new(inner)?),
        })
    }

    fn encoder<W: Write>(self, inner: W) -> io::Result<Encoder<W>> {
        Ok(match self {
            Self::Gzip => Encoder::Gzip(GzEncoder::new(inner, Compression::default())),
            Self::Xz => Encoder::Xz(XzEncoder::new(inner, XZ_PRESET)),
            Self::Zstd => Encoder::Zstd(ZstdEncoder::new(inner, zstd::DEFAULT_COMPRESSION_LEVEL)?),
        })
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Encoder<W: Write> {
    Gzip(GzEncoder<W>),
    Xz(XzEncoder<W>),
    Zstd(ZstdEncoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    /// Writes the trailing frame data and hands back the inner writer.
    fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(e) => e.finish(),
            Self::Xz(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(e) => e.write(buf),
            Self::Xz(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(e) => e.flush(),
            Self::Xz(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

enum CodecStream<B: Backend> {
    Decode(Box<dyn Read + Send>),
    Encode(Encoder<DescriptorIo<Arc<B>>>),
}

/// One descriptor's codec stream, built on first use when empty.
type StreamSlot<B> = Arc<Mutex<Option<CodecStream<B>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Compresses or decompresses every stream of an inner backend.
///
/// Read-only descriptors decompress what the inner backend yields; write-only
/// descriptors compress before handing bytes down and finish the frame on
/// `close`. A descriptor this backend did not open itself gets its codec
/// stream on first use, so adopted descriptors work too.
///
/// Each descriptor has its own lock; a handle blocked in I/O never holds up
/// handles on other descriptors. Concatenated gzip members and xz streams are
/// read back as one stream, as are appended zstd frames.
pub struct CompressedBackend<B: Backend + 'static = RawBackend> {
    codec: Codec,
    inner: Arc<B>,
    streams: Mutex<HashMap<Descriptor, StreamSlot<B>>>,
}

impl CompressedBackend<RawBackend> {
    /// Layers `codec` over the platform's raw file primitives.
    pub fn new(codec: Codec) -> Self {
        Self::with_inner(codec, RawBackend)
    }
}

impl<B: Backend + 'static> CompressedBackend<B> {
    pub fn with_inner(codec: Codec, inner: B) -> Self {
        Self::with_shared_inner(codec, Arc::new(inner))
    }

    /// Layers `codec` over a backend that is also used elsewhere.
    pub fn with_shared_inner(codec: Codec, inner: Arc<B>) -> Self {
        Self {
            codec,
            inner,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<Descriptor, StreamSlot<B>>> {
        lock(&self.streams)
    }

    /// The slot for `fd`, registering an empty one if the descriptor is new.
    /// The map lock is released before the caller touches the stream.
    fn slot(&self, fd: Descriptor) -> StreamSlot<B> {
        let mut streams = self.streams();
        Arc::clone(streams.entry(fd).or_default())
    }

    fn decode_stream(&self, fd: Descriptor) -> io::Result<CodecStream<B>> {
        let source = DescriptorIo::new(Arc::clone(&self.inner), fd);
        Ok(CodecStream::Decode(self.codec.decoder(source)?))
    }

    fn encode_stream(&self, fd: Descriptor) -> io::Result<CodecStream<B>> {
        let sink = DescriptorIo::new(Arc::clone(&self.inner), fd);
        Ok(CodecStream::Encode(self.codec.encoder(sink)?))
    }
}

impl<B: Backend + 'static> fmt::Debug for CompressedBackend<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedBackend")
            .field("codec", &self.codec)
            .field("streams", &self.streams().len())
            .finish()
    }
}

impl<B: Backend + 'static> Backend for CompressedBackend<B> {
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> io::Result<Descriptor> {
        let access = flags & OFlag::O_ACCMODE;
        if access == OFlag::O_RDWR {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "compressed streams are either read or written, not both",
            ));
        }

        let fd = self.inner.open(path, flags, mode)?;
        let stream = if access == OFlag::O_WRONLY {
            self.encode_stream(fd)
        } else {
            self.decode_stream(fd)
        };
        match stream {
            Ok(stream) => {
                self.streams()
                    .insert(fd, Arc::new(Mutex::new(Some(stream))));
                debug!(codec = %self.codec, fd, path = %path.display(), "opened compressed stream");
                Ok(fd)
            }
            Err(e) => {
                self.inner.close(fd).ok();
                Err(e)
            }
        }
    }

    fn close(&self, fd: Descriptor) -> io::Result<()> {
        let slot = self.streams().remove(&fd);
        let stream = match slot {
            Some(slot) => {
                let mut stream = lock(&slot);
                stream.take()
            }
            None => None,
        };
        let finished = match stream {
            Some(CodecStream::Encode(encoder)) => encoder.finish().map(drop),
            Some(CodecStream::Decode(_)) | None => Ok(()),
        };
        let closed = self.inner.close(fd);
        finished.and(closed)
    }

    fn read(&self, fd: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        let slot = self.slot(fd);
        let mut stream = lock(&slot);
        if stream.is_none() {
            *stream = Some(self.decode_stream(fd)?);
        }
        match stream.as_mut() {
            Some(CodecStream::Decode(decoder)) => decoder.read(buf),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    fn write(&self, fd: Descriptor, buf: &[u8]) -> io::Result<usize> {
        let slot = self.slot(fd);
        let mut stream = lock(&slot);
        if stream.is_none() {
            *stream = Some(self.encode_stream(fd)?);
        }
        match stream.as_mut() {
            Some(CodecStream::Encode(encoder)) => encoder.write(buf),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}
