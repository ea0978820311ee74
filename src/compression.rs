use crate::error::{DiskError, Result};
use flate2::read::MultiGzDecoder;
use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression formats recognized from stream content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    /// Detect the format from the first bytes of a stream.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if magic.starts_with(&BZIP2_MAGIC) {
            Compression::Bzip2
        } else if magic.starts_with(&XZ_MAGIC) {
            Compression::Xz
        } else if magic.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// Conventional file suffix, without the dot.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gz"),
            Compression::Bzip2 => Some("bz2"),
            Compression::Xz => Some("xz"),
            Compression::Zstd => Some("zst"),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension().unwrap_or("none"))
    }
}

/// Split a trailing compression suffix off `name`.
///
/// `"disk.qcow2.xz"` becomes `("disk.qcow2", Some(Xz))`; names without a
/// known suffix come back unchanged.
pub fn strip_compression_suffix(name: &str) -> (&str, Option<Compression>) {
    for kind in [
        Compression::Gzip,
        Compression::Bzip2,
        Compression::Xz,
        Compression::Zstd,
    ] {
        if let Some(ext) = kind.extension() {
            if let Some(stem) = name
                .strip_suffix(ext)
                .and_then(|rest| rest.strip_suffix('.'))
            {
                return (stem, Some(kind));
            }
        }
    }
    (name, None)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// A decompressing reader that remembers whether the codec itself failed.
///
/// Archive and copy layers wrap I/O errors from their source; the shared
/// flag lets callers tell a corrupt stream apart from a failure downstream.
pub struct Decoder<'a> {
    inner: Box<dyn Read + 'a>,
    failed: Rc<Cell<bool>>,
}

impl<'a> Decoder<'a> {
    /// Handle that reports codec failures after the decoder has been moved.
    pub fn failure_flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.failed)
    }
}

impl Read for Decoder<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.failed.set(true))
    }
}

/// Peek at `reader`, detect its compression and wrap it in the matching
/// decoder. Unrecognized content is passed through untouched.
///
/// Concatenated members and streams (as written by `pigz`, `pbzip2` or
/// `xz -T`) decode as one continuous stream.
pub fn auto_decoder<'a, R: BufRead + 'a>(mut reader: R) -> io::Result<(Decoder<'a>, Compression)> {
    let kind = Compression::detect(reader.fill_buf()?);
    let inner: Box<dyn Read + 'a> = match kind {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
    };
    Ok((
        Decoder {
            inner,
            failed: Rc::new(Cell::new(false)),
        },
        kind,
    ))
}

/// Detect the compression of the file at `path` from its first bytes.
pub fn sniff(path: &Path) -> Result<Compression> {
    let mut magic = Vec::with_capacity(XZ_MAGIC.len());
    File::open(path)
        .and_then(|f| f.take(XZ_MAGIC.len() as u64).read_to_end(&mut magic))
        .map_err(|source| DiskError::Decompress {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Compression::detect(&magic))
}

/// Open `path` and return a decoder over its (possibly compressed) content.
pub fn open_decoded(path: &Path) -> Result<(Decoder<'static>, Compression)> {
    let decompress_err = |source| DiskError::Decompress {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(decompress_err)?;
    let (decoder, kind) = auto_decoder(BufReader::new(file)).map_err(decompress_err)?;
    debug!(path = %path.display(), compression = %kind, "opened decoder");
    Ok((decoder, kind))
}

/// Stream `src` through auto-detected decompression into `dst`.
///
/// Bytes go to a temp file next to `dst` that is renamed into place once
/// complete, so `dst` never holds a partial image. Every failure is reported
/// against `src`.
pub fn decompress_file(src: &Path, dst: &Path) -> Result<Compression> {
    let decompress_err = |source| DiskError::Decompress {
        path: src.to_path_buf(),
        source,
    };
    let (mut decoder, kind) = open_decoded(src)?;

    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".decompress-")
        .tempfile_in(dir)
        .map_err(decompress_err)?;

    io::copy(&mut decoder, tmp.as_file_mut()).map_err(decompress_err)?;
    tmp.as_file().sync_all().map_err(decompress_err)?;
    tmp.persist(dst).map_err(|e| decompress_err(e.error))?;

    debug!(
        src = %src.display(),
        dst = %dst.display(),
        compression = %kind,
        "decompressed file",
    );
    Ok(kind)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
