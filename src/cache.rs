use crate::error::{DiskError, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

// ---------------------------------------------------------------------------
// Digest / BlobInfo
// ---------------------------------------------------------------------------

/// A content digest such as `sha256:abcdef…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// SHA-256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hex: hex_encode(&Sha256::digest(data)),
        }
    }
}

impl FromStr for Digest {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DiskError::InvalidDigest(s.to_string());
        let (algorithm, hex) = s.split_once(':').ok_or_else(invalid)?;
        let algo_ok = !algorithm.is_empty()
            && algorithm
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b));
        // Lowercase only; the hex is used verbatim as a file name.
        let hex_ok = !hex.is_empty()
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !algo_ok || !hex_ok {
            return Err(invalid());
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Descriptor of fetched content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: Digest,
    /// Size in bytes, as advertised by the manifest.
    pub size: u64,
    /// OCI media type (e.g. "application/vnd.oci.image.layer.v1.tar+gzip").
    pub media_type: String,
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Canonical path of a blob inside an OCI layout rooted at `root`:
/// `root/blobs/<algorithm>/<hex>`.
pub fn local_blob_path(root: &Path, blob: &BlobInfo) -> PathBuf {
    root.join("blobs")
        .join(blob.digest.algorithm())
        .join(blob.digest.hex())
}

/// Content-addressed blob store laid out like an OCI image directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, blob: &BlobInfo) -> PathBuf {
        local_blob_path(&self.root, blob)
    }

    /// Check whether a blob for `blob.digest` already exists on disk.
    pub fn has_blob(&self, blob: &BlobInfo) -> bool {
        self.blob_path(blob).is_file()
    }

    /// Stream `reader` into the store under `blob.digest`. Returns the path.
    ///
    /// Content lands in a temp file first and is renamed into place only
    /// after the digest checks out, so concurrent writers of the same digest
    /// never observe a partial blob.
    pub fn store_blob(&self, blob: &BlobInfo, mut reader: impl Read) -> Result<PathBuf> {
        let path = self.blob_path(blob);
        let dir = path
            .parent()
            .ok_or_else(|| DiskError::InvalidDigest(blob.digest.to_string()))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(dir)?;

        let actual = if blob.digest.algorithm() == "sha256" {
            let mut hasher = HashingWriter {
                inner: tmp.as_file_mut(),
                hasher: Sha256::new(),
            };
            io::copy(&mut reader, &mut hasher)?;
            Some(hex_encode(&hasher.hasher.finalize()))
        } else {
            io::copy(&mut reader, tmp.as_file_mut())?;
            None
        };

        match actual {
            Some(actual) if actual != blob.digest.hex() => {
                return Err(DiskError::DigestMismatch {
                    expected: blob.digest.hex().to_string(),
                    actual,
                });
            }
            Some(_) => {}
            None => debug!(digest = %blob.digest, "unverified digest algorithm"),
        }

        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| DiskError::Io(e.error))?;
        debug!(path = %path.display(), "stored blob");
        Ok(path)
    }

    /// Read a small blob (manifest, index) fully into memory.
    pub fn read_blob(&self, blob: &BlobInfo) -> Result<Vec<u8>> {
        Ok(fs::read(self.blob_path(blob))?)
    }
}

/// Writer that feeds everything it writes through a hasher.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
