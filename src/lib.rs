//! Acquire pre-built VM disk images distributed as OCI content.
//!
//! A pull resolves the versioned image reference, fetches the compressed
//! disk archive from a registry (or reads it from a local OCI directory),
//! unpacks the single disk image it contains and decompresses it into a
//! per-instance file name.

pub mod cache;
pub mod compression;
pub mod config;
pub mod disker;
pub mod error;
pub mod manifest;
pub mod naming;
pub mod reference;
pub mod registry;
pub mod unpack;
pub mod version;
pub mod vmfile;

pub use cache::{BlobInfo, BlobStore, Digest};
pub use config::ImageSourceConfig;
pub use disker::{DiskTarget, Disker, OciKind, OciOptions};
pub use error::{DiskError, Result};
pub use reference::{strip_transport_prefix, ImageFormat, ImageSource, ReferenceBuilder};
pub use registry::{OciFetcher, RegistryClient};
pub use version::{resolve_version, OsVersion};
pub use vmfile::VmFile;

use std::path::PathBuf;
use tracing::info;

/// What to pull and where to put it.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub format: ImageFormat,
    /// VM the disk is for.
    pub instance: String,
    /// Directory the final disk image is written to.
    pub image_dir: PathBuf,
    pub opts: OciOptions,
    /// User-supplied registry reference, `docker://` prefix allowed.
    pub user_image: Option<String>,
}

/// Disk image client: resolves references, pulls into a shared blob store
/// and produces per-instance disk files.
pub struct DiskPuller {
    builder: ReferenceBuilder,
    store: BlobStore,
}

impl DiskPuller {
    /// Create a puller that caches blobs under `store_root`.
    pub fn new(config: ImageSourceConfig, store_root: impl Into<PathBuf>) -> Self {
        Self {
            builder: ReferenceBuilder::new(config),
            store: BlobStore::new(store_root),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Resolve where `req` pulls from.
    pub fn resolve_source(&self, req: &PullRequest) -> Result<ImageSource> {
        let version = resolve_version(self.builder.config().dev_override);
        self.builder
            .resolve(&version, req.format, &req.opts, req.user_image.as_deref())
    }

    /// Build the disker for `req` without touching the network or disk.
    pub fn disker(&self, req: &PullRequest, fetcher: Box<dyn OciFetcher>) -> Result<Disker> {
        let source = self.resolve_source(req)?;
        info!(kind = %source.kind(), instance = %req.instance, "selected disk image source");
        Ok(Disker::from_source(
            source,
            DiskTarget {
                image_dir: req.image_dir.clone(),
                instance: req.instance.clone(),
            },
            self.store.clone(),
            fetcher,
        ))
    }

    /// Pull `req` through the default registry client.
    pub fn pull(&self, req: &PullRequest) -> Result<VmFile> {
        self.pull_with(req, Box::new(RegistryClient::new()?))
    }

    /// Pull `req` through `fetcher`.
    pub fn pull_with(&self, req: &PullRequest, fetcher: Box<dyn OciFetcher>) -> Result<VmFile> {
        self.disker(req, fetcher)?.pull_disk()
    }
}
