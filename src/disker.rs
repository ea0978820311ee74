use crate::cache::{BlobInfo, BlobStore};
use crate::compression::{decompress_file, sniff, strip_compression_suffix, Compression};
use crate::error::{DiskError, Result};
use crate::manifest::{ImageIndex, OciManifest};
use crate::naming::name_per_instance;
use crate::reference::ImageSource;
use crate::registry::OciFetcher;
use crate::unpack::unpack_disk_archive;
use crate::vmfile::VmFile;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, error, info};

// ---------------------------------------------------------------------------
// OciKind / OciOptions
// ---------------------------------------------------------------------------

/// Which kind of source a disk image is pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OciKind {
    /// Local OCI directory.
    Directory,
    /// Remote registry.
    Registry,
    #[default]
    Unknown,
}

impl OciKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OciKind::Directory => "oci-dir",
            OciKind::Registry => "docker",
            OciKind::Unknown => "unknown",
        }
    }

    pub fn is_oci_dir(&self) -> bool {
        *self == OciKind::Directory
    }
}

impl fmt::Display for OciKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OciKind {
    type Err = std::convert::Infallible;

    /// Unrecognized input maps to [`OciKind::Unknown`].
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "oci-dir" => OciKind::Directory,
            "docker" => OciKind::Registry,
            _ => OciKind::Unknown,
        })
    }
}

/// Caller overrides that bypass default reference resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OciOptions {
    pub kind: Option<OciKind>,
    pub dir: Option<PathBuf>,
}

impl OciOptions {
    /// A directory kind needs a directory.
    pub fn validate(&self) -> Result<()> {
        match (self.kind, &self.dir) {
            (Some(OciKind::Directory), None) => Err(DiskError::Config(
                "oci-dir kind requires a directory".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Disker
// ---------------------------------------------------------------------------

/// Where the final disk lands and which VM it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTarget {
    /// Directory the archive is unpacked into.
    pub image_dir: PathBuf,
    /// VM name used to make the final file name unique.
    pub instance: String,
}

/// A disk image source. The variant is fixed at construction.
pub enum Disker {
    Registry(RegistryDisker),
    Directory(DirectoryDisker),
}

impl Disker {
    /// Build the disker matching `source`.
    pub fn from_source(
        source: ImageSource,
        target: DiskTarget,
        store: BlobStore,
        fetcher: Box<dyn OciFetcher>,
    ) -> Self {
        match source {
            ImageSource::Registry(reference) => Disker::Registry(RegistryDisker {
                reference,
                store,
                target,
                fetcher,
                blob: None,
            }),
            ImageSource::Directory(dir) => Disker::Directory(DirectoryDisker { dir, target }),
        }
    }

    /// Build a disker from an explicit kind and location (a reference for
    /// registries, a path for directories). [`OciKind::Unknown`] is rejected.
    pub fn from_kind(
        kind: OciKind,
        location: &str,
        target: DiskTarget,
        store: BlobStore,
        fetcher: Box<dyn OciFetcher>,
    ) -> Result<Self> {
        let source = match kind {
            OciKind::Registry => ImageSource::Registry(
                crate::reference::strip_transport_prefix(location).to_string(),
            ),
            OciKind::Directory => ImageSource::Directory(PathBuf::from(location)),
            OciKind::Unknown => return Err(DiskError::UnknownKind(location.to_string())),
        };
        Ok(Self::from_source(source, target, store, fetcher))
    }

    pub fn kind(&self) -> OciKind {
        match self {
            Disker::Registry(_) => OciKind::Registry,
            Disker::Directory(_) => OciKind::Directory,
        }
    }

    /// Make the compressed artifact available locally.
    pub fn pull(&mut self) -> Result<()> {
        match self {
            Disker::Registry(d) => d.pull(),
            Disker::Directory(d) => d.pull(),
        }
    }

    /// Unpack the pulled artifact into the target image directory.
    pub fn unpack(&self) -> Result<VmFile> {
        match self {
            Disker::Registry(d) => d.unpack(),
            Disker::Directory(d) => d.unpack(),
        }
    }

    /// Decompress an unpacked disk into its final per-instance location.
    pub fn decompress(&self, compressed: &VmFile) -> Result<VmFile> {
        decompress_to_instance(compressed, self.target())
    }

    /// Human-readable description of the source, for logs and errors.
    pub fn disk_endpoint(&self) -> String {
        match self {
            Disker::Registry(d) => d.reference.clone(),
            Disker::Directory(d) => d.dir.display().to_string(),
        }
    }

    fn target(&self) -> &DiskTarget {
        match self {
            Disker::Registry(d) => &d.target,
            Disker::Directory(d) => &d.target,
        }
    }

    /// Pull, unpack and decompress in one go, returning the final disk.
    pub fn pull_disk(&mut self) -> Result<VmFile> {
        let endpoint = self.disk_endpoint();
        debug!(kind = %self.kind(), %endpoint, "pulling disk image");
        self.pull()?;

        debug!(%endpoint, "unpacking disk image");
        let unpacked = self.unpack()?;

        debug!(path = %unpacked.path().display(), "decompressing disk image");
        let disk = self.decompress(&unpacked)?;
        info!(%endpoint, path = %disk.path().display(), "disk image ready");
        Ok(disk)
    }
}

// ---------------------------------------------------------------------------
// Registry variant
// ---------------------------------------------------------------------------

/// Pulls through an [`OciFetcher`] into a content-addressed blob store.
pub struct RegistryDisker {
    reference: String,
    store: BlobStore,
    target: DiskTarget,
    fetcher: Box<dyn OciFetcher>,
    blob: Option<BlobInfo>,
}

impl RegistryDisker {
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Blob recorded by the last successful pull.
    pub fn blob(&self) -> Option<&BlobInfo> {
        self.blob.as_ref()
    }

    fn pull(&mut self) -> Result<()> {
        let blob = self.fetcher.fetch(&self.reference, &self.store)?;
        debug!(
            reference = %self.reference,
            digest = %blob.digest,
            path = %self.store.blob_path(&blob).display(),
            "disk archive available",
        );
        self.blob = Some(blob);
        Ok(())
    }

    fn unpack(&self) -> Result<VmFile> {
        let blob = self
            .blob
            .as_ref()
            .ok_or_else(|| DiskError::NotPulled(self.reference.clone()))?;
        unpack_disk_archive(&self.store.blob_path(blob), &self.target.image_dir)
    }
}

// ---------------------------------------------------------------------------
// Directory variant
// ---------------------------------------------------------------------------

/// Reads the disk archive from a local OCI directory (or archive file).
pub struct DirectoryDisker {
    dir: PathBuf,
    target: DiskTarget,
}

impl DirectoryDisker {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Content is already local; only check that it is there.
    fn pull(&mut self) -> Result<()> {
        if self.dir.exists() {
            Ok(())
        } else {
            Err(DiskError::fetch(
                self.dir.display().to_string(),
                "OCI directory does not exist",
            ))
        }
    }

    fn unpack(&self) -> Result<VmFile> {
        let archive = self.locate_archive()?;
        unpack_disk_archive(&archive, &self.target.image_dir)
    }

    /// Find the disk archive: the first layer of the layout's only manifest,
    /// or the single regular file when the directory is not an OCI layout.
    fn locate_archive(&self) -> Result<PathBuf> {
        if self.dir.is_file() {
            return Ok(self.dir.clone());
        }

        let index_path = self.dir.join("index.json");
        if index_path.is_file() {
            let store = BlobStore::new(&self.dir);
            let index: ImageIndex = serde_json::from_slice(&fs::read(&index_path)?)?;
            let manifest_blob = index.single_manifest()?.blob_info()?;
            let manifest: OciManifest = serde_json::from_slice(&store.read_blob(&manifest_blob)?)?;
            let layer = manifest.disk_layer()?.blob_info()?;
            let path = store.blob_path(&layer);
            if !path.is_file() {
                return Err(DiskError::NotFound(path.display().to_string()));
            }
            return Ok(path);
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        match files.len() {
            1 => Ok(files.remove(0)),
            n => Err(DiskError::NotFound(format!(
                "{}: expected an OCI layout or a single archive, found {} files",
                self.dir.display(),
                n
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Decompression into place
// ---------------------------------------------------------------------------

fn decompress_to_instance(compressed: &VmFile, target: &DiskTarget) -> Result<VmFile> {
    let src = compressed.path();
    let decompress_err = |source| DiskError::Decompress {
        path: src.to_path_buf(),
        source,
    };
    let name = src.file_name().ok_or_else(|| {
        DiskError::Config(format!("{} has no file name", src.display()))
    })?;
    let stripped = match name.to_str() {
        Some(name) => OsStr::new(strip_compression_suffix(name).0),
        None => name,
    };
    let final_path = name_per_instance(&target.image_dir.join(stripped), &target.instance);

    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent).map_err(decompress_err)?;
    }

    if final_path == src {
        return Ok(VmFile::new(final_path));
    }

    if sniff(src)? == Compression::None {
        fs::rename(src, &final_path).map_err(decompress_err)?;
        debug!(path = %final_path.display(), "disk image was not compressed");
        return Ok(VmFile::new(final_path));
    }

    decompress_file(src, &final_path)?;
    if let Err(e) = fs::remove_file(src) {
        error!(
            path = %src.display(),
            error = %e,
            "failed to remove compressed disk image",
        );
    }
    Ok(VmFile::new(final_path))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Digest;
    use std::cell::Cell;
    use std::io::Write;
    use std::rc::Rc;

    fn target(dir: &Path) -> DiskTarget {
        DiskTarget {
            image_dir: dir.to_path_buf(),
            instance: "vm1".to_string(),
        }
    }

    /// Fetcher that serves a fixed blob and counts calls.
    struct StaticFetcher {
        data: Vec<u8>,
        calls: Rc<Cell<usize>>,
    }

    impl OciFetcher for StaticFetcher {
        fn fetch(&self, _reference: &str, store: &BlobStore) -> Result<BlobInfo> {
            self.calls.set(self.calls.get() + 1);
            let info = BlobInfo {
                digest: Digest::sha256_of(&self.data),
                size: self.data.len() as u64,
                media_type: "application/x-tar".to_string(),
            };
            store.store_blob(&info, &self.data[..])?;
            Ok(info)
        }
    }

    struct FailingFetcher;

    impl OciFetcher for FailingFetcher {
        fn fetch(&self, reference: &str, _store: &BlobStore) -> Result<BlobInfo> {
            Err(DiskError::fetch(reference, "registry unavailable"))
        }
    }

    /// Reports a blob it never wrote to the store.
    struct UnstoredFetcher;

    impl OciFetcher for UnstoredFetcher {
        fn fetch(&self, _reference: &str, _store: &BlobStore) -> Result<BlobInfo> {
            Ok(BlobInfo {
                digest: Digest::sha256_of(b"never stored"),
                size: 12,
                media_type: "application/x-xz".to_string(),
            })
        }
    }

    fn disk_tar(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data).unwrap();
        builder.into_inner().unwrap()
    }

    fn zstd_bytes(data: &[u8]) -> Vec<u8> {
        zstd::encode_all(data, 1).unwrap()
    }

    #[test]
    fn kind_strings() {
        assert_eq!("oci-dir".parse::<OciKind>().unwrap(), OciKind::Directory);
        assert_eq!("docker".parse::<OciKind>().unwrap(), OciKind::Registry);
        assert_eq!("".parse::<OciKind>().unwrap(), OciKind::Unknown);
        assert_eq!("oci".parse::<OciKind>().unwrap(), OciKind::Unknown);
        assert_eq!(OciKind::default(), OciKind::Unknown);
        assert!(OciKind::Directory.is_oci_dir());
        assert_eq!(OciKind::Registry.to_string(), "docker");
    }

    #[test]
    fn options_validate_directory_needs_path() {
        let bad = OciOptions {
            kind: Some(OciKind::Directory),
            dir: None,
        };
        assert!(bad.validate().is_err());
        assert!(OciOptions::default().validate().is_ok());
    }

    #[test]
    fn from_kind_rejects_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let result = Disker::from_kind(
            OciKind::Unknown,
            "quay.io/x/y:1",
            target(tmp.path()),
            BlobStore::new(tmp.path()),
            Box::new(FailingFetcher),
        );
        assert!(matches!(result, Err(DiskError::UnknownKind(_))));
    }

    #[test]
    fn registry_unpack_before_pull_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let disker = Disker::from_source(
            ImageSource::Registry("quay.io/x/y:1".to_string()),
            target(tmp.path()),
            BlobStore::new(tmp.path()),
            Box::new(FailingFetcher),
        );
        assert!(matches!(disker.unpack(), Err(DiskError::NotPulled(_))));
        assert_eq!(disker.disk_endpoint(), "quay.io/x/y:1");
    }

    #[test]
    fn registry_fetch_error_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let mut disker = Disker::from_kind(
            OciKind::Registry,
            "docker://quay.io/x/y:1",
            target(tmp.path()),
            BlobStore::new(tmp.path()),
            Box::new(FailingFetcher),
        )
        .unwrap();
        assert_eq!(disker.disk_endpoint(), "quay.io/x/y:1");
        assert!(matches!(disker.pull(), Err(DiskError::Fetch { .. })));
    }

    #[test]
    fn missing_blob_reports_archive_and_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let images = tmp.path().join("images");
        let store = BlobStore::new(tmp.path().join("store"));
        let mut disker = Disker::from_source(
            ImageSource::Registry("quay.io/x/y:1".to_string()),
            target(&images),
            store.clone(),
            Box::new(UnstoredFetcher),
        );

        disker.pull().unwrap();
        let err = disker.unpack().unwrap_err();
        match &err {
            DiskError::Unpack { archive, dest, .. } => {
                assert_eq!(archive.parent(), Some(store.root().join("blobs/sha256").as_path()));
                assert_eq!(dest, &images);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains(&images.display().to_string()), "{err}");
    }

    #[test]
    fn uncompressed_member_is_renamed_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let images = tmp.path().join("images");
        let mut disker = Disker::from_source(
            ImageSource::Registry("quay.io/x/y:1".to_string()),
            target(&images),
            BlobStore::new(tmp.path().join("store")),
            Box::new(StaticFetcher {
                data: disk_tar("fcos.vhdx", b"VHDX"),
                calls: Rc::new(Cell::new(0)),
            }),
        );

        let disk = disker.pull_disk().unwrap();
        assert_eq!(disk.path(), images.join("vm1-fcos.vhdx"));
        assert_eq!(fs::read(disk.path()).unwrap(), b"VHDX");
        assert!(!images.join("fcos.vhdx").exists());
    }

    #[test]
    fn registry_pull_disk_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let images = tmp.path().join("images");
        let calls = Rc::new(Cell::new(0));
        let archive = zstd_bytes(&disk_tar("machine.raw.zst", &zstd_bytes(b"RAW DISK")));

        let mut disker = Disker::from_source(
            ImageSource::Registry("quay.io/libpod/images:5.0-raw".to_string()),
            target(&images),
            BlobStore::new(tmp.path().join("store")),
            Box::new(StaticFetcher {
                data: archive,
                calls: Rc::clone(&calls),
            }),
        );

        let disk = disker.pull_disk().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(disk.path(), images.join("vm1-machine.raw"));
        assert_eq!(fs::read(disk.path()).unwrap(), b"RAW DISK");
        // Compressed intermediate is gone.
        assert!(!images.join("machine.raw.zst").exists());
    }

    #[test]
    fn directory_pull_requires_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut disker = Disker::from_source(
            ImageSource::Directory(tmp.path().join("missing")),
            target(tmp.path()),
            BlobStore::new(tmp.path()),
            Box::new(FailingFetcher),
        );
        assert!(matches!(disker.pull(), Err(DiskError::Fetch { .. })));
    }

    #[test]
    fn directory_with_single_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("disk.tar"), disk_tar("disk.qcow2", b"QCOW")).unwrap();
        let images = tmp.path().join("images");

        let mut disker = Disker::from_source(
            ImageSource::Directory(src.clone()),
            target(&images),
            BlobStore::new(tmp.path()),
            Box::new(FailingFetcher),
        );
        assert_eq!(disker.kind(), OciKind::Directory);
        assert_eq!(disker.disk_endpoint(), src.display().to_string());

        let disk = disker.pull_disk().unwrap();
        assert_eq!(disk.path(), images.join("vm1-disk.qcow2"));
        assert_eq!(fs::read(disk.path()).unwrap(), b"QCOW");
    }

    #[test]
    fn directory_with_oci_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = tmp.path().join("layout");
        let store = BlobStore::new(&layout);

        let layer = zstd_bytes(&disk_tar("fcos.qcow2", b"Q"));
        let layer_info = BlobInfo {
            digest: Digest::sha256_of(&layer),
            size: layer.len() as u64,
            media_type: "application/zstd".to_string(),
        };
        store.store_blob(&layer_info, &layer[..]).unwrap();

        let manifest = format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"application/vnd.oci.empty.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2}},"layers":[{{"mediaType":"application/zstd","digest":"{}","size":{}}}]}}"#,
            layer_info.digest,
            layer.len()
        );
        let manifest_info = BlobInfo {
            digest: Digest::sha256_of(manifest.as_bytes()),
            size: manifest.len() as u64,
            media_type: crate::manifest::MEDIA_TYPE_OCI_MANIFEST.to_string(),
        };
        store.store_blob(&manifest_info, manifest.as_bytes()).unwrap();

        let mut index = fs::File::create(layout.join("index.json")).unwrap();
        write!(
            index,
            r#"{{"schemaVersion":2,"manifests":[{{"mediaType":"{}","digest":"{}","size":{}}}]}}"#,
            manifest_info.media_type,
            manifest_info.digest,
            manifest.len()
        )
        .unwrap();
        drop(index);

        let images = tmp.path().join("images");
        let mut disker = Disker::from_kind(
            OciKind::Directory,
            &layout.to_string_lossy(),
            target(&images),
            BlobStore::new(tmp.path().join("unused")),
            Box::new(FailingFetcher),
        )
        .unwrap();
        let disk = disker.pull_disk().unwrap();
        assert_eq!(disk.path(), images.join("vm1-fcos.qcow2"));
        assert_eq!(fs::read(disk.path()).unwrap(), b"Q");
    }
}
