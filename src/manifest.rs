use serde::{Deserialize, Serialize};

use crate::cache::BlobInfo;
use crate::{DiskError, Result};

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json or
/// application/vnd.docker.distribution.manifest.v2+json).
///
/// Disk image artifacts carry the compressed disk archive as their first
/// layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

impl OciManifest {
    /// The layer holding the disk archive.
    pub fn disk_layer(&self) -> Result<&Descriptor> {
        self.layers
            .first()
            .ok_or_else(|| DiskError::NotFound("manifest has no layers".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: u64,
}

impl Descriptor {
    /// Validate the digest and convert to [`BlobInfo`].
    pub fn blob_info(&self) -> Result<BlobInfo> {
        Ok(BlobInfo {
            digest: self.digest.parse()?,
            size: self.size,
            media_type: self.media_type.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Image Index
// ---------------------------------------------------------------------------

/// An OCI image index, as found in an OCI layout's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// The only manifest in the index. Indexes listing several manifests
    /// would need platform selection, which is not supported.
    pub fn single_manifest(&self) -> Result<&Descriptor> {
        match self.manifests.as_slice() {
            [only] => Ok(only),
            [] => Err(DiskError::NotFound("image index lists no manifests".to_string())),
            many => Err(DiskError::UnsupportedMediaType(format!(
                "image index with {} manifests (multi-arch selection is not supported)",
                many.len()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
