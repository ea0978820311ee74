//! Error types for machine-disk

use std::path::PathBuf;

/// Errors produced while resolving, fetching and unpacking disk images.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// The image reference could not be built from its inputs.
    #[error("reference error: {0}")]
    ReferenceBuild(String),

    /// Registry or source failure while fetching content.
    #[error("fetch error from {endpoint}: {message}")]
    Fetch { endpoint: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid digest: {0:?}")]
    InvalidDigest(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Reading, decoding or writing out a compressed file failed.
    #[error("decompress {}: {source}", .path.display())]
    Decompress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive does not hold exactly one recognizable disk image.
    #[error(
        "expected exactly one disk image in {}, found {}: {found:?}",
        .archive.display(),
        .found.len()
    )]
    AmbiguousOrMissingDiskImage {
        archive: PathBuf,
        found: Vec<String>,
    },

    /// The archive could not be opened or extracted into `dest`.
    #[error("unpack {} to {}: {source}", .archive.display(), .dest.display())]
    Unpack {
        archive: PathBuf,
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} has not been pulled yet")]
    NotPulled(String),

    #[error("unknown OCI kind: {0:?}")]
    UnknownKind(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DiskError {
    pub(crate) fn fetch(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiskError>;
