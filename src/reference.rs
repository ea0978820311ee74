use crate::config::ImageSourceConfig;
use crate::disker::{OciKind, OciOptions};
use crate::error::{DiskError, Result};
use crate::version::OsVersion;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Transport marker users may put in front of a registry reference.
pub const DOCKER_TRANSPORT: &str = "docker://";

// ---------------------------------------------------------------------------
// ImageFormat
// ---------------------------------------------------------------------------

/// Disk flavour published for each release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Qcow2,
    /// Raw disk, also used by the applehv provider.
    Raw,
    Vhdx,
    Tar,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Tar => "tar",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qcow2" => Ok(ImageFormat::Qcow2),
            "raw" | "applehv" => Ok(ImageFormat::Raw),
            "vhdx" => Ok(ImageFormat::Vhdx),
            "tar" => Ok(ImageFormat::Tar),
            other => Err(DiskError::ReferenceBuild(format!(
                "unknown disk image format {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference building
// ---------------------------------------------------------------------------

/// Remove leading `docker://` transport markers, if any.
///
/// Repeated markers are all stripped so the result is a fixed point.
pub fn strip_transport_prefix(input: &str) -> &str {
    let mut rest = input;
    while let Some(stripped) = rest.strip_prefix(DOCKER_TRANSPORT) {
        rest = stripped;
    }
    rest
}

/// Where the disk image for a pull comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Fully-qualified `registry/repo/image:tag` reference.
    Registry(String),
    /// Local OCI directory.
    Directory(PathBuf),
}

impl ImageSource {
    pub fn kind(&self) -> OciKind {
        match self {
            ImageSource::Registry(_) => OciKind::Registry,
            ImageSource::Directory(_) => OciKind::Directory,
        }
    }
}

/// Builds disk image references against a configured registry location.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBuilder {
    config: ImageSourceConfig,
}

impl ReferenceBuilder {
    pub fn new(config: ImageSourceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImageSourceConfig {
        &self.config
    }

    /// `{registry}/{repository}/{image}:{major.minor}-{format}`
    pub fn registry_reference(&self, version: &OsVersion, format: ImageFormat) -> String {
        format!(
            "{}/{}/{}:{}-{}",
            self.config.registry,
            self.config.repository,
            self.config.image_name,
            version.major_minor(),
            format,
        )
    }

    /// Pick the image source, honouring caller overrides.
    ///
    /// `user_image` is a registry reference supplied by the user; it wins
    /// over the versioned default and is normalized first. A directory kind
    /// in `opts` takes precedence over both.
    pub fn resolve(
        &self,
        version: &OsVersion,
        format: ImageFormat,
        opts: &OciOptions,
        user_image: Option<&str>,
    ) -> Result<ImageSource> {
        opts.validate()?;
        match opts.kind.unwrap_or(OciKind::Registry) {
            OciKind::Registry => {
                let reference = match user_image {
                    Some(user) => strip_transport_prefix(user.trim()).to_string(),
                    None => self.registry_reference(version, format),
                };
                if reference.is_empty() {
                    return Err(DiskError::ReferenceBuild(
                        "empty registry reference".to_string(),
                    ));
                }
                Ok(ImageSource::Registry(reference))
            }
            OciKind::Directory => match &opts.dir {
                Some(dir) => Ok(ImageSource::Directory(dir.clone())),
                None => Err(DiskError::Config(
                    "oci-dir kind requires a directory".to_string(),
                )),
            },
            OciKind::Unknown => Err(DiskError::UnknownKind(OciKind::Unknown.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
