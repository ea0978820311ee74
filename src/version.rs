//! Release version used to pick the disk image tag.

use semver::{Prerelease, Version};
use std::fmt;

/// Minor version that development builds pin disk image tags to.
pub const DEV_MINOR_OVERRIDE: u64 = 6;

/// The tool's release version, as used for disk image tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVersion(Version);

impl OsVersion {
    pub fn new(version: Version) -> Self {
        Self(version)
    }

    /// `"{major}.{minor}"`, the disk image tag prefix.
    pub fn major_minor(&self) -> String {
        format!("{}.{}", self.0.major, self.0.minor)
    }

    pub fn version(&self) -> &Version {
        &self.0
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The version compiled into this crate.
pub fn compiled_version() -> Version {
    // Cargo rejects manifests whose version is not valid semver.
    Version::parse(env!("CARGO_PKG_VERSION")).expect("CARGO_PKG_VERSION is valid semver")
}

/// Resolve the version used for disk image tags.
///
/// With `dev_override` the minor version is pinned to [`DEV_MINOR_OVERRIDE`]
/// and the pre-release tag cleared, so development builds resolve to the
/// mainline image stream.
pub fn resolve_version(dev_override: bool) -> OsVersion {
    resolve_version_from(compiled_version(), dev_override)
}

/// Pure core of [`resolve_version`].
pub fn resolve_version_from(mut version: Version, dev_override: bool) -> OsVersion {
    if dev_override {
        version.minor = DEV_MINOR_OVERRIDE;
        version.pre = Prerelease::EMPTY;
    }
    OsVersion(version)
}
