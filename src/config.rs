//! Where disk images are published.

use crate::error::Result;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_REGISTRY: &str = "quay.io";
pub const DEFAULT_REPOSITORY: &str = "libpod";
pub const DEFAULT_IMAGE_NAME: &str = "podman-machine-images";

/// Registry location of the machine disk images, plus whether development
/// tag pinning applies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageSourceConfig {
    pub registry: String,
    pub repository: String,
    pub image_name: String,
    pub dev_override: bool,
}

impl Default for ImageSourceConfig {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            repository: DEFAULT_REPOSITORY.to_string(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            dev_override: cfg!(feature = "dev-image-tags"),
        }
    }
}

impl ImageSourceConfig {
    /// Load from a YAML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        debug!(path = %path.display(), ?config, "loaded image source config");
        Ok(config)
    }

    /// Defaults with `MACHINE_DISK_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `MACHINE_DISK_REGISTRY`, `MACHINE_DISK_REPOSITORY`,
    /// `MACHINE_DISK_IMAGE` and `MACHINE_DISK_DEV_OVERRIDE`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("MACHINE_DISK_REGISTRY").filter(|v| !v.is_empty()) {
            self.registry = v;
        }
        if let Some(v) = lookup("MACHINE_DISK_REPOSITORY").filter(|v| !v.is_empty()) {
            self.repository = v;
        }
        if let Some(v) = lookup("MACHINE_DISK_IMAGE").filter(|v| !v.is_empty()) {
            self.image_name = v;
        }
        if let Some(v) = lookup("MACHINE_DISK_DEV_OVERRIDE") {
            self.dev_override = matches!(v.trim(), "1" | "true" | "yes");
        }
        self
    }
}
