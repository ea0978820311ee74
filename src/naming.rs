use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Derive the per-instance location of a disk image: `dir/{instance}-{file}`.
///
/// `instance` is not validated; callers sanitize VM names before they get
/// here.
pub fn name_per_instance(fq_path: &Path, instance: &str) -> PathBuf {
    let mut name = OsString::from(instance);
    name.push("-");
    if let Some(file_name) = fq_path.file_name() {
        name.push(file_name);
    }
    match fq_path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}
