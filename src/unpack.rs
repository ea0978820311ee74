use crate::compression::{auto_decoder, strip_compression_suffix, Compression, Decoder};
use crate::error::{DiskError, Result};
use crate::vmfile::VmFile;
use std::cell::Cell;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

/// File extensions that identify the disk image inside an archive, after an
/// optional compression suffix is removed.
pub const DISK_IMAGE_EXTENSIONS: [&str; 4] = ["qcow2", "raw", "vhdx", "img"];

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Unpack the disk image archive at `archive` into `dest`.
///
/// The archive must hold exactly one disk image member; it is identified
/// before anything is written. Every entry is then extracted into a staging
/// directory inside `dest` and moved into place, the disk image last, so a
/// failed unpack never leaves a file under the disk image's final name.
pub fn unpack_disk_archive(archive: &Path, dest: &Path) -> Result<VmFile> {
    let member = find_disk_image(archive, dest)?;

    let unpack_err = |source: io::Error| DiskError::Unpack {
        archive: archive.to_path_buf(),
        dest: dest.to_path_buf(),
        source,
    };

    fs::create_dir_all(dest).map_err(unpack_err)?;
    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(dest)
        .map_err(unpack_err)?;

    debug!(
        archive = %archive.display(),
        dest = %dest.display(),
        "unpacking disk archive",
    );
    extract_all(archive, staging.path(), dest)?;
    promote(staging.path(), dest, &member).map_err(unpack_err)?;

    if let Err(e) = staging.close() {
        warn!(error = %e, "failed to remove unpack staging directory");
    }

    let unpacked = dest.join(&member);
    info!(path = %unpacked.display(), "disk image unpacked");
    Ok(VmFile::new(unpacked))
}

/// Scan the archive's headers for the disk image member and return its
/// relative path. Nothing is written; `dest` is where the archive is headed
/// and only shows up in errors.
pub fn find_disk_image(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let (decoder, _) = open_archive(archive, dest)?;
    let failed = decoder.failure_flag();
    let scan_err = |e: io::Error| archive_error(&failed, archive, dest, e);

    let mut tar = Archive::new(decoder);
    let mut found: Vec<PathBuf> = Vec::new();
    for entry in tar.entries().map_err(scan_err)? {
        let entry = entry.map_err(scan_err)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(scan_err)?;
        let Some(rel) = normalize_member(&path) else {
            continue;
        };
        let is_disk = rel
            .file_name()
            .map(|n| is_disk_image_name(&n.to_string_lossy()))
            .unwrap_or(false);
        if is_disk {
            found.push(rel);
        }
    }

    match found.len() {
        1 => {
            let member = found.remove(0);
            debug!(
                archive = %archive.display(),
                member = %member.display(),
                "found disk image member",
            );
            Ok(member)
        }
        _ => Err(DiskError::AmbiguousOrMissingDiskImage {
            archive: archive.to_path_buf(),
            found: found
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        }),
    }
}

/// Returns `true` if `name` looks like a disk image file name, e.g.
/// `fedora-coreos.x86_64.qcow2` or `machine.raw.zst`.
pub fn is_disk_image_name(name: &str) -> bool {
    let (stem, _) = strip_compression_suffix(name);
    match stem.rsplit_once('.') {
        Some((base, ext)) => !base.is_empty() && DISK_IMAGE_EXTENSIONS.contains(&ext),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn extract_all(archive: &Path, staging: &Path, dest: &Path) -> Result<()> {
    let (decoder, compression) = open_archive(archive, dest)?;
    let failed = decoder.failure_flag();
    let err = |e: io::Error| archive_error(&failed, archive, dest, e);

    debug!(
        archive = %archive.display(),
        %compression,
        "extracting entries",
    );

    let mut tar = Archive::new(decoder);
    // Unprivileged users cannot restore foreign owners.
    tar.set_preserve_ownerships(false);
    tar.set_preserve_permissions(false);
    tar.set_unpack_xattrs(false);
    tar.set_overwrite(true);

    for entry in tar.entries().map_err(err)? {
        let mut entry = entry.map_err(err)?;
        let inside = if entry.header().entry_type() == EntryType::Directory {
            let path = entry.path().map_err(err)?;
            match normalize_member(&path) {
                Some(rel) => create_dir_entry(staging, &rel).map_err(err)?,
                // "./" is the staging directory itself.
                None => path.components().all(|c| c == Component::CurDir),
            }
        } else {
            entry.unpack_in(staging).map_err(err)?
        };
        if !inside {
            let path = entry.path().map(|p| p.into_owned()).unwrap_or_default();
            warn!(entry = %path.display(), "skipped archive entry outside destination");
        }
    }

    drain(tar.into_inner(), archive);
    Ok(())
}

/// Create the directory `rel` under `staging` with the default mode. The
/// archived mode is ignored so a read-only directory can still be filled
/// and moved. Returns `false` if the path runs through a symlink.
fn create_dir_entry(staging: &Path, rel: &Path) -> io::Result<bool> {
    let mut path = staging.to_path_buf();
    for part in rel.components() {
        path.push(part);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(false),
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", path.display()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&path)?,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Open `archive` for reading. A missing or unreadable file is an unpack
/// failure; content that no codec accepts is a decompression failure.
fn open_archive(archive: &Path, dest: &Path) -> Result<(Decoder<'static>, Compression)> {
    let file = File::open(archive).map_err(|source| DiskError::Unpack {
        archive: archive.to_path_buf(),
        dest: dest.to_path_buf(),
        source,
    })?;
    auto_decoder(BufReader::new(file)).map_err(|source| DiskError::Decompress {
        path: archive.to_path_buf(),
        source,
    })
}

/// Read whatever follows the tar end marker so trailing checksums are
/// verified. The entries are already on disk, so failures are only logged.
fn drain(mut decoder: Decoder<'_>, archive: &Path) {
    if let Err(e) = io::copy(&mut decoder, &mut io::sink()) {
        warn!(
            archive = %archive.display(),
            error = %e,
            "error reading archive trailer after extraction",
        );
    }
}

/// Move the staged top-level entries into `dest`, the one containing the
/// disk image last.
fn promote(staging: &Path, dest: &Path, member: &Path) -> io::Result<()> {
    let disk_root = member.components().next().map(|c| c.as_os_str().to_owned());

    let mut entries: Vec<PathBuf> = fs::read_dir(staging)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort_by_key(|p| p.file_name().map(|n| n.to_owned()) == disk_root);

    for src in entries {
        if let Some(name) = src.file_name() {
            move_into(&src, &dest.join(name))?;
        }
    }
    Ok(())
}

/// Rename `src` to `dst`, merging into an existing directory and replacing
/// an existing file.
fn move_into(src: &Path, dst: &Path) -> io::Result<()> {
    let src_is_dir = fs::symlink_metadata(src)?.is_dir();
    match fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() && src_is_dir => {
            for entry in fs::read_dir(src)? {
                let entry = entry?;
                move_into(&entry.path(), &dst.join(entry.file_name()))?;
            }
            fs::remove_dir(src)
        }
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(dst)?;
            fs::rename(src, dst)
        }
        Ok(_) => {
            // rename(2) replaces files atomically.
            if src_is_dir {
                fs::remove_file(dst)?;
            }
            fs::rename(src, dst)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::rename(src, dst),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Strip `./` components; entries that would escape the destination yield
/// `None`.
fn normalize_member(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Classify an I/O error raised while walking an archive: a failing codec is
/// a decompression problem, anything else an unpack problem.
fn archive_error(failed: &Cell<bool>, archive: &Path, dest: &Path, source: io::Error) -> DiskError {
    if failed.get() {
        DiskError::Decompress {
            path: archive.to_path_buf(),
            source,
        }
    } else {
        DiskError::Unpack {
            archive: archive.to_path_buf(),
            dest: dest.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
