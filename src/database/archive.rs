//! Compress and uncompress stages
//!
//! Archives hold the dump under its base name, so extracting an archive into
//! its own directory recreates the original artifact next to it.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder};
use tracing::{error, info};
use walkdir::WalkDir;

use crate::database::{BackupError, Result};

/// Suffix appended to a compressed artifact
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// `path` with the archive suffix appended
pub fn archive_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(ARCHIVE_SUFFIX);
    PathBuf::from(name)
}

/// `path` with a trailing archive suffix removed, if there is one
pub fn strip_archive_suffix(path: &Path) -> Option<PathBuf> {
    let s = path.to_str()?;
    s.strip_suffix(ARCHIVE_SUFFIX)
        .filter(|stem| !stem.is_empty())
        .map(PathBuf::from)
}

/// Compress a backup using tar and gzip at maximum compression
///
/// Returns the path of the `.tar.gz` written next to `backup_path`. The
/// original artifact is left in place.
pub async fn compress_backup(backup_path: &Path) -> Result<PathBuf> {
    info!("Compressing backup at \"{}\"", backup_path.display());

    let source = backup_path.to_path_buf();
    let compressed = tokio::task::spawn_blocking(move || create_tar_gz(&source))
        .await
        .map_err(|e| BackupError::CompressionFailed(e.to_string()))?
        .inspect_err(|e| error!("{}", e))?;

    info!("Backup compressed to \"{}\"", compressed.display());
    Ok(compressed)
}

/// Extract a gzipped tar archive into the directory that contains it
///
/// Returns the path of the restored artifact, i.e. the archive path without
/// its `.tar.gz` suffix.
pub async fn uncompress_backup(archive_path: &Path) -> Result<PathBuf> {
    info!("Uncompressing file at \"{}\"", archive_path.display());

    let archive = archive_path.to_path_buf();
    let restored = tokio::task::spawn_blocking(move || extract_tar_gz(&archive))
        .await
        .map_err(|e| BackupError::UncompressFailed(e.to_string()))?
        .inspect_err(|e| error!("{}", e))?;

    info!("Backup uncompressed to \"{}\"", restored.display());
    Ok(restored)
}

fn create_tar_gz(source: &Path) -> Result<PathBuf> {
    let fail = |msg: String| BackupError::CompressionFailed(msg);

    let name = source
        .file_name()
        .ok_or_else(|| fail(format!("{} has no file name", source.display())))?
        .to_owned();
    if !source.exists() {
        return Err(fail(format!("{} does not exist", source.display())));
    }

    let archive_path = archive_path_for(source);
    let archive_file = File::create(&archive_path)
        .map_err(|e| fail(format!("failed to create {}: {}", archive_path.display(), e)))?;
    let encoder = GzEncoder::new(archive_file, Compression::best());
    let mut builder = Builder::new(encoder);

    if source.is_dir() {
        for entry in WalkDir::new(source) {
            let entry = entry.map_err(|e| fail(format!("failed to walk {}: {}", source.display(), e)))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| fail(e.to_string()))?;
            let in_archive = Path::new(&name).join(relative);

            let added = if entry.file_type().is_dir() {
                builder.append_dir(&in_archive, entry.path())
            } else {
                builder.append_path_with_name(entry.path(), &in_archive)
            };
            added.map_err(|e| fail(format!("failed to add {}: {}", entry.path().display(), e)))?;
        }
    } else {
        builder
            .append_path_with_name(source, &name)
            .map_err(|e| fail(format!("failed to add {}: {}", source.display(), e)))?;
    }

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| fail(format!("failed to finish {}: {}", archive_path.display(), e)))?;

    Ok(archive_path)
}

fn extract_tar_gz(archive_path: &Path) -> Result<PathBuf> {
    let fail = |msg: String| BackupError::UncompressFailed(msg);

    let restored = strip_archive_suffix(archive_path).ok_or_else(|| {
        fail(format!(
            "{} is not a {} archive",
            archive_path.display(),
            ARCHIVE_SUFFIX
        ))
    })?;
    let target_dir = archive_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let file = File::open(archive_path)
        .map_err(|e| fail(format!("failed to open {}: {}", archive_path.display(), e)))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.unpack(target_dir).map_err(|e| {
        fail(format!(
            "failed to unpack {} into {}: {}",
            archive_path.display(),
            target_dir.display(),
            e
        ))
    })?;

    Ok(restored)
}
