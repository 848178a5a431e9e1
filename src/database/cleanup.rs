//! Cleanup stage: best-effort removal of local artifacts

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::database::archive::archive_path_for;

/// Remove the local dump and the corresponding tar file if they exist
///
/// Missing files are fine and removal errors are only logged, so this never
/// fails and can be called any number of times. An empty path is a no-op.
pub fn clean_up(backup_path: &Path) {
    if backup_path.as_os_str().is_empty() {
        info!("Nothing to clean up");
        return;
    }

    info!("Cleaning up \"{}\"", backup_path.display());

    let backup_tar = archive_path_for(backup_path);
    if backup_tar.is_file() {
        if let Err(e) = ignore_missing(fs::remove_file(&backup_tar)) {
            error!("Removing files at {} failed! {}", backup_tar.display(), e);
        }
    }

    let removed = if backup_path.is_dir() {
        fs::remove_dir_all(backup_path)
    } else if backup_path.is_file() {
        fs::remove_file(backup_path)
    } else {
        Ok(())
    };
    if let Err(e) = ignore_missing(removed) {
        error!("Removing files at {} failed! {}", backup_path.display(), e);
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Runs [`clean_up`] for the tracked artifact when dropped
///
/// The guard starts out empty; the pipeline registers the raw dump path once
/// the dump stage has produced it. Dropping the guard on any exit path
/// (return, `?`, or the owning future being dropped) removes the artifact
/// and its archive.
#[derive(Debug, Default)]
pub struct CleanupGuard {
    path: PathBuf,
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the raw artifact produced by the dump stage
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        clean_up(&self.path);
    }
}
