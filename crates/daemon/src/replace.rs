//! Replacer module for moving a processed copy over the library file.
//!
//! The original is renamed to a backup first and restored if the move fails,
//! so a failed replacement never leaves the library path empty.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Failed to move the original out of the way.
    #[error("Failed to create backup: {0}")]
    BackupFailed(io::Error),

    /// Failed to move the replacement into place; the original was restored.
    #[error("Failed to move replacement into place: {0}")]
    MoveFailed(io::Error),

    /// Replacement succeeded but the backup could not be removed.
    #[error("Failed to delete backup {}: {source}", path.display())]
    DeleteBackupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Generates a backup path for the original file: `<name>.orig.<timestamp>`
/// where timestamp is Unix epoch seconds.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use library_optimizer::replace::backup_path;
///
/// let backup = backup_path(Path::new("/media/movies/film.mkv"));
/// assert!(backup.to_string_lossy().starts_with("/media/movies/film.mkv.orig."));
/// ```
pub fn backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = original.as_os_str().to_owned();
    backup.push(format!(".orig.{}", timestamp));
    PathBuf::from(backup)
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Move `replacement` over `original_path`.
///
/// # Arguments
///
/// * `original_path` - Library file to overwrite
/// * `replacement` - Processed copy; consumed on success
///
/// # Returns
///
/// * `Ok(())` if the library path now holds the replacement
/// * `Err(ReplaceError)` otherwise; on `BackupFailed` and `MoveFailed` the
///   original is still at `original_path`
pub fn replace_with_backup(original_path: &Path, replacement: &Path) -> Result<(), ReplaceError> {
    let backup = backup_path(original_path);
    move_file(original_path, &backup).map_err(ReplaceError::BackupFailed)?;

    if let Err(e) = move_file(replacement, original_path) {
        if let Err(restore) = move_file(&backup, original_path) {
            tracing::error!(
                original = %original_path.display(),
                backup = %backup.display(),
                "Failed to restore original after failed replace: {}",
                restore
            );
        }
        return Err(ReplaceError::MoveFailed(e));
    }

    fs::remove_file(&backup).map_err(|source| ReplaceError::DeleteBackupFailed {
        path: backup.clone(),
        source,
    })
}
