//! Scanner module for discovering media files in library directories.
//!
//! This module recursively scans the configured library roots for files with
//! the configured container extension and orders them for the scheduler.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A media file discovered during library scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryFile {
    /// Full path to the file.
    pub path: PathBuf,
    /// Creation time; falls back to the modified time where unsupported.
    pub created: SystemTime,
    /// Last write time.
    pub modified: SystemTime,
}

/// Which files a pass looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    /// Every file, newest created first
    All,
    /// Files written within the trailing window, newest written first
    Recent,
}

impl std::fmt::Display for ScanScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanScope::All => write!(f, "all files"),
            ScanScope::Recent => write!(f, "recent files"),
        }
    }
}

/// Checks if a file has the library extension (case-insensitive, without dot).
pub fn has_extension(path: &Path, extension: &str) -> bool {
    let wanted = extension.trim_start_matches('.');
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Recursively collect library files under `roots`.
///
/// Hidden directories (names starting with `.`) are skipped; this also keeps
/// pipeline work directories out of the scan. Unreadable entries are ignored.
pub fn scan_libraries(roots: &[PathBuf], extension: &str) -> Vec<LibraryFile> {
    use walkdir::WalkDir;

    let mut files = Vec::new();

    for root in roots {
        if !root.exists() {
            tracing::warn!(root = %root.display(), "Library path does not exist");
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') {
                        return false;
                    }
                }
            }
            true
        });

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !has_extension(entry.path(), extension) {
                continue;
            }

            if let Ok(metadata) = entry.metadata() {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                let created = metadata.created().unwrap_or(modified);
                files.push(LibraryFile {
                    path: entry.path().to_path_buf(),
                    created,
                    modified,
                });
            }
        }
    }

    files
}

/// Filter and order scanned files for one pass.
///
/// # Arguments
/// * `files` - Output of [`scan_libraries`]
/// * `scope` - All files, or only those written within `recent_days` of `now`
/// * `recent_days` - Trailing window for [`ScanScope::Recent`]
/// * `now` - Reference time for the window
pub fn select_files(
    mut files: Vec<LibraryFile>,
    scope: ScanScope,
    recent_days: u32,
    now: SystemTime,
) -> Vec<LibraryFile> {
    match scope {
        ScanScope::All => {
            files.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.path.cmp(&b.path)));
        }
        ScanScope::Recent => {
            let window = Duration::from_secs(u64::from(recent_days) * 24 * 60 * 60);
            let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
            files.retain(|f| f.modified >= cutoff);
            files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        }
    }
    files
}

/// Scan and order in one step.
pub fn scan_library(
    roots: &[PathBuf],
    extension: &str,
    scope: ScanScope,
    recent_days: u32,
) -> Vec<LibraryFile> {
    select_files(
        scan_libraries(roots, extension),
        scope,
        recent_days,
        SystemTime::now(),
    )
}
