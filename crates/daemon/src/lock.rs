//! Lock checking module for detecting files held by another process.
//!
//! A file still being downloaded or copied must not enter the pipeline. The
//! probe renames the file to a sibling name and straight back; if either step
//! fails the file is considered in use and is skipped for this pass.
//!
//! Unix lets a file that is open for writing be renamed, so on Linux the
//! check first looks through `/proc/<pid>/fd` for a descriptor opened with
//! write access on the same file.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Decides whether a library file is currently in use.
pub trait FileLock: Send + Sync {
    fn is_locked(&self, path: &Path) -> bool;
}

/// Non-destructive two-step rename probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameProbe;

/// Sibling path used while probing.
pub fn probe_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("file"));
    name.push(".lockprobe");
    path.with_file_name(name)
}

/// Open flags from the `flags:` line of a `/proc/<pid>/fdinfo/<fd>` file.
pub fn parse_fd_flags(fdinfo: &str) -> Option<u32> {
    fdinfo
        .lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|value| u32::from_str_radix(value.trim(), 8).ok())
}

/// Access mode is `O_WRONLY` or `O_RDWR`.
pub fn is_write_mode(flags: u32) -> bool {
    const O_ACCMODE: u32 = 0o3;
    flags & O_ACCMODE != 0
}

/// Whether any visible process holds `path` open for writing.
///
/// Processes whose descriptors cannot be read (other users) are ignored.
#[cfg(target_os = "linux")]
pub fn has_open_writer(path: &Path) -> bool {
    let Ok(target) = fs::canonicalize(path) else {
        return false;
    };
    let Ok(procs) = fs::read_dir("/proc") else {
        return false;
    };

    for proc_entry in procs.flatten() {
        let is_pid = proc_entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        let Ok(fds) = fs::read_dir(proc_entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if fs::read_link(fd.path()).ok().as_deref() != Some(target.as_path()) {
                continue;
            }
            let info = proc_entry.path().join("fdinfo").join(fd.file_name());
            let writable = fs::read_to_string(info)
                .ok()
                .and_then(|text| parse_fd_flags(&text))
                .is_some_and(is_write_mode);
            if writable {
                return true;
            }
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
pub fn has_open_writer(_path: &Path) -> bool {
    false
}

impl FileLock for RenameProbe {
    fn is_locked(&self, path: &Path) -> bool {
        if has_open_writer(path) {
            tracing::debug!(path = %path.display(), "File is open for writing");
            return true;
        }

        let probe = probe_path(path);
        if probe.exists() {
            // Leftover from another probe or process; do not clobber it.
            return true;
        }

        if let Err(e) = fs::rename(path, &probe) {
            tracing::debug!(path = %path.display(), "Rename probe failed: {}", e);
            return true;
        }

        if let Err(e) = fs::rename(&probe, path) {
            tracing::error!(
                path = %path.display(),
                probe = %probe.display(),
                "Failed to restore file after rename probe: {}",
                e
            );
            return true;
        }

        false
    }
}
