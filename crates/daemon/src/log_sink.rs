//! Log sink module for per-file and per-pass run logs.
//!
//! Every processing step writes a line to the sink. The sink mirrors the line to
//! `tracing` and keeps it in an in-memory buffer; at checkpoints the buffer is
//! written to a dated log file and reset.

use chrono::Local;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Destination for processing log lines.
///
/// Implementations must accept concurrent writes from probe workers and the
/// main pipeline task.
pub trait LogSink: Send + Sync {
    /// Record a single line.
    fn line(&self, text: &str);

    /// Write everything buffered since the last flush to `<dated dir>/<name>.txt`
    /// and reset the buffer. Returns the written path.
    fn flush_to_file(&self, name: &str) -> io::Result<PathBuf>;
}

/// Buffering sink writing to `<log_dir>/<MM-dd-yyyy>/<name>.txt`.
pub struct RunLog {
    log_dir: PathBuf,
    buffer: Mutex<String>,
}

impl RunLog {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            buffer: Mutex::new(String::new()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Snapshot of the lines buffered since the last flush.
    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Directory receiving today's log files.
    pub fn dated_dir(&self) -> PathBuf {
        self.log_dir
            .join(Local::now().format("%m-%d-%Y").to_string())
    }
}

/// Strip characters that cannot appear in a single path component.
pub fn sanitize_log_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "log".to_string()
    } else {
        trimmed.to_string()
    }
}

impl LogSink for RunLog {
    fn line(&self, text: &str) {
        tracing::info!(target: "library_optimizer::run", "{}", text);
        let mut buffer = self.buffer.lock();
        buffer.push_str(text);
        buffer.push('\n');
    }

    fn flush_to_file(&self, name: &str) -> io::Result<PathBuf> {
        let text = std::mem::take(&mut *self.buffer.lock());

        let folder = self.dated_dir();
        fs::create_dir_all(&folder)?;

        let path = folder.join(format!("{}.txt", sanitize_log_name(name)));
        fs::write(&path, text)?;
        Ok(path)
    }
}
