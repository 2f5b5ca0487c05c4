//! In-process doubles for the external tools and the lock checker.
//!
//! Media files are simulated as sparse files whose leading bytes hold the text
//! the probe returns; the rest of the file is zero padding that sets its size.

use crate::classify::TAG_KEY;
use crate::lock::FileLock;
use crate::process::{ProcessError, RunOptions, ToolRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub const MB: u64 = 1_000_000;

/// Probe text written into every file a fake tool produces.
pub const OUTPUT_PROBE: &str = "Input #0, matroska,webm, from 'out.mkv':\n  \
    Duration: 02:00:00.00, start: 0.000000, bitrate: 8000 kb/s\n  \
    Stream #0:0: Video: hevc (Main 10), yuv420p10le, 3840x2160";

/// Write a simulated media file.
pub fn write_media(path: &Path, probe_text: &str, size_mb: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = File::create(path).unwrap();
    file.write_all(probe_text.as_bytes()).unwrap();
    file.set_len((size_mb * MB).max(probe_text.len() as u64 + 1))
        .unwrap();
}

/// Text portion of a simulated media file.
pub fn read_probe_text(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Single-quoted tokens of a command built with `shell_quote`.
pub fn quoted_tokens(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = command.chars().peekable();
    let mut current = String::new();
    let mut in_token = false;

    while let Some(c) = chars.next() {
        if c != '\'' {
            if in_token {
                current.push(c);
            }
        } else if !in_token {
            in_token = true;
        } else if chars.peek() == Some(&'\\') {
            // `'\''` continues the same token with a literal quote
            chars.next();
            chars.next();
            chars.next();
            current.push('\'');
        } else {
            in_token = false;
            tokens.push(std::mem::take(&mut current));
        }
    }
    tokens
}

/// Scripted stand-in for ffmpeg, dovi_tool and mkvmerge.
pub struct FakeRunner {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    block_on: Mutex<Option<String>>,
    final_sizes_mb: Mutex<VecDeque<u64>>,
    default_final_mb: u64,
}

impl FakeRunner {
    /// Final outputs (remux and AV1 encode) default to `default_final_mb`.
    pub fn new(default_final_mb: u64) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            block_on: Mutex::new(None),
            final_sizes_mb: Mutex::new(VecDeque::new()),
            default_final_mb,
        }
    }

    /// Fail every command containing `pattern`.
    pub fn fail_on(self, pattern: &str) -> Self {
        *self.fail_on.lock() = Some(pattern.to_string());
        self
    }

    /// Hang every command containing `pattern` until cancelled.
    pub fn block_on(self, pattern: &str) -> Self {
        *self.block_on.lock() = Some(pattern.to_string());
        self
    }

    /// Sizes for the next final outputs, in order.
    pub fn final_sizes(self, sizes_mb: &[u64]) -> Self {
        self.final_sizes_mb.lock().extend(sizes_mb.iter().copied());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_containing(&self, pattern: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.contains(pattern)).count()
    }

    fn produce(&self, command: &str, tokens: &[String]) -> Result<String, ProcessError> {
        let is_final = command.starts_with("mkvmerge") || command.contains("av1_");
        let output = if command.starts_with("mkvmerge") {
            tokens.first()
        } else {
            tokens.last()
        };
        let Some(output) = output else {
            return Ok(String::new());
        };

        let size = if is_final {
            self.final_sizes_mb
                .lock()
                .pop_front()
                .unwrap_or(self.default_final_mb)
        } else {
            1
        };
        write_media(Path::new(output), OUTPUT_PROBE, size);
        Ok(String::new())
    }

    fn tag(&self, tokens: &[String]) -> Result<String, ProcessError> {
        let (Some(source), Some(metadata), Some(dest)) =
            (tokens.first(), tokens.get(1), tokens.last())
        else {
            return Err(tool_error("malformed tag command"));
        };
        let text = read_probe_text(Path::new(source)).map_err(|e| tool_error(&e.to_string()))?;
        let size = fs::metadata(source).map(|m| m.len()).unwrap_or(MB) / MB;

        let value = metadata
            .strip_prefix(&format!("{}=", TAG_KEY))
            .unwrap_or(metadata);
        let tag_line = format!("    {}: {}", TAG_KEY, value);
        let mut kept: Vec<&str> = text.lines().filter(|l| !l.contains(TAG_KEY)).collect();
        kept.push(&tag_line);
        write_media(Path::new(dest), &kept.join("\n"), size);
        Ok(String::new())
    }
}

fn tool_error(output: &str) -> ProcessError {
    ProcessError::ExternalTool {
        exit_code: 1,
        output: output.to_string(),
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(
        &self,
        command: &str,
        _label: &str,
        _options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<String, ProcessError> {
        self.calls.lock().push(command.to_string());
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let blocked = self
            .block_on
            .lock()
            .as_deref()
            .is_some_and(|p| command.contains(p));
        if blocked {
            cancel.cancelled().await;
            return Err(ProcessError::Cancelled);
        }

        // Tag commands quote the failure reason, which may repeat the failed command.
        let failing = !command.contains("-metadata")
            && self
                .fail_on
                .lock()
                .as_deref()
                .is_some_and(|p| command.contains(p));
        if failing {
            return Err(tool_error(&format!("simulated failure: {}", command)));
        }

        let tokens = quoted_tokens(command);
        if command.contains("-hide_banner") {
            let path = tokens.first().ok_or_else(|| tool_error("no input"))?;
            return read_probe_text(Path::new(path)).map_err(|e| tool_error(&e.to_string()));
        }
        if command.contains("-metadata") {
            return self.tag(&tokens);
        }
        self.produce(command, &tokens)
    }
}

/// Lock checker reporting a fixed set of paths as in use.
#[derive(Default)]
pub struct FakeLock {
    locked: Mutex<HashSet<PathBuf>>,
}

impl FakeLock {
    pub fn lock(&self, path: &Path) {
        self.locked.lock().insert(path.to_path_buf());
    }
}

impl FileLock for FakeLock {
    fn is_locked(&self, path: &Path) -> bool {
        self.locked.lock().contains(path)
    }
}

#[test]
fn test_quoted_tokens() {
    assert_eq!(
        quoted_tokens(r"mkvmerge -o '/t/out.mkv' -D '/m/it'\''s.mkv' '/t/p8.hevc'"),
        vec!["/t/out.mkv", "/m/it's.mkv", "/t/p8.hevc"]
    );
}

#[tokio::test]
async fn test_fail_on_spares_tag_commands() {
    use crate::encode::tag_command;

    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("film.mkv");
    let tagged = dir.path().join("tagged_film.mkv");
    write_media(&source, "Input #0", 2);
    let runner = FakeRunner::new(1).fail_on("-map 0:v:0 -c copy");
    let cancel = CancellationToken::new();

    let failed = runner
        .run("ffmpeg -y -i 'a' -map 0:v:0 -c copy 'b'", "x", RunOptions::quiet(), &cancel)
        .await
        .unwrap_err();
    let reason = failed.to_string();
    assert!(reason.contains("-map 0:v:0 -c copy"));

    let command = tag_command(&source, &tagged, false, &reason);
    runner
        .run(&command, "x", RunOptions::quiet(), &cancel)
        .await
        .unwrap();
    assert!(read_probe_text(&tagged).unwrap().contains(TAG_KEY));
}
