//! Process runner module for invoking external media tools.
//!
//! Commands are handed to a shell as opaque strings. Output is captured line by
//! line, noisy lines are dropped, and a small set of known-benign stderr
//! messages is tolerated even when the tool exits nonzero. Every run observes a
//! cancellation token; cancelling kills the whole process tree.

use crate::log_sink::LogSink;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Lines containing any of these are dropped from captured output.
pub const DROPPED_LINE_PATTERNS: &[&str] = &["Last message repeated", "Skipping NAL unit"];

/// Stderr messages that do not count as a failure despite a nonzero exit.
///
/// Probing a file with `ffmpeg -i <file>` and no output always ends with one of these.
pub const BENIGN_STDERR_PATTERNS: &[&str] = &[
    "At least one output file must be specified",
    "Error splitting the argument list: Option not found",
];

/// How long to wait for output readers to drain after a kill.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for external process execution
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The shell could not be started
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool exited nonzero without a benign stderr message.
    /// `exit_code` is -1 when the process was terminated by a signal.
    #[error("Command failed with exit code {exit_code}: {output}")]
    ExternalTool { exit_code: i32, output: String },

    /// The run was cancelled and the process tree killed
    #[error("Command cancelled")]
    Cancelled,

    /// Waiting on the child failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled)
    }
}

/// Cancellation observed at a blocking point; carried up to the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation cancelled")]
pub struct Cancelled;

/// Per-invocation output handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Forward every kept line to the log sink
    pub capture_to_log: bool,
    /// Echo every kept line to the console only
    pub print_inline: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            capture_to_log: true,
            print_inline: false,
        }
    }
}

impl RunOptions {
    /// Lines go to the log sink.
    pub fn logged() -> Self {
        Self::default()
    }

    /// Output is only returned to the caller.
    pub fn quiet() -> Self {
        Self {
            capture_to_log: false,
            print_inline: false,
        }
    }
}

/// Runs external commands on behalf of the pipeline and the lookahead probes.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `command` and return its combined stdout + stderr.
    ///
    /// `label` identifies the file the command works on and is appended to
    /// every logged line.
    async fn run(
        &self,
        command: &str,
        label: &str,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<String, ProcessError>;
}

/// How a finished process is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Nonzero exit with a benign stderr message
    BenignWarning,
    Failure,
}

/// Classify a finished process from its exit code and stderr text.
pub fn classify_exit(exit_code: i32, stderr_text: &str) -> ExitClass {
    if BENIGN_STDERR_PATTERNS
        .iter()
        .any(|pattern| stderr_text.contains(pattern))
    {
        ExitClass::BenignWarning
    } else if exit_code == 0 {
        ExitClass::Success
    } else {
        ExitClass::Failure
    }
}

/// Whether a captured line should be dropped.
pub fn is_dropped_line(line: &str) -> bool {
    DROPPED_LINE_PATTERNS
        .iter()
        .any(|pattern| line.contains(pattern))
}

/// Quote a path for the platform shell used by [`ProcessRunner`].
#[cfg(unix)]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a path for the platform shell used by [`ProcessRunner`].
#[cfg(windows)]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''").replace('\u{2019}', "\u{2019}\u{2019}"))
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    // Own process group so a terminal Ctrl+C reaches only us; children are
    // stopped through the cancellation token instead.
    cmd.process_group(0);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    let mut cmd = Command::new("pwsh");
    cmd.arg("-Command").arg(command);
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

/// All transitive children of `root`, deepest first.
///
/// `links` is a snapshot of `(pid, parent)` pairs.
pub fn descendants_of(root: u32, links: &[(u32, Option<u32>)]) -> Vec<u32> {
    let mut found = Vec::new();
    let mut frontier = vec![root];

    while let Some(parent) = frontier.pop() {
        for (pid, ppid) in links {
            if *ppid == Some(parent) && *pid != root && !found.contains(pid) {
                found.push(*pid);
                frontier.push(*pid);
            }
        }
    }

    found.reverse();
    found
}

/// Kill every descendant of `root`. Returns how many processes were signalled.
fn kill_descendants(root: u32) -> usize {
    let system = System::new_all();
    let links: Vec<(u32, Option<u32>)> = system
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process.parent().map(|p| p.as_u32())))
        .collect();

    descendants_of(root, &links)
        .into_iter()
        .filter_map(|pid| system.process(Pid::from_u32(pid)))
        .filter(|process| process.kill())
        .count()
}

/// Kill every process still in the group led by `group`.
///
/// Descendants that outlived the shell are reparented to init, so only the
/// group id still ties them to the command.
#[cfg(unix)]
fn kill_process_group(group: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as GroupId;

    let Ok(raw) = i32::try_from(group) else {
        return;
    };
    if let Err(e) = killpg(GroupId::from_raw(raw), Signal::SIGKILL) {
        tracing::debug!(group, "Process group kill failed: {}", e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: u32) {}

/// Kill the child and everything it spawned, then reap it.
async fn kill_process_tree(child: &mut Child) {
    if let Some(root) = child.id() {
        match tokio::task::spawn_blocking(move || kill_descendants(root)).await {
            Ok(count) if count > 0 => {
                tracing::debug!(pid = root, killed = count, "Killed descendant processes");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(pid = root, "Descendant kill task failed: {}", e),
        }
    }

    if let Some(root) = child.id() {
        kill_process_group(root);
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!("Child already exited before kill: {}", e);
    }
    let _ = child.wait().await;
}

/// Read lines until EOF, dropping noise and forwarding the rest.
async fn collect_lines<R>(
    reader: Option<R>,
    label: String,
    sink: Arc<dyn LogSink>,
    options: RunOptions,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let Some(reader) = reader else {
        return kept;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_dropped_line(&line) {
            continue;
        }
        if options.capture_to_log {
            sink.line(&format!("{} | File: {}", line, label));
        } else if options.print_inline {
            tracing::info!(target: "library_optimizer::tool", "{} | File: {}", line, label);
        }
        kept.push(line);
    }
    kept
}

/// Shell-backed [`ToolRunner`].
pub struct ProcessRunner {
    sink: Arc<dyn LogSink>,
}

impl ProcessRunner {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        command: &str,
        label: &str,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<String, ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdout_task = tokio::spawn(collect_lines(
            child.stdout.take(),
            label.to_string(),
            Arc::clone(&self.sink),
            options,
        ));
        let stderr_task = tokio::spawn(collect_lines(
            child.stderr.take(),
            label.to_string(),
            Arc::clone(&self.sink),
            options,
        ));

        // Process group id; equals the shell's pid on Unix.
        let group = child.id();

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                kill_process_tree(&mut child).await;
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                })
                .await;
                return Err(ProcessError::Cancelled);
            }
        };

        // Background descendants may still hold the pipes after the shell exits.
        let drain = async {
            (
                stdout_task.await.unwrap_or_default(),
                stderr_task.await.unwrap_or_default(),
            )
        };
        let (stdout_lines, stderr_lines) = tokio::select! {
            lines = drain => lines,
            _ = cancel.cancelled() => {
                if let Some(group) = group {
                    kill_process_group(group);
                }
                return Err(ProcessError::Cancelled);
            }
        };
        let stderr_text = stderr_lines.join("\n");
        let combined = stdout_lines
            .into_iter()
            .chain(stderr_lines)
            .collect::<Vec<_>>()
            .join("\n");

        let exit_code = status.code().unwrap_or(-1);
        match classify_exit(exit_code, &stderr_text) {
            ExitClass::Success => {
                if options.capture_to_log {
                    self.sink.line("Process completed successfully.");
                }
                Ok(combined)
            }
            ExitClass::BenignWarning => {
                if options.capture_to_log {
                    self.sink.line("Warning: Returned a minor error (ignored):");
                    self.sink.line(&stderr_text);
                }
                Ok(combined)
            }
            ExitClass::Failure => Err(ProcessError::ExternalTool {
                exit_code,
                output: combined,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::RunLog;
    use proptest::prelude::*;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(0, ""), ExitClass::Success);
        assert_eq!(classify_exit(1, "boom"), ExitClass::Failure);
        assert_eq!(
            classify_exit(1, "At least one output file must be specified"),
            ExitClass::BenignWarning
        );
        assert_eq!(
            classify_exit(8, "Error splitting the argument list: Option not found"),
            ExitClass::BenignWarning
        );
    }

    #[test]
    fn test_dropped_lines() {
        assert!(is_dropped_line("    Last message repeated 4 times"));
        assert!(is_dropped_line("Skipping NAL unit 62"));
        assert!(!is_dropped_line("frame= 100 fps=25"));
    }

    #[test]
    fn test_descendants_deepest_first() {
        // 1 -> 2 -> 3, 1 -> 4, 5 unrelated
        let links = vec![
            (1, None),
            (2, Some(1)),
            (3, Some(2)),
            (4, Some(1)),
            (5, Some(9)),
        ];
        let found = descendants_of(1, &links);
        assert_eq!(found.len(), 3);
        assert!(!found.contains(&5));
        let pos = |pid| found.iter().position(|p| *p == pid).unwrap();
        assert!(pos(3) < pos(2), "grandchild must be killed before its parent");
    }

    #[test]
    fn test_descendants_of_leaf_is_empty() {
        let links = vec![(1, None), (2, Some(1))];
        assert!(descendants_of(2, &links).is_empty());
    }

    // Exit classification never reports success for a nonzero code unless a
    // benign message is present.
    proptest! {
        #[test]
        fn prop_nonzero_exit_without_benign_text_fails(
            code in 1i32..255,
            stderr in "[a-z ]{0,40}",
        ) {
            prop_assert_eq!(classify_exit(code, &stderr), ExitClass::Failure);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_quote_unix() {
        assert_eq!(shell_quote("/media/a b.mkv"), "'/media/a b.mkv'");
        assert_eq!(shell_quote("it's.mkv"), r"'it'\''s.mkv'");
    }

    #[cfg(unix)]
    fn runner(dir: &TempDir) -> (ProcessRunner, Arc<RunLog>) {
        let log = Arc::new(RunLog::new(dir.path()));
        (ProcessRunner::new(log.clone()), log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let (runner, log) = runner(&dir);
        let token = CancellationToken::new();

        let output = runner
            .run("echo out; echo err 1>&2", "movie.mkv", RunOptions::logged(), &token)
            .await
            .unwrap();

        assert!(output.contains("out"));
        assert!(output.contains("err"));
        let logged = log.contents();
        assert!(logged.contains("out | File: movie.mkv"));
        assert!(logged.contains("Process completed successfully."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quiet_run_does_not_log() {
        let dir = TempDir::new().unwrap();
        let (runner, log) = runner(&dir);
        let token = CancellationToken::new();

        runner
            .run("echo hidden", "x", RunOptions::quiet(), &token)
            .await
            .unwrap();

        assert!(log.contents().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_external_tool_error() {
        let dir = TempDir::new().unwrap();
        let (runner, _log) = runner(&dir);
        let token = CancellationToken::new();

        let err = runner
            .run("echo broken 1>&2; exit 3", "x", RunOptions::quiet(), &token)
            .await
            .unwrap_err();

        match err {
            ProcessError::ExternalTool { exit_code, output } => {
                assert_eq!(exit_code, 3);
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_benign_stderr_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let (runner, _log) = runner(&dir);
        let token = CancellationToken::new();

        let output = runner
            .run(
                "echo 'Duration: 01:00:00.00, bitrate: 9000 kb/s'; \
                 echo 'At least one output file must be specified' 1>&2; exit 1",
                "x",
                RunOptions::quiet(),
                &token,
            )
            .await
            .unwrap();

        assert!(output.contains("bitrate: 9000 kb/s"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_noise_lines_are_dropped() {
        let dir = TempDir::new().unwrap();
        let (runner, _log) = runner(&dir);
        let token = CancellationToken::new();

        let output = runner
            .run(
                "echo 'Last message repeated 2 times'; echo kept",
                "x",
                RunOptions::quiet(),
                &token,
            )
            .await
            .unwrap();

        assert_eq!(output, "kept");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_running_process_tree() {
        let dir = TempDir::new().unwrap();
        let (runner, _log) = runner(&dir);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = runner
            .run("sleep 30 & sleep 30; wait", "x", RunOptions::quiet(), &token)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_while_background_child_holds_pipes() {
        let dir = TempDir::new().unwrap();
        let (runner, _log) = runner(&dir);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        // The shell exits at once; the backgrounded sleep keeps stdout open.
        let started = Instant::now();
        let err = runner
            .run("sleep 30 & echo hi", "x", RunOptions::quiet(), &token)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_already_cancelled_token_never_spawns() {
        let dir = TempDir::new().unwrap();
        let (runner, _log) = runner(&dir);
        let token = CancellationToken::new();
        token.cancel();

        let marker = dir.path().join("spawned");
        let command = format!("touch {}", shell_quote(&marker.to_string_lossy()));
        let err = runner
            .run(&command, "x", RunOptions::quiet(), &token)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!marker.exists());
    }
}
