//! Library run loop for the optimizer
//!
//! Gates passes on the configured start hour, scans the library, hands each
//! eligible file to the pipeline while the scheduler already looks for the
//! next one, and writes a summary at the end of every pass.

use crate::config::Config;
use crate::lock::{FileLock, RenameProbe};
use crate::log_sink::{LogSink, RunLog};
use crate::lookahead::{Candidate, CandidateProbe, LookaheadScheduler};
use crate::pipeline::Pipeline;
use crate::process::{Cancelled, ProcessRunner, ToolRunner};
use crate::scan::{scan_library, LibraryFile, ScanScope};
use crate::schedule::{hours_until_next_pass, hours_until_start, initial_scope, HOUR};
use crate::startup::{run_startup_checks, StartupError};
use crate::stats::RunStatistics;
use chrono::{Local, Timelike};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Error type for run loop operations
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Library scan task did not complete
    #[error("Library scan failed: {0}")]
    Scan(String),

    /// Shutdown was requested
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for OptimizerError {
    fn from(_: Cancelled) -> Self {
        OptimizerError::Cancelled
    }
}

impl OptimizerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OptimizerError::Cancelled)
    }
}

/// Runtime state of the optimizer
pub struct Optimizer {
    /// Settings, read-only for the lifetime of the run
    pub config: Config,
    runner: Arc<dyn ToolRunner>,
    lock: Arc<dyn FileLock>,
    sink: Arc<dyn LogSink>,
    pipeline: Pipeline,
    cancel: CancellationToken,
    resync_after: Duration,
}

impl Optimizer {
    /// Initialize the optimizer after running the startup checks
    ///
    /// # Arguments
    /// * `config` - Loaded and validated settings
    /// * `cancel` - Process-wide token, cancelled on SIGINT/SIGTERM
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self, OptimizerError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config, cancel))
    }

    /// Initialize the optimizer without running startup checks
    pub fn new_without_checks(config: Config, cancel: CancellationToken) -> Self {
        let sink: Arc<dyn LogSink> = Arc::new(RunLog::new(config.logging.log_dir.clone()));
        let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new(Arc::clone(&sink)));
        Self::with_parts(config, runner, Arc::new(RenameProbe), sink, cancel)
    }

    /// Assemble the optimizer from explicit collaborators.
    pub fn with_parts(
        config: Config,
        runner: Arc<dyn ToolRunner>,
        lock: Arc<dyn FileLock>,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Self {
        let pipeline = Pipeline::new(
            Arc::clone(&runner),
            Arc::clone(&sink),
            config.encoder.clone(),
        );
        let resync_after = DAY * config.schedule.resync_after_days;
        Self {
            resync_after,
            config,
            runner,
            lock,
            sink,
            pipeline,
            cancel,
        }
    }

    /// Override how long a pass may run before the file list is rescanned.
    pub fn with_resync_after(mut self, resync_after: Duration) -> Self {
        self.resync_after = resync_after;
        self
    }

    /// Run passes forever, gated on the start hour.
    ///
    /// Only returns on cancellation.
    pub async fn run(&self) -> Result<(), OptimizerError> {
        let start_hour = self.config.schedule.start_hour;
        let mut scope = initial_scope(&self.config);

        if self.config.schedule.force_start {
            tracing::info!("Force start enabled, starting first pass now");
        } else {
            let hours = hours_until_start(start_hour, Local::now().hour());
            tracing::info!("Waiting {} hour(s) for start hour {}", hours, start_hour);
            sleep_or_cancel(HOUR * hours, &self.cancel).await?;
        }

        loop {
            self.run_pass(scope).await?;
            scope = ScanScope::Recent;

            let hours = hours_until_next_pass(start_hour, Local::now().hour());
            tracing::info!("Next pass in {} hour(s)", hours);
            sleep_or_cancel(HOUR * hours, &self.cancel).await?;
        }
    }

    /// Run a single pass over every file, ignoring the schedule.
    pub async fn run_once(&self) -> Result<RunStatistics, OptimizerError> {
        self.run_pass(ScanScope::All).await
    }

    /// Scan, process every eligible file, and write the pass summary.
    pub async fn run_pass(&self, scope: ScanScope) -> Result<RunStatistics, OptimizerError> {
        let mut stats = RunStatistics::default();
        let files = self.scan(scope).await?;

        let evaluator = Arc::new(CandidateProbe::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.lock),
            self.config.pipeline.clone(),
        ));
        let mut scheduler =
            LookaheadScheduler::new(evaluator, self.config.pipeline.lookahead_workers, files);

        let mut round = scheduler.next_round(&self.cancel).await?;
        loop {
            for (file, reason) in round.skipped.drain(..) {
                self.sink
                    .line(&format!("Skipping {}: {}", file.path.display(), reason));
                stats.record_skip(&file.path, reason);
            }
            let Some(candidate) = round.found.take() else {
                break;
            };

            if scheduler.needs_resync(self.resync_after) {
                self.process(&candidate, &mut stats).await?;
                tracing::info!("File list is stale, rescanning library");
                // Files handled earlier in this pass are not picked again.
                let files = self
                    .scan(scope)
                    .await?
                    .into_iter()
                    .filter(|file| !stats.was_processed(&file.path))
                    .collect();
                scheduler.resync(files);
                round = scheduler.next_round(&self.cancel).await?;
            } else {
                let (processed, next) = tokio::join!(
                    self.process(&candidate, &mut stats),
                    scheduler.next_round(&self.cancel),
                );
                processed?;
                round = next?;
            }
        }

        self.write_summary(&stats);
        Ok(stats)
    }

    async fn scan(&self, scope: ScanScope) -> Result<Vec<LibraryFile>, OptimizerError> {
        tracing::info!("Scanning library ({})", scope);
        let library = self.config.library.clone();
        let files = tokio::task::spawn_blocking(move || {
            scan_library(&library.paths, &library.extension, scope, library.recent_days)
        })
        .await
        .map_err(|e| OptimizerError::Scan(e.to_string()))?;
        tracing::info!("Found {} file(s)", files.len());
        Ok(files)
    }

    /// Convert one candidate, record its outcome and flush its log.
    async fn process(
        &self,
        candidate: &Candidate,
        stats: &mut RunStatistics,
    ) -> Result<(), Cancelled> {
        let started = Instant::now();

        let desc = self
            .pipeline
            .convert(
                &candidate.file.path,
                candidate.probe_text.clone(),
                candidate.variant,
                &self.cancel,
            )
            .await?;

        self.sink.line(&format!(
            "Finished {} in {}",
            desc.video_name,
            format_elapsed(started.elapsed())
        ));
        stats.record_outcome(&desc);

        if let Err(e) = self.sink.flush_to_file(&desc.log_name()) {
            tracing::warn!("Failed to write log for {}: {}", desc.video_name, e);
        }
        Ok(())
    }

    fn write_summary(&self, stats: &RunStatistics) {
        for line in stats.summary().lines() {
            self.sink.line(line);
        }
        let name = format!("Run Summary {}", Local::now().format("%H-%M-%S"));
        if let Err(e) = self.sink.flush_to_file(&name) {
            tracing::warn!("Failed to write run summary: {}", e);
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// `HH:MM:SS` rendering of an elapsed duration.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}
