//! Lookahead scheduler module.
//!
//! Finds the next eligible file with several concurrent probe workers. Worker
//! `k` of `N` walks indices `cursor + k`, `cursor + k + N`, ... and stops once
//! its next index lies beyond the best eligible index found so far. The best
//! index lives in a `watch` channel updated with a compare-and-set minimum, so
//! the lowest eligible index always wins and every index below it has been
//! examined exactly once when the round ends.

use crate::classify::{select_variant, should_be_processed, SkipReason};
use crate::descriptor::Variant;
use crate::encode::probe_command;
use crate::lock::FileLock;
use crate::process::{Cancelled, ProcessError, RunOptions, ToolRunner};
use crate::scan::LibraryFile;
use async_trait::async_trait;
use library_optimizer_config::PipelineConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Verdict on a single library file
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Eligible { probe_text: String, variant: Variant },
    Skip(SkipReason),
}

/// Decides whether a file should enter the pipeline.
#[async_trait]
pub trait CandidateEvaluator: Send + Sync {
    /// `cancel` fires both on shutdown and when a sibling worker wins the round.
    async fn evaluate(
        &self,
        file: &LibraryFile,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, Cancelled>;
}

/// Lock check, probe and classifier, in that order.
///
/// Nothing is written to disk; a locked file is rejected before any process
/// is spawned.
pub struct CandidateProbe {
    runner: Arc<dyn ToolRunner>,
    lock: Arc<dyn FileLock>,
    pipeline: PipelineConfig,
}

impl CandidateProbe {
    pub fn new(runner: Arc<dyn ToolRunner>, lock: Arc<dyn FileLock>, pipeline: PipelineConfig) -> Self {
        Self {
            runner,
            lock,
            pipeline,
        }
    }
}

#[async_trait]
impl CandidateEvaluator for CandidateProbe {
    async fn evaluate(
        &self,
        file: &LibraryFile,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, Cancelled> {
        let lock = Arc::clone(&self.lock);
        let path = file.path.clone();
        let locked = tokio::task::spawn_blocking(move || lock.is_locked(&path))
            .await
            .unwrap_or(true);
        if locked {
            tracing::debug!(path = %file.path.display(), "File is in use, skipping");
            return Ok(Evaluation::Skip(SkipReason::Locked));
        }

        let label = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let probe_text = match self
            .runner
            .run(&probe_command(&file.path), &label, RunOptions::quiet(), cancel)
            .await
        {
            Ok(text) => text,
            Err(ProcessError::Cancelled) => return Err(Cancelled),
            Err(e) => {
                tracing::warn!(path = %file.path.display(), "Probe failed: {}", e);
                return Ok(Evaluation::Skip(SkipReason::ProbeFailed));
            }
        };

        if !should_be_processed(&probe_text, self.pipeline.retry_failed) {
            return Ok(Evaluation::Skip(SkipReason::AlreadyProcessed));
        }

        Ok(match select_variant(&self.pipeline, &probe_text) {
            Some(variant) => Evaluation::Eligible {
                probe_text,
                variant,
            },
            None => Evaluation::Skip(SkipReason::NotApplicable),
        })
    }
}

/// Eligible file handed to the pipeline
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub file: LibraryFile,
    pub probe_text: String,
    pub variant: Variant,
}

/// Result of one scheduling round
#[derive(Debug, Default)]
pub struct Round {
    /// Lowest eligible index at or after the cursor, if any
    pub found: Option<Candidate>,
    /// Every index examined before `found` (or to the end), in index order
    pub skipped: Vec<(LibraryFile, SkipReason)>,
}

/// Cursor-based lookahead over one pass's file list
pub struct LookaheadScheduler {
    evaluator: Arc<dyn CandidateEvaluator>,
    workers: usize,
    files: Arc<Vec<LibraryFile>>,
    cursor: usize,
    started: Instant,
}

type WorkerResult = Result<Vec<(usize, Evaluation)>, Cancelled>;

impl LookaheadScheduler {
    pub fn new(evaluator: Arc<dyn CandidateEvaluator>, workers: usize, files: Vec<LibraryFile>) -> Self {
        Self {
            evaluator,
            workers: workers.max(1),
            files: Arc::new(files),
            cursor: 0,
            started: Instant::now(),
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.files.len()
    }

    /// Whether the list is older than `threshold` and should be rescanned.
    pub fn needs_resync(&self, threshold: Duration) -> bool {
        self.started.elapsed() > threshold
    }

    /// Replace the list with a fresh scan and restart from the top.
    pub fn resync(&mut self, files: Vec<LibraryFile>) {
        self.files = Arc::new(files);
        self.cursor = 0;
        self.started = Instant::now();
    }

    /// Find the next eligible file and advance the cursor past it.
    ///
    /// Returns a round with `found == None` once the list is exhausted.
    pub async fn next_round(&mut self, cancel: &CancellationToken) -> Result<Round, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let len = self.files.len();
        if self.cursor >= len {
            return Ok(Round::default());
        }

        // `len` means nothing found yet.
        let (best_tx, best_rx) = watch::channel(len);
        let best_tx = Arc::new(best_tx);
        let mut set: JoinSet<WorkerResult> = JoinSet::new();

        for k in 0..self.workers.min(len - self.cursor) {
            set.spawn(probe_worker(
                Arc::clone(&self.evaluator),
                Arc::clone(&self.files),
                self.cursor + k,
                self.workers,
                Arc::clone(&best_tx),
                best_rx.clone(),
                cancel.clone(),
            ));
        }

        let mut results: Vec<(usize, Evaluation)> = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(found)) => results.extend(found),
                Ok(Err(Cancelled)) => cancelled = true,
                Err(e) => {
                    tracing::error!("Probe worker panicked: {}", e);
                    cancelled |= cancel.is_cancelled();
                }
            }
        }
        if cancelled || cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let winner = *best_rx.borrow();
        results.sort_by_key(|(index, _)| *index);

        let mut round = Round::default();
        for (index, evaluation) in results {
            if index > winner {
                continue;
            }
            let file = self.files[index].clone();
            match evaluation {
                Evaluation::Skip(reason) if index < winner => round.skipped.push((file, reason)),
                Evaluation::Eligible {
                    probe_text,
                    variant,
                } if index == winner => {
                    round.found = Some(Candidate {
                        index,
                        file,
                        probe_text,
                        variant,
                    });
                }
                _ => {}
            }
        }

        self.cursor = if winner < len { winner + 1 } else { len };
        Ok(round)
    }
}

/// Walk one stride of the list until it runs past the best index.
async fn probe_worker(
    evaluator: Arc<dyn CandidateEvaluator>,
    files: Arc<Vec<LibraryFile>>,
    start: usize,
    stride: usize,
    best_tx: Arc<watch::Sender<usize>>,
    mut best_rx: watch::Receiver<usize>,
    cancel: CancellationToken,
) -> WorkerResult {
    let mut examined = Vec::new();
    let mut index = start;

    while index < files.len() && index < *best_rx.borrow() {
        let probe_cancel = cancel.child_token();
        let evaluation = evaluator.evaluate(&files[index], &probe_cancel);
        tokio::pin!(evaluation);

        let outcome = tokio::select! {
            result = &mut evaluation => Some(result),
            // The borrow guard from `wait_for` must not live across the await below.
            _ = async { let _ = best_rx.wait_for(|best| *best < index).await; } => {
                // A sibling found a lower index; stop this probe and its process.
                probe_cancel.cancel();
                let _ = evaluation.await;
                None
            }
        };

        let Some(result) = outcome else {
            break;
        };
        let evaluation = result?;

        if matches!(evaluation, Evaluation::Eligible { .. }) {
            best_tx.send_if_modified(|best| {
                if index < *best {
                    *best = index;
                    true
                } else {
                    false
                }
            });
            examined.push((index, evaluation));
            break;
        }

        examined.push((index, evaluation));
        index += stride;
    }

    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    Ok(examined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::fixtures::{tagged, PROFILE7};
    use crate::testing::{write_media, FakeLock, FakeRunner};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn files(n: usize) -> Vec<LibraryFile> {
        (0..n)
            .map(|i| LibraryFile {
                path: PathBuf::from(format!("/media/{:03}.mkv", i)),
                created: SystemTime::UNIX_EPOCH,
                modified: SystemTime::UNIX_EPOCH,
            })
            .collect()
    }

    fn index_of(file: &LibraryFile) -> usize {
        file.path.file_stem().unwrap().to_str().unwrap().parse().unwrap()
    }

    /// Eligibility by index, with a per-index delay.
    struct ScriptedEvaluator {
        eligible: HashSet<usize>,
        delay_ms: fn(usize) -> u64,
        calls: AtomicUsize,
        seen: parking_lot::Mutex<Vec<usize>>,
    }

    impl ScriptedEvaluator {
        fn new(eligible: &[usize], delay_ms: fn(usize) -> u64) -> Self {
            Self {
                eligible: eligible.iter().copied().collect(),
                delay_ms,
                calls: AtomicUsize::new(0),
                seen: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CandidateEvaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            file: &LibraryFile,
            cancel: &CancellationToken,
        ) -> Result<Evaluation, Cancelled> {
            let index = index_of(file);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis((self.delay_ms)(index))) => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
            self.seen.lock().push(index);
            Ok(if self.eligible.contains(&index) {
                Evaluation::Eligible {
                    probe_text: format!("probe {}", index),
                    variant: Variant::Remux,
                }
            } else {
                Evaluation::Skip(SkipReason::NotApplicable)
            })
        }
    }

    fn no_delay(_: usize) -> u64 {
        1
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_worker_future_is_send() {
        let (best_tx, best_rx) = watch::channel(4);
        let worker = probe_worker(
            Arc::new(ScriptedEvaluator::new(&[], no_delay)),
            Arc::new(files(4)),
            0,
            2,
            Arc::new(best_tx),
            best_rx,
            CancellationToken::new(),
        );
        assert_send(&worker);
    }

    #[tokio::test]
    async fn test_single_eligible_index_for_any_worker_count() {
        for workers in [1, 2, 5] {
            for k in [0, 3, 7, 11] {
                let evaluator = Arc::new(ScriptedEvaluator::new(&[k], no_delay));
                let mut scheduler = LookaheadScheduler::new(evaluator, workers, files(12));

                let round = scheduler.next_round(&CancellationToken::new()).await.unwrap();

                let found = round.found.expect("eligible file not found");
                assert_eq!(found.index, k, "workers={workers}");
                assert_eq!(found.probe_text, format!("probe {}", k));
                assert_eq!(scheduler.cursor(), k + 1, "workers={workers} k={k}");
                let skipped: Vec<usize> = round.skipped.iter().map(|(f, _)| index_of(f)).collect();
                assert_eq!(skipped, (0..k).collect::<Vec<_>>(), "workers={workers} k={k}");
            }
        }
    }

    #[tokio::test]
    async fn test_lowest_index_wins_even_when_found_last() {
        // Index 2 is slow; index 4 is found first by another worker.
        fn slow_two(index: usize) -> u64 {
            if index == 2 {
                80
            } else {
                1
            }
        }
        let evaluator = Arc::new(ScriptedEvaluator::new(&[2, 4], slow_two));
        let mut scheduler = LookaheadScheduler::new(evaluator, 3, files(10));

        let round = scheduler.next_round(&CancellationToken::new()).await.unwrap();

        assert_eq!(round.found.unwrap().index, 2);
        assert_eq!(scheduler.cursor(), 3);
        assert_eq!(round.skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_rounds_walk_the_list_then_exhaust() {
        let evaluator = Arc::new(ScriptedEvaluator::new(&[1, 5], no_delay));
        let mut scheduler = LookaheadScheduler::new(evaluator, 2, files(8));
        let token = CancellationToken::new();

        assert_eq!(scheduler.next_round(&token).await.unwrap().found.unwrap().index, 1);
        let second = scheduler.next_round(&token).await.unwrap();
        assert_eq!(second.found.unwrap().index, 5);
        assert_eq!(second.skipped.len(), 3);

        let last = scheduler.next_round(&token).await.unwrap();
        assert!(last.found.is_none());
        assert_eq!(last.skipped.len(), 2);
        assert!(scheduler.is_exhausted());

        let after = scheduler.next_round(&token).await.unwrap();
        assert!(after.found.is_none());
        assert!(after.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_workers_stop_past_the_winner() {
        let evaluator = Arc::new(ScriptedEvaluator::new(&[0], |i| if i == 0 { 1 } else { 50 }));
        let mut scheduler = LookaheadScheduler::new(evaluator.clone(), 2, files(100));

        let round = scheduler.next_round(&CancellationToken::new()).await.unwrap();

        assert_eq!(round.found.unwrap().index, 0);
        // Index 1 was in flight and abandoned; nothing further was started.
        assert!(evaluator.calls.load(Ordering::SeqCst) <= 3);
        assert!(!evaluator.seen.lock().contains(&1));
    }

    #[tokio::test]
    async fn test_outer_cancellation_propagates() {
        let evaluator = Arc::new(ScriptedEvaluator::new(&[], |_| 10_000));
        let mut scheduler = LookaheadScheduler::new(evaluator, 3, files(10));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        assert!(scheduler.next_round(&token).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_resync_resets_cursor() {
        let evaluator = Arc::new(ScriptedEvaluator::new(&[0], no_delay));
        let mut scheduler = LookaheadScheduler::new(evaluator, 2, files(3));
        scheduler.next_round(&CancellationToken::new()).await.unwrap();
        assert_eq!(scheduler.cursor(), 1);

        assert!(!scheduler.needs_resync(Duration::from_secs(3600)));
        assert!(scheduler.needs_resync(Duration::ZERO));
        scheduler.resync(files(5));
        assert_eq!(scheduler.cursor(), 0);
        assert_eq!(scheduler.len(), 5);
    }

    #[tokio::test]
    async fn test_candidate_probe_classifies_files() {
        let dir = TempDir::new().unwrap();
        let done = dir.path().join("done.mkv");
        let fresh = dir.path().join("fresh.mkv");
        let busy = dir.path().join("busy.mkv");
        write_media(&done, &tagged(PROFILE7, true), 2);
        write_media(&fresh, PROFILE7, 2);
        write_media(&busy, PROFILE7, 2);

        let runner = Arc::new(FakeRunner::new(1));
        let lock = Arc::new(FakeLock::default());
        lock.lock(&busy);
        let probe = CandidateProbe::new(runner.clone(), lock, PipelineConfig::default());
        let token = CancellationToken::new();
        let library_file = |path: &PathBuf| LibraryFile {
            path: path.clone(),
            created: SystemTime::UNIX_EPOCH,
            modified: SystemTime::UNIX_EPOCH,
        };

        assert_eq!(
            probe.evaluate(&library_file(&done), &token).await.unwrap(),
            Evaluation::Skip(SkipReason::AlreadyProcessed)
        );
        assert!(matches!(
            probe.evaluate(&library_file(&fresh), &token).await.unwrap(),
            Evaluation::Eligible { variant: Variant::Remux, .. }
        ));
        assert_eq!(
            probe.evaluate(&library_file(&busy), &token).await.unwrap(),
            Evaluation::Skip(SkipReason::Locked)
        );
        assert_eq!(
            probe
                .evaluate(&library_file(&dir.path().join("gone.mkv")), &token)
                .await
                .unwrap(),
            Evaluation::Skip(SkipReason::ProbeFailed)
        );
        // The locked file never reached the probe tool.
        assert!(!runner.calls().iter().any(|c| c.contains("busy.mkv")));
        assert!(!crate::descriptor::work_dir_for(&busy).exists());
    }
}
