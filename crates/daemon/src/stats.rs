//! Per-pass run statistics.
//!
//! A rescan restarts the file list, so the same path can be reported more
//! than once per pass. Counts are kept per path: the latest skip reason wins,
//! and a conversion result replaces an earlier skip.

use crate::classify::SkipReason;
use crate::descriptor::{Outcome, VideoDescriptor};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Counters and file lists for one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub skipped_processed: usize,
    pub skipped_locked: usize,
    pub skipped_not_applicable: usize,
    pub skipped_probe_failed: usize,
    pub failed: usize,
    pub converted: usize,
    pub converted_files: Vec<PathBuf>,
    pub failed_files: Vec<PathBuf>,
    skipped_files: BTreeMap<PathBuf, SkipReason>,
}

impl RunStatistics {
    fn counter(&mut self, reason: SkipReason) -> &mut usize {
        match reason {
            SkipReason::AlreadyProcessed => &mut self.skipped_processed,
            SkipReason::Locked => &mut self.skipped_locked,
            SkipReason::NotApplicable => &mut self.skipped_not_applicable,
            SkipReason::ProbeFailed => &mut self.skipped_probe_failed,
        }
    }

    /// Count a skip once per path. Files already converted or failed in this
    /// pass are not counted again.
    pub fn record_skip(&mut self, path: &Path, reason: SkipReason) {
        if self.was_processed(path) {
            return;
        }
        if let Some(previous) = self.skipped_files.insert(path.to_path_buf(), reason) {
            *self.counter(previous) -= 1;
        }
        *self.counter(reason) += 1;
    }

    pub fn record_outcome(&mut self, desc: &VideoDescriptor) {
        let list = match desc.outcome {
            Outcome::Success => {
                self.converted += 1;
                &mut self.converted_files
            }
            Outcome::Failed => {
                self.failed += 1;
                &mut self.failed_files
            }
            Outcome::NotConverted => return,
        };
        list.push(desc.input.clone());

        if let Some(previous) = self.skipped_files.remove(&desc.input) {
            *self.counter(previous) -= 1;
        }
    }

    /// Whether `path` went through the pipeline during this pass.
    pub fn was_processed(&self, path: &Path) -> bool {
        self.converted_files.iter().any(|p| p == path) || self.failed_files.iter().any(|p| p == path)
    }

    pub fn skipped(&self) -> usize {
        self.skipped_processed
            + self.skipped_locked
            + self.skipped_not_applicable
            + self.skipped_probe_failed
    }

    /// Summary block written to the log sink at the end of a pass.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "============= Run Summary ============");
        let _ = writeln!(out, "Skipped (already processed): {}", self.skipped_processed);
        let _ = writeln!(out, "Skipped (in use): {}", self.skipped_locked);
        let _ = writeln!(out, "Skipped (not applicable): {}", self.skipped_not_applicable);
        let _ = writeln!(out, "Skipped (probe failed): {}", self.skipped_probe_failed);
        let _ = writeln!(out, "Failed: {}", self.failed);
        let _ = writeln!(out, "Converted: {}", self.converted);
        let _ = writeln!(out, "============= Converted Files ============");
        for path in &self.converted_files {
            let _ = writeln!(out, "{}", path.display());
        }
        let _ = writeln!(out, "============= Failed Files ============");
        for path in &self.failed_files {
            let _ = writeln!(out, "{}", path.display());
        }
        let _ = writeln!(out, "============= Skipped Files ============");
        for (path, reason) in &self.skipped_files {
            let _ = writeln!(out, "{} ({})", path.display(), reason);
        }
        out
    }
}
