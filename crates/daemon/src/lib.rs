//! Library Optimizer
//!
//! Background service that walks a media library, converts Dolby Vision
//! Profile 7 files to Profile 8, optionally re-encodes them with a hardware
//! encoder, and tags every processed file so later passes skip it.

pub mod classify;
pub mod daemon;
pub mod descriptor;
pub mod encode;
pub mod lock;
pub mod log_sink;
pub mod lookahead;
pub mod pipeline;
pub mod process;
pub mod replace;
pub mod scan;
pub mod schedule;
pub mod size_gate;
pub mod startup;
pub mod stats;
pub mod tagging;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{
    can_encode_av1, can_encode_hevc, is_profile7, select_variant, should_be_processed,
    SkipReason, TagState,
};
pub use daemon::{Optimizer, OptimizerError};
pub use descriptor::{Outcome, PipelineState, Stage, Variant, VideoDescriptor};
pub use library_optimizer_config as config;
pub use library_optimizer_config::Config;
pub use lock::{FileLock, RenameProbe};
pub use log_sink::{LogSink, RunLog};
pub use lookahead::{CandidateEvaluator, CandidateProbe, LookaheadScheduler, Round};
pub use pipeline::Pipeline;
pub use process::{Cancelled, ProcessError, ProcessRunner, RunOptions, ToolRunner};
pub use scan::{scan_library, LibraryFile, ScanScope};
pub use startup::{run_startup_checks, StartupError};
pub use stats::RunStatistics;
