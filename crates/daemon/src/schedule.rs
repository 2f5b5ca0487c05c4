//! Time-of-day gating for library passes.

use crate::scan::ScanScope;
use library_optimizer_config::Config;
use std::time::Duration;

pub const HOUR: Duration = Duration::from_secs(60 * 60);

/// Whole hours from `now_hour` until `start_hour`, wrapping at midnight.
/// Zero when the current hour is the start hour.
pub fn hours_until_start(start_hour: u32, now_hour: u32) -> u32 {
    (start_hour % 24 + 24 - now_hour % 24) % 24
}

/// Hours to sleep after a pass finished at `now_hour`.
///
/// A pass ending inside its own start hour waits a full day instead of
/// starting again straight away.
pub fn hours_until_next_pass(start_hour: u32, now_hour: u32) -> u32 {
    match hours_until_start(start_hour, now_hour) {
        0 => 24,
        hours => hours,
    }
}

/// Scope of the first pass after startup.
pub fn initial_scope(config: &Config) -> ScanScope {
    if config.library.check_all || config.schedule.force_start {
        ScanScope::All
    } else {
        ScanScope::Recent
    }
}
