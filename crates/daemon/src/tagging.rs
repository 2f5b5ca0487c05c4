//! Metadata append module.
//!
//! After the pipeline settles, the library file is tagged with its outcome so
//! the next scan can skip it. The tag is written into a side copy inside the
//! work directory, which then replaces the library file. Everything here is
//! best effort: only cancellation escapes. The caller owns the work
//! directory and must keep it alive until this returns.

use crate::descriptor::VideoDescriptor;
use crate::encode::tag_command;
use crate::log_sink::LogSink;
use crate::process::{Cancelled, ProcessError, RunOptions, ToolRunner};
use crate::replace::replace_with_backup;
use tokio_util::sync::CancellationToken;

/// Tag the outcome onto the library file.
///
/// On success the converted output is tagged and moved over the original; on
/// failure the original itself is tagged in place.
///
/// # Returns
/// * `Ok(true)` - the library file now carries the tag
/// * `Ok(false)` - tagging failed and was logged
/// * `Err(Cancelled)` - the tag command was cancelled
pub async fn append_metadata(
    runner: &dyn ToolRunner,
    sink: &dyn LogSink,
    desc: &VideoDescriptor,
    cancel: &CancellationToken,
) -> Result<bool, Cancelled> {
    let converted = desc.is_success();
    let reason = desc.reason.as_deref().unwrap_or_default();
    let source = if converted {
        &desc.output_path
    } else {
        &desc.input
    };

    if !desc.work_dir.is_dir() {
        sink.line("Failed to append metadata: work directory is missing");
        return Ok(false);
    }

    sink.line(&format!(
        "Appending metadata: Converted={}. Reason={}",
        if converted { "True" } else { "False" },
        reason
    ));
    let command = tag_command(source, &desc.tagged_path, converted, reason);
    match runner
        .run(&command, &desc.video_name, RunOptions::logged(), cancel)
        .await
    {
        Ok(_) => {}
        Err(ProcessError::Cancelled) => return Err(Cancelled),
        Err(e) => {
            sink.line(&format!("Failed to append metadata: {}", e));
            return Ok(false);
        }
    }

    match replace_with_backup(&desc.input, &desc.tagged_path) {
        Ok(()) => {
            sink.line("Metadata appended.");
            Ok(true)
        }
        Err(e) => {
            sink.line(&format!("Failed to replace original with tagged copy: {}", e));
            Ok(false)
        }
    }
}
