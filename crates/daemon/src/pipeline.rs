//! Conversion pipeline module.
//!
//! One state machine drives every variant: the variant supplies its stage
//! list, each stage runs one external tool, and any failing stage ends the run
//! as `Failed`. Success, failure and cancellation all leave through the same
//! work directory guard, so intermediates never outlive the call.

use crate::classify::parse_bitrate_kbps;
use crate::descriptor::{PipelineState, Stage, Variant, VideoDescriptor};
use crate::encode::probe_command;
use crate::log_sink::LogSink;
use crate::process::{Cancelled, ProcessError, RunOptions, ToolRunner};
use crate::size_gate::{check_files, SizeGateResult, LARGER_THAN_INPUT};
use crate::tagging::append_metadata;
use library_optimizer_config::EncoderConfig;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a pipeline run stopped early
#[derive(Debug)]
enum StageError {
    Cancelled,
    Failed(String),
}

impl From<ProcessError> for StageError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Cancelled => StageError::Cancelled,
            other => StageError::Failed(other.to_string()),
        }
    }
}

/// Serial conversion pipeline
pub struct Pipeline {
    runner: Arc<dyn ToolRunner>,
    sink: Arc<dyn LogSink>,
    encoder: EncoderConfig,
}

impl Pipeline {
    pub fn new(runner: Arc<dyn ToolRunner>, sink: Arc<dyn LogSink>, encoder: EncoderConfig) -> Self {
        Self {
            runner,
            sink,
            encoder,
        }
    }

    /// Convert one library file and tag it with the outcome.
    ///
    /// # Arguments
    /// * `input` - Library file chosen by the scheduler
    /// * `probe_text` - Probe output the variant was selected from
    /// * `variant` - Stage sequence to run
    /// * `cancel` - Process-wide cancellation token
    ///
    /// # Returns
    /// * `Ok(VideoDescriptor)` - settled as `Success` or `Failed`
    /// * `Err(Cancelled)` - cancelled; the work directory is already gone
    pub async fn convert(
        &self,
        input: &Path,
        probe_text: String,
        variant: Variant,
        cancel: &CancellationToken,
    ) -> Result<VideoDescriptor, Cancelled> {
        let mut desc = VideoDescriptor::new(input, probe_text);
        self.sink
            .line(&format!("Processing file: {} ({})", input.display(), variant));

        let work_dir = match desc.prepare(variant, &self.encoder) {
            Ok(guard) => guard,
            Err(e) => {
                desc.mark_failed(format!("Failed to prepare work directory: {}", e));
                self.sink
                    .line(&format!("Conversion failed: {}", desc.reason.as_deref().unwrap_or_default()));
                return Ok(desc);
            }
        };

        match self.execute(&mut desc, variant, cancel).await {
            Ok(reason) => {
                desc.mark_success(reason);
                self.sink.line("Conversion succeeded.");
                self.log_bitrates(&mut desc, cancel).await?;
            }
            Err(StageError::Failed(reason)) => {
                self.sink.line(&format!("Conversion failed: {}", reason));
                desc.mark_failed(reason);
            }
            Err(StageError::Cancelled) => {
                self.sink.line("Conversion cancelled.");
                return Err(Cancelled);
            }
        }

        let tagged = append_metadata(self.runner.as_ref(), self.sink.as_ref(), &desc, cancel).await;
        drop(work_dir);
        tagged?;
        Ok(desc)
    }

    /// Run the stage list and the size gate. Returns the success reason.
    async fn execute(
        &self,
        desc: &mut VideoDescriptor,
        variant: Variant,
        cancel: &CancellationToken,
    ) -> Result<String, StageError> {
        for &stage in variant.stages() {
            self.run_stage(desc, stage, cancel).await?;
        }

        if !variant.has_size_gate() {
            ensure_output(desc)?;
            return Ok(variant.success_reason().to_string());
        }

        desc.state = PipelineState::SizeCheck;
        let gate = check_files(&desc.input, &desc.output_path)
            .map_err(|e| StageError::Failed(format!("Output file missing: {}", e)))?;

        match gate {
            SizeGateResult::Accept {
                input_mb,
                output_mb,
            } => {
                self.sink
                    .line(&format!("Size check passed: {} MB -> {} MB", input_mb, output_mb));
                Ok(variant.success_reason().to_string())
            }
            SizeGateResult::Reject {
                input_mb,
                output_mb,
            } => {
                self.sink.line(&format!(
                    "{}: {} MB >= {} MB",
                    LARGER_THAN_INPUT, output_mb, input_mb
                ));
                if let Err(e) = fs::remove_file(&desc.output_path) {
                    tracing::debug!("Failed to remove rejected output: {}", e);
                }

                if !variant.can_roll_back() {
                    return Err(StageError::Failed(LARGER_THAN_INPUT.to_string()));
                }

                self.sink
                    .line("Discarding encode and remuxing the unencoded Profile 8 stream.");
                self.run_stage(desc, Stage::RemuxUnencoded, cancel).await?;
                ensure_output(desc)?;
                Ok(format!(
                    "{}; encode discarded: {}",
                    Variant::Remux.success_reason(),
                    LARGER_THAN_INPUT
                ))
            }
        }
    }

    async fn run_stage(
        &self,
        desc: &mut VideoDescriptor,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let command = desc
            .command(stage)
            .ok_or_else(|| StageError::Failed(format!("No command prepared for {:?}", stage)))?
            .to_string();

        desc.state = stage.state();
        self.sink.line(&format!("{}...", stage.label()));
        tracing::debug!(file = %desc.input.display(), ?stage, "Running: {}", command);

        self.runner
            .run(&command, &desc.video_name, RunOptions::logged(), cancel)
            .await?;

        if let Some(consumed) = desc.consumed_after(stage) {
            if let Err(e) = fs::remove_file(consumed) {
                tracing::debug!(path = %consumed.display(), "Intermediate already gone: {}", e);
            }
        }
        Ok(())
    }

    /// Probe the output for its bitrate and log it next to the input bitrate.
    async fn log_bitrates(
        &self,
        desc: &mut VideoDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let command = probe_command(&desc.output_path);
        match self
            .runner
            .run(&command, &desc.video_name, RunOptions::quiet(), cancel)
            .await
        {
            Ok(text) => desc.output_bitrate_kbps = parse_bitrate_kbps(&text),
            Err(ProcessError::Cancelled) => return Err(Cancelled),
            Err(e) => tracing::debug!("Output probe failed: {}", e),
        }

        let show = |kbps: Option<f64>| {
            kbps.map(|v| format!("{:.0} kb/s", v))
                .unwrap_or_else(|| "unknown".to_string())
        };
        let input = desc.input_bitrate();
        self.sink.line(&format!(
            "Bitrate: {} -> {}",
            show(input),
            show(desc.output_bitrate_kbps)
        ));
        Ok(())
    }
}

fn ensure_output(desc: &VideoDescriptor) -> Result<(), StageError> {
    if desc.output_path.is_file() {
        Ok(())
    } else {
        Err(StageError::Failed(format!(
            "Output file missing: {}",
            desc.output_path.display()
        )))
    }
}
