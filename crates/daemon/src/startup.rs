//! Startup checks module for the library optimizer
//!
//! Provides preflight checks run before the first pass:
//! - Every external tool needed by the enabled pipelines runs
//! - FFmpeg was built with the hardware encoders the encoder settings select

use crate::config::{Config, EncoderConfig, PipelineConfig};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: &'static str, reason: String },

    #[error("FFmpeg is missing required encoders: {0}")]
    MissingEncoders(String),
}

/// An external tool and the argument that makes it print its version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tool {
    pub name: &'static str,
    pub version_arg: &'static str,
}

pub const FFMPEG: Tool = Tool {
    name: "ffmpeg",
    version_arg: "-version",
};
pub const DOVI_TOOL: Tool = Tool {
    name: "dovi_tool",
    version_arg: "--version",
};
pub const MKVMERGE: Tool = Tool {
    name: "mkvmerge",
    version_arg: "--version",
};

/// Tools the enabled pipelines invoke.
///
/// FFmpeg probes and tags every file, so it is always required. The Dolby
/// Vision pipelines add dovi_tool and mkvmerge.
pub fn required_tools(pipeline: &PipelineConfig) -> Vec<Tool> {
    let mut tools = vec![FFMPEG];
    if pipeline.remux_dolby_vision || pipeline.encode_hevc {
        tools.push(DOVI_TOOL);
        tools.push(MKVMERGE);
    }
    tools
}

/// Hardware encoders the enabled encode pipelines hand to FFmpeg.
pub fn required_encoders(pipeline: &PipelineConfig, encoder: &EncoderConfig) -> Vec<&'static str> {
    let mut encoders = Vec::new();
    if pipeline.encode_hevc {
        encoders.push(if encoder.is_nvidia { "hevc_nvenc" } else { "hevc_qsv" });
    }
    if pipeline.encode_av1 {
        encoders.push(if encoder.is_nvidia { "av1_nvenc" } else { "av1_qsv" });
    }
    encoders
}

/// Required encoders absent from `ffmpeg -encoders` output.
pub fn missing_encoders<'a>(encoders_output: &str, required: &[&'a str]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|name| {
            !encoders_output
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(**name))
        })
        .copied()
        .collect()
}

/// First non-empty line of a version banner.
pub fn version_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Run `<tool> <version_arg>` and return its version line.
pub fn check_tool_available(tool: Tool) -> Result<String, StartupError> {
    let output = Command::new(tool.name)
        .arg(tool.version_arg)
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.name,
            reason: format!("is it installed and in PATH? Error: {}", e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.name,
            reason: format!("{} {} failed", tool.name, tool.version_arg),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(version_line(&stdout).unwrap_or("(unknown version)").to_string())
}

/// Verify FFmpeg lists every hardware encoder the settings select
pub fn check_encoders(cfg: &Config) -> Result<(), StartupError> {
    let required = required_encoders(&cfg.pipeline, &cfg.encoder);
    if required.is_empty() {
        return Ok(());
    }

    let output = Command::new(FFMPEG.name)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: FFMPEG.name,
            reason: e.to_string(),
        })?;

    let missing = missing_encoders(&String::from_utf8_lossy(&output.stdout), &required);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StartupError::MissingEncoders(missing.join(", ")))
    }
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Tool availability for the enabled pipelines
/// 2. Hardware encoder support in FFmpeg
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    for tool in required_tools(&cfg.pipeline) {
        let version = check_tool_available(tool)?;
        tracing::info!(tool = tool.name, "{}", version);
    }
    check_encoders(cfg)?;
    Ok(())
}
