//! Command line builders for the external media tools.
//!
//! Every builder returns a single shell command string. Paths are quoted with
//! [`shell_quote`] so file names with spaces or quotes survive the shell.

use crate::classify::TAG_KEY;
use crate::process::shell_quote;
use library_optimizer_config::{BitrateTier, EncoderConfig, Quality};
use std::path::Path;

/// Upper bound on the failure reason stored in the container tag.
const MAX_TAG_REASON_CHARS: usize = 200;

fn quoted(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Diagnostic probe printing the container and stream description.
///
/// ffmpeg exits nonzero because no output is given; the runner treats that
/// stderr message as benign.
pub fn probe_command(input: &Path) -> String {
    format!("ffmpeg -i {} -hide_banner -loglevel info", quoted(input))
}

/// Copy the first video stream out as a raw HEVC elementary stream.
pub fn extract_command(input: &Path, hevc: &Path) -> String {
    format!(
        "ffmpeg -y -i {} -map 0:v:0 -c copy {}",
        quoted(input),
        quoted(hevc)
    )
}

/// Convert a Profile 7 stream to Profile 8.1 (`-m 2` drops the enhancement layer).
pub fn convert_command(hevc: &Path, p8: &Path) -> String {
    format!(
        "dovi_tool -m 2 convert -i {} -o {}",
        quoted(hevc),
        quoted(p8)
    )
}

pub fn extract_rpu_command(stream: &Path, rpu: &Path) -> String {
    format!(
        "dovi_tool extract-rpu -i {} -o {}",
        quoted(stream),
        quoted(rpu)
    )
}

/// Hardware HEVC encode of an elementary stream.
pub fn hevc_encode_command(encoder: &EncoderConfig, stream: &Path, encoded: &Path) -> String {
    if encoder.is_nvidia {
        format!(
            "ffmpeg -y -i {} -c:v hevc_nvenc -preset p7 -cq {} -c:a copy {}",
            quoted(stream),
            encoder.hevc_nvenc_cq,
            quoted(encoded)
        )
    } else {
        format!(
            "ffmpeg -y -hwaccel qsv -i {} -c:v hevc_qsv -preset 1 -global_quality {} -c:a copy {}",
            quoted(stream),
            encoder.hevc_qsv_global_quality,
            quoted(encoded)
        )
    }
}

pub fn inject_rpu_command(encoded: &Path, rpu: &Path, output: &Path) -> String {
    format!(
        "dovi_tool inject-rpu -i {} -r {} -o {}",
        quoted(encoded),
        quoted(rpu),
        quoted(output)
    )
}

/// Replace the original video track with `stream`, keeping audio, subtitles
/// and chapters from `original`.
pub fn remux_command(original: &Path, stream: &Path, output: &Path) -> String {
    format!(
        "mkvmerge -o {} -D {} {}",
        quoted(output),
        quoted(original),
        quoted(stream)
    )
}

/// Whole-container AV1 encode keeping every audio and subtitle track.
pub fn av1_encode_command(
    encoder: &EncoderConfig,
    input: &Path,
    output: &Path,
    quality_value: u8,
) -> String {
    let video = if encoder.is_nvidia {
        format!("-c:v av1_nvenc -cq {} -preset p7", quality_value)
    } else {
        format!("-c:v av1_qsv -global_quality {} -preset 1", quality_value)
    };
    let hwaccel = if encoder.is_nvidia { "" } else { "-hwaccel qsv " };
    format!(
        "ffmpeg -y {}-i {} -map 0:v:0 -map '0:a?' -map '0:s?' {} -c:a copy -c:s copy -map_metadata 0 -map_chapters 0 {}",
        hwaccel,
        quoted(input),
        video,
        quoted(output)
    )
}

/// Value stored under [`TAG_KEY`].
///
/// The reason is flattened to one line, stripped of anything that reads as a
/// tag marker, and truncated.
pub fn tag_value(converted: bool, reason: &str) -> String {
    let flattened = reason
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("Converted=", "Converted:");
    let reason: String = flattened.chars().take(MAX_TAG_REASON_CHARS).collect();
    format!(
        "Converted={}. Reason={}",
        if converted { "True" } else { "False" },
        reason
    )
}

/// Copy every stream of `source` into `tagged`, adding the processing tag.
pub fn tag_command(source: &Path, tagged: &Path, converted: bool, reason: &str) -> String {
    let metadata = format!("{}={}", TAG_KEY, tag_value(converted, reason));
    format!(
        "ffmpeg -y -i {} -map 0 -c:v copy -c:a copy -c:s copy -metadata {} {}",
        quoted(source),
        shell_quote(&metadata),
        quoted(tagged)
    )
}

/// Pick the encoder value for an input bitrate from a tier table.
///
/// The first tier (highest threshold first) whose `min_mbps` the bitrate
/// reaches wins. An unknown bitrate or one below every threshold falls to the
/// lowest tier.
pub fn tier_value(tiers: &[BitrateTier], bitrate_mbps: Option<f64>) -> Option<u8> {
    let mut sorted: Vec<&BitrateTier> = tiers.iter().collect();
    sorted.sort_by(|a, b| b.min_mbps.total_cmp(&a.min_mbps));

    let lowest = sorted.last().map(|tier| tier.value);
    match bitrate_mbps {
        Some(mbps) => sorted
            .iter()
            .find(|tier| mbps >= tier.min_mbps)
            .map(|tier| tier.value)
            .or(lowest),
        None => lowest,
    }
}

/// AV1 quality value for the configured vendor, bitrate and quality preference.
pub fn av1_quality_value(encoder: &EncoderConfig, input_bitrate_kbps: Option<f64>) -> u8 {
    let tiers = if encoder.is_nvidia {
        &encoder.av1_nvenc_tiers
    } else {
        &encoder.av1_qsv_tiers
    };
    let base = tier_value(tiers, input_bitrate_kbps.map(|kbps| kbps / 1000.0)).unwrap_or(1);

    match encoder.quality {
        Quality::NearLossless => 1,
        Quality::HighQuality => base.saturating_sub(2).max(1),
        Quality::Balanced => base,
    }
}
