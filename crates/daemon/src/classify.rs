//! Classifier module for deciding which files are conversion candidates.
//!
//! All decisions are pure functions over the free-text stream description
//! printed by `ffmpeg -i <file>`. Keeping the text matching here means a switch
//! to structured probe output only touches this module.

use crate::descriptor::Variant;
use library_optimizer_config::PipelineConfig;
use regex::Regex;
use std::sync::LazyLock;

/// Metadata key carrying the persisted processing outcome.
pub const TAG_KEY: &str = "LIBRARY_OPTIMIZER_APP";

/// Substring present on every Dolby Vision stream.
pub const DOVI_MARKER: &str = "DOVI configuration record";

const CONVERTED_TRUE: &str = "Converted=True.";
const CONVERTED_FALSE: &str = "Converted=False.";

static PROFILE7_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"DOVI configuration record: version: [0-9.]+, profile: 7\b")
        .expect("static regex")
});

static BITRATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"bitrate:\s*([0-9]+(?:\.[0-9]+)?)\s*kb/s").expect("static regex")
});

/// Persisted processing outcome read back from the container tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    Untagged,
    Converted,
    Failed,
}

/// Why a file was passed over during lookahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Tag says converted, or failed with retries disabled
    AlreadyProcessed,
    /// Another process holds the file
    Locked,
    /// No enabled pipeline applies
    NotApplicable,
    /// The probe command itself failed
    ProbeFailed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyProcessed => write!(f, "already processed"),
            SkipReason::Locked => write!(f, "file in use"),
            SkipReason::NotApplicable => write!(f, "no applicable conversion"),
            SkipReason::ProbeFailed => write!(f, "probe failed"),
        }
    }
}

/// True when the stream carries a Dolby Vision Profile 7 configuration record.
pub fn is_profile7(probe_text: &str) -> bool {
    PROFILE7_RE.is_match(probe_text)
}

/// True when the stream carries any Dolby Vision configuration record.
pub fn has_dolby_vision(probe_text: &str) -> bool {
    probe_text.contains(DOVI_MARKER)
}

/// AV1 re-encode applies to anything that is neither AV1 already nor Dolby Vision.
pub fn can_encode_av1(probe_text: &str) -> bool {
    !probe_text.to_lowercase().contains("video: av1") && !has_dolby_vision(probe_text)
}

/// HEVC re-encode applies to Dolby Vision content that no longer needs a
/// Profile 7 conversion.
pub fn can_encode_hevc(probe_text: &str) -> bool {
    has_dolby_vision(probe_text) && !is_profile7(probe_text)
}

/// Read the processing tag from the probe text.
pub fn tag_state(probe_text: &str) -> TagState {
    if probe_text.contains(CONVERTED_TRUE) {
        TagState::Converted
    } else if probe_text.contains(CONVERTED_FALSE) {
        TagState::Failed
    } else {
        TagState::Untagged
    }
}

/// Skip files already converted, and failed files unless retries are enabled.
pub fn should_be_processed(probe_text: &str, retry_failed: bool) -> bool {
    match tag_state(probe_text) {
        TagState::Untagged => true,
        TagState::Converted => false,
        TagState::Failed => retry_failed,
    }
}

/// Container bitrate in kb/s from the `Duration: ..., bitrate: N kb/s` line.
pub fn parse_bitrate_kbps(probe_text: &str) -> Option<f64> {
    BITRATE_RE
        .captures(probe_text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Choose the pipeline for a probed file.
///
/// AV1 is tried first, then the Profile 7 paths, then the HEVC size-reduction
/// encode. Returns `None` when no enabled pipeline applies.
pub fn select_variant(pipeline: &PipelineConfig, probe_text: &str) -> Option<Variant> {
    if pipeline.encode_av1 && can_encode_av1(probe_text) {
        return Some(Variant::EncodeAv1);
    }
    if pipeline.remux_dolby_vision && is_profile7(probe_text) {
        return Some(if pipeline.encode_hevc {
            Variant::RemuxEncodeHevc
        } else {
            Variant::Remux
        });
    }
    if pipeline.encode_hevc && can_encode_hevc(probe_text) {
        return Some(Variant::EncodeHevc);
    }
    None
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use proptest::prelude::*;

    fn pipeline(remux: bool, hevc: bool, av1: bool) -> PipelineConfig {
        PipelineConfig {
            remux_dolby_vision: remux,
            encode_hevc: hevc,
            encode_av1: av1,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_profile_detection() {
        assert!(is_profile7(PROFILE7));
        assert!(!is_profile7(PROFILE8));
        assert!(!is_profile7(PLAIN_H264));
        assert!(!is_profile7("DOVI configuration record: version: 1.0, profile: 70"));
    }

    #[test]
    fn test_can_encode_av1() {
        assert!(can_encode_av1(PLAIN_H264));
        assert!(!can_encode_av1(AV1));
        assert!(!can_encode_av1(PROFILE7));
        assert!(!can_encode_av1(PROFILE8));
    }

    #[test]
    fn test_can_encode_hevc() {
        assert!(can_encode_hevc(PROFILE8));
        assert!(!can_encode_hevc(PROFILE7));
        assert!(!can_encode_hevc(PLAIN_H264));
    }

    #[test]
    fn test_should_be_processed_follows_tag() {
        assert!(should_be_processed(PROFILE7, false));
        assert!(!should_be_processed(&tagged(PROFILE7, true), false));
        assert!(!should_be_processed(&tagged(PROFILE7, true), true));
        assert!(!should_be_processed(&tagged(PROFILE7, false), false));
        assert!(should_be_processed(&tagged(PROFILE7, false), true));
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate_kbps(PROFILE7), Some(65000.0));
        assert_eq!(parse_bitrate_kbps(PLAIN_H264), Some(12000.0));
        assert_eq!(parse_bitrate_kbps("Duration: N/A, bitrate: N/A"), None);
    }

    #[test]
    fn test_select_variant() {
        assert_eq!(select_variant(&pipeline(true, false, false), PROFILE7), Some(Variant::Remux));
        assert_eq!(
            select_variant(&pipeline(true, true, false), PROFILE7),
            Some(Variant::RemuxEncodeHevc)
        );
        assert_eq!(
            select_variant(&pipeline(false, true, false), PROFILE8),
            Some(Variant::EncodeHevc)
        );
        assert_eq!(select_variant(&pipeline(false, true, false), PROFILE7), None);
        assert_eq!(
            select_variant(&pipeline(true, true, true), PLAIN_H264),
            Some(Variant::EncodeAv1)
        );
        assert_eq!(select_variant(&pipeline(true, true, true), AV1), None);
        assert_eq!(select_variant(&pipeline(false, false, false), PROFILE7), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Profile 7 content is never routed to the AV1 encoder.
        #[test]
        fn prop_profile7_excludes_av1(
            prefix in "[ -~\n]{0,80}",
            suffix in "[ -~\n]{0,80}",
            include_marker in proptest::bool::ANY,
        ) {
            let text = if include_marker {
                format!("{}{}{}", prefix, PROFILE7, suffix)
            } else {
                format!("{}{}", prefix, suffix)
            };
            if is_profile7(&text) {
                prop_assert!(!can_encode_av1(&text));
            }
        }

        // A file tagged converted is never reprocessed, whatever the retry flag.
        #[test]
        fn prop_converted_tag_is_final(
            body in "[ -~\n]{0,120}",
            retry_failed in proptest::bool::ANY,
        ) {
            let text = format!("{}\n{}: Converted=True. Reason=", body, TAG_KEY);
            prop_assert!(!should_be_processed(&text, retry_failed));
        }

        // Selected variants always agree with the predicates.
        #[test]
        fn prop_selected_variant_matches_predicates(
            remux in proptest::bool::ANY,
            hevc in proptest::bool::ANY,
            av1 in proptest::bool::ANY,
            probe in prop::sample::select(vec![PROFILE7, PROFILE8, PLAIN_H264, AV1]),
        ) {
            match select_variant(&pipeline(remux, hevc, av1), probe) {
                Some(Variant::EncodeAv1) => prop_assert!(av1 && can_encode_av1(probe)),
                Some(Variant::Remux) => prop_assert!(remux && !hevc && is_profile7(probe)),
                Some(Variant::RemuxEncodeHevc) => prop_assert!(remux && hevc && is_profile7(probe)),
                Some(Variant::EncodeHevc) => prop_assert!(hevc && can_encode_hevc(probe)),
                None => {}
            }
        }
    }
}
