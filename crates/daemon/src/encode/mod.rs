//! Command construction for the wrapped media tools

pub mod commands;

pub use commands::{
    av1_encode_command, av1_quality_value, convert_command, extract_command,
    extract_rpu_command, hevc_encode_command, inject_rpu_command, probe_command, remux_command,
    tag_command, tag_value, tier_value,
};
