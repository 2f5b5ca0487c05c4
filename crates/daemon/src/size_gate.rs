//! Size Gate Module
//!
//! Post-encode validation ensuring the output is smaller than the input.
//! Sizes are compared in whole megabytes (1 MB = 1 000 000 bytes, truncated).

use std::fs;
use std::io;
use std::path::Path;

const BYTES_PER_MB: u64 = 1_000_000;

/// Reason recorded when an encode does not shrink the file.
pub const LARGER_THAN_INPUT: &str = "Output file larger than input";

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeGateResult {
    /// Output is smaller than the input
    Accept { input_mb: u64, output_mb: u64 },
    /// Output is the same size or larger
    Reject { input_mb: u64, output_mb: u64 },
}

/// Truncating byte to megabyte conversion.
pub fn to_mb(bytes: u64) -> u64 {
    bytes / BYTES_PER_MB
}

/// Check if the output size passes the size gate.
///
/// Returns `Reject` if `output_mb >= input_mb`, otherwise `Accept`.
///
/// # Arguments
/// * `input_bytes` - Size of the library file in bytes
/// * `output_bytes` - Size of the produced output in bytes
pub fn check_size_gate(input_bytes: u64, output_bytes: u64) -> SizeGateResult {
    let input_mb = to_mb(input_bytes);
    let output_mb = to_mb(output_bytes);

    if output_mb >= input_mb {
        SizeGateResult::Reject {
            input_mb,
            output_mb,
        }
    } else {
        SizeGateResult::Accept {
            input_mb,
            output_mb,
        }
    }
}

/// Run the size gate against two files on disk.
pub fn check_files(input: &Path, output: &Path) -> io::Result<SizeGateResult> {
    let input_bytes = fs::metadata(input)?.len();
    let output_bytes = fs::metadata(output)?.len();
    Ok(check_size_gate(input_bytes, output_bytes))
}
