//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error when writing a default file
    Serialize(toml::ser::Error),
    /// Values parsed but out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to write default config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Encode quality preference
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Always use the lowest quantizer the encoder accepts
    NearLossless,
    /// Bias every bitrate tier two steps towards quality
    HighQuality,
    /// Use the tier value unchanged
    #[default]
    Balanced,
}

impl Quality {
    /// Parse a quality name, accepting snake_case, kebab-case or CamelCase spellings.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "nearlossless" => Some(Quality::NearLossless),
            "highquality" => Some(Quality::HighQuality),
            "balanced" => Some(Quality::Balanced),
            _ => None,
        }
    }
}

/// Library scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Root directories scanned recursively
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Scan every file on the first pass (false = recent files only)
    #[serde(default = "default_check_all")]
    pub check_all: bool,
    /// Trailing window for recent-only passes, in days
    #[serde(default = "default_recent_days")]
    pub recent_days: u32,
    /// Container extension considered a media file (without the dot)
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_check_all() -> bool {
    true
}

fn default_recent_days() -> u32 {
    7
}

fn default_extension() -> String {
    "mkv".to_string()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            check_all: default_check_all(),
            recent_days: default_recent_days(),
            extension: default_extension(),
        }
    }
}

/// Schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Local hour (0-23) at which a pass starts
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    /// Start the first pass immediately, ignoring the start hour
    #[serde(default)]
    pub force_start: bool,
    /// Rescan the library when a single pass runs longer than this many days
    #[serde(default = "default_resync_after_days")]
    pub resync_after_days: u32,
}

fn default_start_hour() -> u32 {
    3
}

fn default_resync_after_days() -> u32 {
    7
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_hour: default_start_hour(),
            force_start: false,
            resync_after_days: default_resync_after_days(),
        }
    }
}

/// Which pipelines are enabled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Convert Dolby Vision Profile 7 to Profile 8
    #[serde(default = "default_remux_dolby_vision")]
    pub remux_dolby_vision: bool,
    /// Re-encode Dolby Vision HEVC streams
    #[serde(default)]
    pub encode_hevc: bool,
    /// Re-encode non Dolby Vision files to AV1
    #[serde(default)]
    pub encode_av1: bool,
    /// Retry files previously tagged as failed
    #[serde(default)]
    pub retry_failed: bool,
    /// Number of concurrent probe workers in the lookahead scheduler
    #[serde(default = "default_lookahead_workers")]
    pub lookahead_workers: usize,
}

fn default_remux_dolby_vision() -> bool {
    true
}

fn default_lookahead_workers() -> usize {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            remux_dolby_vision: default_remux_dolby_vision(),
            encode_hevc: false,
            encode_av1: false,
            retry_failed: false,
            lookahead_workers: default_lookahead_workers(),
        }
    }
}

/// One entry of a bitrate-to-quality table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BitrateTier {
    /// Lowest input bitrate (Mbps) this tier applies to
    pub min_mbps: f64,
    /// Encoder quality value (cq for NVENC, global_quality for QSV)
    pub value: u8,
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Use NVIDIA NVENC encoders instead of Intel QSV
    #[serde(default)]
    pub is_nvidia: bool,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_hevc_nvenc_cq")]
    pub hevc_nvenc_cq: u8,
    #[serde(default = "default_hevc_qsv_global_quality")]
    pub hevc_qsv_global_quality: u8,
    #[serde(default = "default_av1_nvenc_tiers")]
    pub av1_nvenc_tiers: Vec<BitrateTier>,
    #[serde(default = "default_av1_qsv_tiers")]
    pub av1_qsv_tiers: Vec<BitrateTier>,
}

fn default_hevc_nvenc_cq() -> u8 {
    3
}

fn default_hevc_qsv_global_quality() -> u8 {
    13
}

fn default_av1_nvenc_tiers() -> Vec<BitrateTier> {
    vec![
        BitrateTier { min_mbps: 12.0, value: 25 },
        BitrateTier { min_mbps: 7.0, value: 29 },
        BitrateTier { min_mbps: 0.0, value: 32 },
    ]
}

fn default_av1_qsv_tiers() -> Vec<BitrateTier> {
    vec![
        BitrateTier { min_mbps: 11.0, value: 20 },
        BitrateTier { min_mbps: 6.0, value: 21 },
        BitrateTier { min_mbps: 0.0, value: 22 },
    ]
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            is_nvidia: false,
            quality: Quality::default(),
            hevc_nvenc_cq: default_hevc_nvenc_cq(),
            hevc_qsv_global_quality: default_hevc_qsv_global_quality(),
            av1_nvenc_tiers: default_av1_nvenc_tiers(),
            av1_qsv_tiers: default_av1_qsv_tiers(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Directory receiving the dated per-file and per-pass log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/config/logs")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parse a boolean environment value.
///
/// Accepts "true", "1", "yes", "y" as true and "false", "0", "no", "n" as false.
fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn override_bool(name: &str, target: &mut bool) {
    if let Ok(val) = env::var(name) {
        if let Some(parsed) = parse_bool(&val) {
            *target = parsed;
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Serialize the configuration back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - LIBRARY_PATHS -> library.paths (comma separated)
    /// - CHECK_ALL -> library.check_all
    /// - START_HOUR -> schedule.start_hour
    /// - FORCE_START -> schedule.force_start
    /// - REMUX_DOLBY_VISION -> pipeline.remux_dolby_vision
    /// - ENCODE_HEVC -> pipeline.encode_hevc
    /// - ENCODE_AV1 -> pipeline.encode_av1
    /// - RETRY_FAILED -> pipeline.retry_failed
    /// - IS_NVIDIA -> encoder.is_nvidia
    /// - QUALITY -> encoder.quality
    /// - LOG_DIR -> logging.log_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LIBRARY_PATHS") {
            let paths: Vec<PathBuf> = val
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
            if !paths.is_empty() {
                self.library.paths = paths;
            }
        }

        override_bool("CHECK_ALL", &mut self.library.check_all);

        if let Ok(val) = env::var("START_HOUR") {
            if let Ok(hour) = val.trim().parse::<u32>() {
                self.schedule.start_hour = hour;
            }
        }

        override_bool("FORCE_START", &mut self.schedule.force_start);
        override_bool("REMUX_DOLBY_VISION", &mut self.pipeline.remux_dolby_vision);
        override_bool("ENCODE_HEVC", &mut self.pipeline.encode_hevc);
        override_bool("ENCODE_AV1", &mut self.pipeline.encode_av1);
        override_bool("RETRY_FAILED", &mut self.pipeline.retry_failed);
        override_bool("IS_NVIDIA", &mut self.encoder.is_nvidia);

        if let Ok(val) = env::var("QUALITY") {
            if let Some(quality) = Quality::parse(&val) {
                self.encoder.quality = quality;
            }
        }

        if let Ok(val) = env::var("LOG_DIR") {
            if !val.trim().is_empty() {
                self.logging.log_dir = PathBuf::from(val.trim());
            }
        }
    }

    /// Reject values that parse but cannot drive a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.start_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "schedule.start_hour must be 0-23, got {}",
                self.schedule.start_hour
            )));
        }
        if self.schedule.resync_after_days == 0 {
            return Err(ConfigError::Invalid(
                "schedule.resync_after_days must be at least 1".to_string(),
            ));
        }
        if self.pipeline.lookahead_workers == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.lookahead_workers must be at least 1".to_string(),
            ));
        }
        if self.library.extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Invalid(
                "library.extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration, writing a default file first if none exists
    ///
    /// Returns the loaded config and whether a new file was written.
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<(Self, bool), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, Config::default().to_toml()?)?;

        Ok((Self::load(path)?, true))
    }
}
