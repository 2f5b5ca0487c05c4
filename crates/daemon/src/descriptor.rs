//! Video descriptor module.
//!
//! A [`VideoDescriptor`] holds everything the pipeline knows about one file
//! during one run: the probe text, the private work directory and the
//! intermediate paths inside it, one command per stage, and the outcome.

use crate::classify::parse_bitrate_kbps;
use crate::encode::{
    av1_encode_command, av1_quality_value, convert_command, extract_command, extract_rpu_command,
    hevc_encode_command, inject_rpu_command, remux_command,
};
use crate::process::shell_quote;
use library_optimizer_config::EncoderConfig;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marker written into every work directory so media servers do not index it.
pub const PLEXIGNORE: &str = ".plexignore";

/// Suffix of the hidden work directory created next to the input.
pub const WORK_DIR_SUFFIX: &str = ".optimizing";

/// Pipeline entry variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Profile 7 to Profile 8 without touching the pixels
    Remux,
    /// Profile 7 to Profile 8, then a hardware HEVC re-encode
    RemuxEncodeHevc,
    /// HEVC re-encode of Dolby Vision content already in Profile 8
    EncodeHevc,
    /// Whole-container AV1 re-encode of non Dolby Vision content
    EncodeAv1,
}

impl Variant {
    /// Tool stages in execution order. Rollback stages are not listed.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Variant::Remux => &[Stage::Extract, Stage::Convert, Stage::Remux],
            Variant::RemuxEncodeHevc => &[
                Stage::Extract,
                Stage::Convert,
                Stage::ExtractRpu,
                Stage::Encode,
                Stage::InjectRpu,
                Stage::Remux,
            ],
            Variant::EncodeHevc => &[
                Stage::Extract,
                Stage::ExtractRpu,
                Stage::Encode,
                Stage::InjectRpu,
                Stage::Remux,
            ],
            Variant::EncodeAv1 => &[Stage::Encode],
        }
    }

    /// Whether the output must be smaller than the input.
    pub fn has_size_gate(self) -> bool {
        !matches!(self, Variant::Remux)
    }

    /// Whether an oversized output falls back to an unencoded remux.
    pub fn can_roll_back(self) -> bool {
        matches!(self, Variant::RemuxEncodeHevc)
    }

    /// Tag reason recorded on success.
    pub fn success_reason(self) -> &'static str {
        match self {
            Variant::Remux => "Remuxed to Dolby Vision Profile 8",
            Variant::RemuxEncodeHevc => "Remuxed to Dolby Vision Profile 8 and encoded to HEVC",
            Variant::EncodeHevc => "Encoded to HEVC",
            Variant::EncodeAv1 => "Encoded to AV1",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Remux => write!(f, "remux"),
            Variant::RemuxEncodeHevc => write!(f, "remux + hevc encode"),
            Variant::EncodeHevc => write!(f, "hevc encode"),
            Variant::EncodeAv1 => write!(f, "av1 encode"),
        }
    }
}

/// One external tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Extract,
    Convert,
    ExtractRpu,
    Encode,
    InjectRpu,
    Remux,
    /// Remux of the unencoded Profile 8 stream after a rejected encode
    RemuxUnencoded,
}

impl Stage {
    pub fn state(self) -> PipelineState {
        match self {
            Stage::Extract => PipelineState::Extracting,
            Stage::Convert => PipelineState::Converting,
            Stage::ExtractRpu => PipelineState::RpuExtracting,
            Stage::Encode => PipelineState::Encoding,
            Stage::InjectRpu => PipelineState::RpuInjecting,
            Stage::Remux | Stage::RemuxUnencoded => PipelineState::Remuxing,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Extract => "Extracting video stream",
            Stage::Convert => "Converting Dolby Vision profile 7 to 8",
            Stage::ExtractRpu => "Extracting RPU",
            Stage::Encode => "Encoding",
            Stage::InjectRpu => "Injecting RPU",
            Stage::Remux => "Remuxing",
            Stage::RemuxUnencoded => "Remuxing unencoded stream",
        }
    }
}

/// Position of a descriptor in the pipeline state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Extracting,
    Converting,
    RpuExtracting,
    Encoding,
    RpuInjecting,
    Remuxing,
    SizeCheck,
    Success,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Success | PipelineState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotConverted,
    Success,
    Failed,
}

/// Owns a descriptor's work directory and removes it when dropped.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Create `path` fresh, removing any leftover from an earlier run.
    pub fn create(path: &Path) -> io::Result<Self> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        fs::create_dir_all(path)?;
        let guard = Self {
            path: path.to_path_buf(),
        };
        fs::write(path.join(PLEXIGNORE), "*")?;
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            tracing::error!(
                path = %self.path.display(),
                "Failed to remove work directory: {}",
                e
            );
        }
    }
}

/// Per-file, per-run state of the conversion pipeline
#[derive(Debug, Clone)]
pub struct VideoDescriptor {
    /// Library file being converted
    pub input: PathBuf,
    /// `input` quoted for the platform shell
    pub escaped_input: String,
    /// File stem, used for intermediate names and log names
    pub video_name: String,
    /// Raw probe output the classifier matched against
    pub probe_text: String,
    pub input_bitrate_kbps: Option<f64>,
    pub output_bitrate_kbps: Option<f64>,
    pub work_dir: PathBuf,
    pub hevc_path: PathBuf,
    pub p8_path: PathBuf,
    pub rpu_path: PathBuf,
    pub encoded_path: PathBuf,
    pub injected_path: PathBuf,
    pub output_path: PathBuf,
    /// Side copy receiving the processing tag
    pub tagged_path: PathBuf,
    pub variant: Option<Variant>,
    pub state: PipelineState,
    pub outcome: Outcome,
    pub reason: Option<String>,
    commands: BTreeMap<Stage, String>,
}

/// Hidden work directory for `input`: `<parent>/.<stem>.optimizing`.
pub fn work_dir_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let parent = input.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}{}", stem, WORK_DIR_SUFFIX))
}

impl VideoDescriptor {
    /// Derive names and paths for `input`. Nothing touches the disk here.
    pub fn new(input: &Path, probe_text: String) -> Self {
        let video_name = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let file_name = input
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.mkv", video_name));
        let work_dir = work_dir_for(input);

        Self {
            input: input.to_path_buf(),
            escaped_input: shell_quote(&input.to_string_lossy()),
            hevc_path: work_dir.join(format!("{}.hevc", video_name)),
            p8_path: work_dir.join(format!("{}.p8.hevc", video_name)),
            rpu_path: work_dir.join("RPU.bin"),
            encoded_path: work_dir.join(format!("{}.encoded.hevc", video_name)),
            injected_path: work_dir.join(format!("{}.encoded.p8.hevc", video_name)),
            output_path: work_dir.join(format!("{}.mkv", video_name)),
            tagged_path: work_dir.join(format!("tagged_{}", file_name)),
            work_dir,
            video_name,
            probe_text,
            input_bitrate_kbps: None,
            output_bitrate_kbps: None,
            variant: None,
            state: PipelineState::Pending,
            outcome: Outcome::NotConverted,
            reason: None,
            commands: BTreeMap::new(),
        }
    }

    /// Input bitrate, parsed from the probe text on first use.
    pub fn input_bitrate(&mut self) -> Option<f64> {
        if self.input_bitrate_kbps.is_none() {
            self.input_bitrate_kbps = parse_bitrate_kbps(&self.probe_text);
        }
        self.input_bitrate_kbps
    }

    /// Fill in the stage commands for `variant`.
    pub fn build_commands(&mut self, variant: Variant, encoder: &EncoderConfig) {
        self.variant = Some(variant);
        self.commands.clear();

        match variant {
            Variant::Remux => {
                self.commands
                    .insert(Stage::Extract, extract_command(&self.input, &self.hevc_path));
                self.commands
                    .insert(Stage::Convert, convert_command(&self.hevc_path, &self.p8_path));
                self.commands.insert(
                    Stage::Remux,
                    remux_command(&self.input, &self.p8_path, &self.output_path),
                );
            }
            Variant::RemuxEncodeHevc | Variant::EncodeHevc => {
                let stream = if variant == Variant::RemuxEncodeHevc {
                    self.commands
                        .insert(Stage::Convert, convert_command(&self.hevc_path, &self.p8_path));
                    self.commands.insert(
                        Stage::RemuxUnencoded,
                        remux_command(&self.input, &self.p8_path, &self.output_path),
                    );
                    self.p8_path.clone()
                } else {
                    self.hevc_path.clone()
                };
                self.commands
                    .insert(Stage::Extract, extract_command(&self.input, &self.hevc_path));
                self.commands
                    .insert(Stage::ExtractRpu, extract_rpu_command(&stream, &self.rpu_path));
                self.commands.insert(
                    Stage::Encode,
                    hevc_encode_command(encoder, &stream, &self.encoded_path),
                );
                self.commands.insert(
                    Stage::InjectRpu,
                    inject_rpu_command(&self.encoded_path, &self.rpu_path, &self.injected_path),
                );
                self.commands.insert(
                    Stage::Remux,
                    remux_command(&self.input, &self.injected_path, &self.output_path),
                );
            }
            Variant::EncodeAv1 => {
                let quality = av1_quality_value(encoder, self.input_bitrate());
                self.commands.insert(
                    Stage::Encode,
                    av1_encode_command(encoder, &self.input, &self.output_path, quality),
                );
            }
        }
    }

    /// Create the work directory and build the stage commands.
    ///
    /// The returned guard removes the work directory when dropped.
    pub fn prepare(&mut self, variant: Variant, encoder: &EncoderConfig) -> io::Result<WorkDir> {
        let guard = WorkDir::create(&self.work_dir)?;
        self.build_commands(variant, encoder);
        Ok(guard)
    }

    pub fn command(&self, stage: Stage) -> Option<&str> {
        self.commands.get(&stage).map(String::as_str)
    }

    /// Intermediate that no later stage reads once `stage` has finished.
    pub fn consumed_after(&self, stage: Stage) -> Option<&Path> {
        match (stage, self.variant?) {
            (Stage::Convert, _) => Some(&self.hevc_path),
            (Stage::Encode, Variant::EncodeHevc) => Some(&self.hevc_path),
            (Stage::InjectRpu, _) => Some(&self.encoded_path),
            _ => None,
        }
    }

    pub fn mark_success(&mut self, reason: impl Into<String>) {
        self.state = PipelineState::Success;
        self.outcome = Outcome::Success;
        self.reason = Some(reason.into());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = PipelineState::Failed;
        self.outcome = Outcome::Failed;
        self.reason = Some(reason.into());
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Name of the per-file log written after the run.
    pub fn log_name(&self) -> String {
        if self.is_success() {
            format!("{} Converted Successfully", self.video_name)
        } else {
            format!("{} Converted False", self.video_name)
        }
    }
}
