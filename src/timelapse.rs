//! Timelapse assembly: stages a session's screenshots as a numbered frame
//! sequence and drives an external ffmpeg-compatible encoder over it.

use serde::{Deserialize, Serialize};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{sort_by_timestamp, Screenshot};

const ENCODER_BINARY: &str = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
const FRAME_PATTERN: &str = "frame_%04d.jpg";
const STAGING_PREFIX: &str = "temp_timelapse";
const SCALE_FILTER: &str =
    "scale=1920:1080:force_original_aspect_ratio=decrease,pad=1920:1080:(ow-iw)/2:(oh-ih)/2";
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    pub crf: u8,
    pub preset: &'static str,
}

impl Quality {
    pub fn params(self) -> QualityParams {
        match self {
            Quality::High => QualityParams { crf: 18, preset: "slow" },
            Quality::Medium => QualityParams { crf: 23, preset: "medium" },
            Quality::Low => QualityParams { crf: 28, preset: "fast" },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::High => "high",
            Quality::Medium => "medium",
            Quality::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Mp4,
    Webm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatProfile {
    pub codec: &'static str,
    pub extra_args: &'static [&'static str],
    pub extension: &'static str,
}

impl VideoFormat {
    pub fn profile(self) -> FormatProfile {
        match self {
            VideoFormat::Mp4 => FormatProfile {
                codec: "libx264",
                extra_args: &["-pix_fmt", "yuv420p"],
                extension: "mp4",
            },
            VideoFormat::Webm => FormatProfile {
                codec: "libvpx-vp9",
                extra_args: &["-b:v", "1M"],
                extension: "webm",
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseSettings {
    pub fps: u32,
    pub quality: Quality,
    pub format: VideoFormat,
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            fps: 2,
            quality: Quality::Medium,
            format: VideoFormat::Mp4,
        }
    }
}

/// Builds the encoder command line for a staged sequence.
pub fn encoder_args(input_pattern: &Path, output: &Path, settings: &TimelapseSettings) -> Vec<OsString> {
    let quality = settings.quality.params();
    let profile = settings.format.profile();

    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-framerate".into(),
        settings.fps.to_string().into(),
        "-i".into(),
        input_pattern.into(),
        "-vf".into(),
        SCALE_FILTER.into(),
        "-crf".into(),
        quality.crf.to_string().into(),
        "-preset".into(),
        quality.preset.into(),
        "-c:v".into(),
        profile.codec.into(),
    ];
    args.extend(profile.extra_args.iter().map(OsString::from));
    args.push(output.into());
    args
}

/// Looks for the encoder beside the running executable, then on `PATH`.
pub fn locate_encoder() -> Option<PathBuf> {
    let local = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(ENCODER_BINARY)))
        .filter(|path| path.is_file());
    if local.is_some() {
        return local;
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(ENCODER_BINARY))
            .find(|path| path.is_file())
    })
}

/// `<student>_session_<id>_timelapse.<ext>`, with the name made path-safe.
pub fn output_file_name(student_name: &str, session_id: i64, format: VideoFormat) -> String {
    let name = if student_name.trim().is_empty() {
        "Student".to_string()
    } else {
        student_name
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '/' || c == '\\' { '_' } else { c })
            .collect()
    };
    format!(
        "{}_session_{}_timelapse.{}",
        name,
        session_id,
        format.profile().extension
    )
}

pub struct TimelapseAssembler {
    encoder: Option<PathBuf>,
}

impl TimelapseAssembler {
    pub fn new() -> Self {
        Self {
            encoder: locate_encoder(),
        }
    }

    pub fn with_encoder<P: Into<PathBuf>>(encoder: P) -> Self {
        Self {
            encoder: Some(encoder.into()),
        }
    }

    pub fn encoder(&self) -> Option<&Path> {
        self.encoder.as_deref()
    }

    /// Encodes `screenshots` into `output`. The staging directory is removed
    /// on every return path and `output` only appears after a clean encode.
    pub fn assemble(
        &self,
        screenshots: &[Screenshot],
        output: &Path,
        settings: &TimelapseSettings,
    ) -> Result<PathBuf> {
        if screenshots.len() < 2 {
            return Err(Error::InsufficientFrames {
                count: screenshots.len(),
            });
        }
        let encoder = self.encoder.as_deref().ok_or(Error::EncoderUnavailable)?;

        let mut frames = screenshots.to_vec();
        sort_by_timestamp(&mut frames);

        let parent = match output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)?;

        info!(frames = frames.len(), "preparing screenshots for timelapse");
        let staged = stage_frames(&frames, staging.path())?;
        if staged < 2 {
            return Err(Error::InsufficientFrames { count: staged });
        }

        let staged_output = staging
            .path()
            .join(format!("timelapse.{}", settings.format.profile().extension));
        let args = encoder_args(&staging.path().join(FRAME_PATTERN), &staged_output, settings);
        debug!(encoder = %encoder.display(), ?args, "running encoder");

        let result = Command::new(encoder)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => Error::EncoderUnavailable,
                _ => Error::Io(e),
            })?;

        forward_encoder_output(&result.stdout);
        let stderr = forward_encoder_output(&result.stderr);

        if !result.status.success() {
            return Err(Error::EncodingFailed {
                status: result.status.to_string(),
                message: tail_lines(&stderr, STDERR_TAIL_LINES),
            });
        }

        let produced = fs::metadata(&staged_output).map(|m| m.len()).unwrap_or(0);
        if produced == 0 {
            return Err(Error::EncodingFailed {
                status: result.status.to_string(),
                message: "encoder produced no output file".to_string(),
            });
        }

        fs::rename(&staged_output, output)?;
        info!(output = %output.display(), bytes = produced, "timelapse created");
        Ok(output.to_path_buf())
    }
}

impl Default for TimelapseAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies frames into `dir` as `frame_0001.jpg`, `frame_0002.jpg`, ...
/// Frames whose source file is gone are skipped; numbering stays contiguous.
fn stage_frames(frames: &[Screenshot], dir: &Path) -> Result<usize> {
    let mut staged = 0;
    for frame in frames {
        let target = dir.join(format!("frame_{:04}.jpg", staged + 1));
        match fs::copy(&frame.file_path, &target) {
            Ok(_) => staged += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(file = %frame.file_path.display(), "screenshot file missing, skipping frame");
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(staged)
}

/// Re-emits encoder output through the log at `info`, one event per line.
fn forward_encoder_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw).into_owned();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        info!(target: "tutorcap::encoder", "{}", line);
    }
    text
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelapseInfo {
    pub frame_count: usize,
    pub span: chrono::Duration,
    pub fps: u32,
    pub estimated_video_secs: f64,
}

/// Informational summary; nothing here feeds back into encoding.
pub fn timelapse_info(screenshots: &[Screenshot], settings: &TimelapseSettings) -> TimelapseInfo {
    let first = screenshots.iter().map(|s| s.timestamp).min();
    let last = screenshots.iter().map(|s| s.timestamp).max();
    let span = match (first, last) {
        (Some(first), Some(last)) => last - first,
        _ => chrono::Duration::zero(),
    };
    let estimated_video_secs = if settings.fps == 0 {
        0.0
    } else {
        screenshots.len() as f64 / settings.fps as f64
    };

    TimelapseInfo {
        frame_count: screenshots.len(),
        span,
        fps: settings.fps,
        estimated_video_secs,
    }
}

impl fmt::Display for TimelapseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frame_count < 2 {
            return write!(f, "Not enough screenshots for timelapse");
        }
        write!(
            f,
            "Timelapse: {} screenshots over {}s compressed into {:.1} seconds at {} fps",
            self.frame_count,
            self.span.num_seconds(),
            self.estimated_video_secs,
            self.fps
        )
    }
}
