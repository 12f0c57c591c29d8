use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Source of raster frames for the capture loop.
pub trait ScreenCapture {
    fn capture_frame(&self) -> Result<DynamicImage>;
}

/// Captures by running an external screenshot tool that writes a single
/// encoded image to stdout.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a configured command line on whitespace.
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("capture_command is empty".to_string()))?;
        Ok(Self::new(program, parts.collect()))
    }
}

impl ScreenCapture for CommandCapture {
    fn capture_frame(&self) -> Result<DynamicImage> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| Error::capture(format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::capture(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(Error::capture("no display output"));
        }

        let image = image::load_from_memory(&output.stdout)?;
        debug!(width = image.width(), height = image.height(), "frame captured");
        Ok(image)
    }
}

pub fn default_capture_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "screencapture -x -t png /dev/stdout"
    } else {
        "import -window root png:-"
    }
}

/// Encodes `image` as JPEG at `quality` (1..=100).
pub fn save_jpeg(image: &DynamicImage, path: &Path, quality: u8) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    let encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn save_jpeg_writes_decodable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame.jpg");
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 9, Rgb([200, 30, 30])));

        save_jpeg(&image, &path, 80).unwrap();

        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 9));
    }

    #[test]
    fn save_jpeg_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let err = save_jpeg(&image, &dir.path().join("nope").join("f.jpg"), 80).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn command_line_is_split_into_program_and_args() {
        let capture = CommandCapture::from_command_line("grim -t png -").unwrap();
        assert_eq!(capture.program, "grim");
        assert_eq!(capture.args, vec!["-t", "png", "-"]);
        assert!(CommandCapture::from_command_line("   ").is_err());
    }

    #[test]
    fn missing_capture_program_is_collaborator_failure() {
        let capture = CommandCapture::new("tutorcap-no-such-capture-tool", vec![]);
        assert!(matches!(
            capture.capture_frame(),
            Err(Error::CollaboratorFailure { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn empty_output_means_no_display() {
        let capture = CommandCapture::new("true", vec![]);
        match capture.capture_frame() {
            Err(Error::CollaboratorFailure { message, .. }) => {
                assert!(message.contains("no display"))
            }
            other => panic!("expected no display failure, got {:?}", other.map(|_| ())),
        }
    }
}
